//! Simple TFTP client for fetching a payload from a running server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{ReadRequest, TransferConfig};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

#[derive(FromArgs, Debug)]
#[argh(description = "Download a file from a TFTP server")]
struct FetchArgs {
    #[argh(option, short = 's', description = "server address", default = "\"127.0.0.1:6969\".to_string()")]
    server: String,

    #[argh(option, short = 'f', description = "filename to request", default = "\"payload\".to_string()")]
    filename: String,

    #[argh(option, short = 'o', description = "write to this file instead of stdout")]
    output: Option<PathBuf>,

    #[argh(option, description = "transmissions per packet before giving up", default = "10")]
    retries: usize,

    #[argh(option, description = "seconds to wait for each reply", default = "6")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: FetchArgs = argh::from_env();
    let server: SocketAddr = args
        .server
        .parse()
        .with_context(|| format!("Invalid server address: {}", args.server))?;

    let config = TransferConfig {
        timeout: Duration::from_secs(args.timeout),
        max_retries: args.retries,
        local_bind: None,
    };

    let payload = tftp::client::download(server, &ReadRequest::new(args.filename.as_str()), &config).await?;
    tracing::info!("Received {} bytes from {}", payload.len(), server);

    match args.output {
        Some(path) => tokio::fs::write(&path, &payload)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&payload).await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}
