//! TFTP Server - Main executable
//!
//! Serves the contents of one file to every TFTP read request, whatever
//! filename the client asks for.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{TftpServer, TftpServerConfig, TransferConfig};
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND: &str = "0.0.0.0:6969"; // use 6969 for non-root testing; redirect or run as root for :69

#[derive(FromArgs, Debug)]
#[argh(
    description = "Read-only TFTP server that answers every request with the same payload",
    example = "Serve a boot image on the standard port:\n  {command_name} --payload ./pxelinux.0 --address 0.0.0.0:69",
    example = "Bind transfer sockets to one interface address:\n  {command_name} --payload ./ipxe.efi --local-ip 10.0.1.50"
)]
struct CliConfig {
    #[argh(option, short = 'p', description = "file whose contents are served to every client")]
    payload: PathBuf,

    #[argh(
        option,
        short = 'a',
        description = "listen address",
        default = "DEFAULT_BIND.to_string()"
    )]
    address: String,

    #[argh(option, short = 'r', description = "transmissions per block before giving up", default = "10")]
    retries: usize,

    #[argh(option, short = 't', description = "seconds to wait for each acknowledgment", default = "6")]
    timeout: u64,

    #[argh(option, short = 'm', description = "maximum concurrent transfers", default = "64")]
    max_transfers: usize,

    #[argh(option, short = 'l', description = "local IP address for transfer sockets")]
    local_ip: Option<String>,
}

impl CliConfig {
    fn into_server_config(self) -> Result<(TftpServerConfig, PathBuf)> {
        let local_bind = self
            .local_ip
            .as_deref()
            .map(|ip| ip.parse::<IpAddr>().with_context(|| format!("Invalid local IP: {}", ip)))
            .transpose()?;

        let config = TftpServerConfig {
            bind_address: self.address,
            transfer_config: TransferConfig {
                timeout: Duration::from_secs(self.timeout),
                max_retries: self.retries,
                local_bind,
            },
            max_transfers: self.max_transfers,
        };

        Ok((config, self.payload))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli_config: CliConfig = argh::from_env();
    let (config, payload_path) = cli_config.into_server_config()?;

    let payload = tokio::fs::read(&payload_path)
        .await
        .with_context(|| format!("Failed to read payload file {}", payload_path.display()))?;
    tracing::info!("Loaded {} bytes from {}", payload.len(), payload_path.display());

    let mut server = TftpServer::new(config, payload);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliConfig {
        CliConfig::from_args(&["tftp-server"], args).unwrap()
    }

    #[test]
    fn test_cli_defaults() {
        let (config, path) = parse(&["--payload", "boot.img"]).into_server_config().unwrap();

        assert_eq!(path, PathBuf::from("boot.img"));
        assert_eq!(config.bind_address, DEFAULT_BIND);
        assert_eq!(config.max_transfers, 64);
        assert_eq!(config.transfer_config, TransferConfig::default());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = parse(&["-p", "boot.img", "-a", "127.0.0.1:69", "-r", "3", "-t", "1", "-m", "8", "-l", "10.0.1.50"]);
        let (config, _) = cli.into_server_config().unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:69");
        assert_eq!(config.max_transfers, 8);
        assert_eq!(config.transfer_config.max_retries, 3);
        assert_eq!(config.transfer_config.timeout, Duration::from_secs(1));
        assert_eq!(config.transfer_config.local_bind, Some("10.0.1.50".parse().unwrap()));
    }

    #[test]
    fn test_cli_rejects_bad_local_ip() {
        let cli = parse(&["--payload", "boot.img", "--local-ip", "not-an-ip"]);
        assert!(cli.into_server_config().is_err());
    }
}
