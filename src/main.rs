use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use icli_serve::{serve_local, Icli, SshOptions, SshServer, Term};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Example interactive CLI that echoes every line back.
#[derive(Debug, Parser)]
#[command(name = "icli-serve", version)]
struct Cli {
    /// Address to serve SSH on instead of stdin/stdout
    #[arg(long = "serve-ssh", env = "ICLI_SERVE_SSH", value_name = "HOST:PORT")]
    serve_ssh: Option<String>,

    /// Private host key presented to SSH clients
    #[arg(
        long = "host-key",
        env = "ICLI_HOST_KEY",
        default_value = "./example_host_key_rsa"
    )]
    host_key: PathBuf,

    /// Seconds a client may take to finish the SSH handshake (0 = no limit)
    #[arg(long = "handshake-timeout", env = "ICLI_HANDSHAKE_TIMEOUT_SECS", default_value = "30")]
    handshake_timeout: u64,
}

struct EchoCli;

#[async_trait]
impl Icli for EchoCli {
    async fn run(&self, term: &mut dyn Term) {
        loop {
            if term.write_err(b"> ").await.is_err() {
                return;
            }
            let text = match term.read_line().await {
                Ok(text) => text,
                Err(e) => {
                    if !e.is_eof() {
                        tracing::error!("Error reading from stream: {}", e);
                    }
                    return;
                }
            };

            if text.to_lowercase() == "quit" {
                return;
            }

            let reply = format!("Server: {}\n", text);
            if term.write_out(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Logs go to stderr so they never mix with the local terminal
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "icli_serve=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let Some(addr) = cli.serve_ssh else {
        serve_local(&EchoCli).await;
        return Ok(());
    };

    let mut options = SshOptions::new(addr, cli.host_key);
    options.handshake_timeout =
        (cli.handshake_timeout > 0).then(|| Duration::from_secs(cli.handshake_timeout));

    let server = SshServer::bind(Arc::new(EchoCli), options)
        .await
        .context("Failed to start SSH server")?;
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}
