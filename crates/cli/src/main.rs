mod config;
mod request;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tollgate_gatekeeper::AppContext;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::CliConfig;

/// Reads one JSON request per line on stdin and writes one JSON outcome per
/// line on stdout.
///
/// Usage: `tollgate [config.yaml] [resources.yaml]`
#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only outcomes.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .unwrap_or_else(|| "config/tollgate.yaml".to_string());
    let resources_path = args.next();

    info!(config_path = %config_path, "starting tollgate");

    let cli_config = CliConfig::load(&config_path, resources_path.as_deref())?;
    info!(
        path = %cli_config.config_path.display(),
        backend = ?cli_config.config.store.backend,
        resources = cli_config.resources.len(),
        "configuration loaded"
    );
    let ctx = AppContext::bootstrap(cli_config.config)?;
    for (key, metadata) in cli_config.resources {
        ctx.resources.insert(key, metadata);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut handled = 0u64;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let output = match request::parse(&line) {
            Ok(inbound) => {
                handled += 1;
                serde_json::to_string(&request::handle(&ctx, inbound).await)?
            }
            Err(e) => {
                warn!(error = %e, "unreadable request line");
                serde_json::json!({ "error": format!("invalid request: {}", e) }).to_string()
            }
        };
        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    info!(handled, metrics = %ctx.metrics.render(), "input closed, shutting down");
    ctx.shutdown().await;
    Ok(())
}
