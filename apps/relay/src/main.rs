//! tracerelay entry point.
//!
//! Usage: `tracerelay [CONFIG] [--once]`

mod app;
mod config;

use tracing_subscriber::EnvFilter;

use crate::app::Mode;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting tracerelay");

    let args = parse_args(std::env::args().skip(1))?;
    let path = config::config_path(args.config.as_deref());
    let config = config::Config::load(&path)?;
    tracing::info!(path = %path.display(), "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, args.mode))?;

    tracing::info!("relay shut down cleanly");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    config: Option<String>,
    mode: Mode,
}

fn parse_args(args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut parsed = Args {
        config: None,
        mode: Mode::Daemon,
    };
    for arg in args {
        if arg == "--once" {
            parsed.mode = Mode::Once;
        } else if arg.starts_with("--") {
            anyhow::bail!("unknown option {arg}");
        } else if parsed.config.is_some() {
            anyhow::bail!("unexpected argument {arg}");
        } else {
            parsed.config = Some(arg);
        }
    }
    Ok(parsed)
}
