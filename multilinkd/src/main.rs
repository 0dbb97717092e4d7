use anyhow::Result;
use multilinkd::{cli, config, runtime};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = <cli::Cli as clap::Parser>::parse();
    let config_path = match cli.config {
        Some(p) => p,
        None => config::default_config_path()?,
    };

    match cli.command.unwrap_or(cli::Command::Run) {
        cli::Command::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        cli::Command::InitConfig { force } => {
            let cfg = multilink_core::control::DaemonConfig::default();
            config::save(&config_path, &cfg, force)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        cli::Command::Run => {
            let cfg = config::load(&config_path)?;
            let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            runtime::run_daemon(cfg, stop_rx, Box::new(|m| tracing::info!("{m}"))).await
        }
    }
}
