use clap::Parser;
use color_eyre::Result;
use serial_hub::{bridge::Bridge, cli, config::Config, logging};
use tracing::{debug, info};

#[cfg(unix)]
async fn hangup() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::hangup()) {
        Ok(mut hangup) => {
            hangup.recv().await;
        }
        Err(e) => {
            debug!(%e, "No hangup signal on this system");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn hangup() {
    std::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = cli::Cli::parse();

    if let Some(command) = cli.command.take() {
        cli::handle_command(command);

        return Ok(());
    }

    let file_logging = cli.log_dir.clone().map(|dir| (cli.log_level, dir));
    logging::init(cli.log_level, file_logging).await;

    let mut config = if let Some(config_path) = &cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)
    } else {
        debug!("Default config");
        Config::default()
    };

    cli.apply_overrides(&mut config);

    let bridge = Bridge::new(config);
    bridge.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        _ = hangup() => {
            info!("Told to hang up, quitting")
        }
        _ = bridge.wait_closed() => {
            info!("A session asked us to exit")
        }
    }

    bridge.shutdown().await;
    logging::shutdown();

    Ok(())
}
