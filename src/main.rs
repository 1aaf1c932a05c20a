//! CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sshveil::cli::{build_session, Cli, Mode};
use sshveil::config::ProfileStorage;
use sshveil::supervisor::{LifecycleState, Supervisor};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match cli.mode {
        Mode::Gui => {
            eprintln!(
                "the graphical front-end ships separately and is not part of this build;\n\
                 run `sshveil cli --help` for the terminal mode"
            );
            ExitCode::from(2)
        }
        Mode::Cli => run_cli(cli).await,
    }
}

async fn run_cli(cli: Cli) -> ExitCode {
    let storage = match ProfileStorage::new() {
        Ok(storage) => Some(storage),
        Err(e) => {
            warn!("profile storage unavailable: {}", e);
            None
        }
    };

    let saved = match &storage {
        Some(storage) => match storage.load().await {
            Ok(saved) => saved,
            Err(e) => {
                warn!("could not load saved profile: {}", e);
                None
            }
        },
        None => None,
    };

    let cfg = match build_session(&cli, saved.as_ref()) {
        Ok(cfg) => cfg,
        Err(msg) => {
            eprintln!("error: {msg}");
            return ExitCode::from(2);
        }
    };

    info!("target {}@{}", cfg.target.user, cfg.target.endpoint);
    if let Some(jump) = &cfg.jump {
        info!("via jump host {}@{}", jump.user, jump.endpoint);
    }

    if !cli.no_save {
        if let Some(storage) = &storage {
            match storage.save(&cfg).await {
                Ok(()) => info!("profile saved to {:?}", storage.path()),
                Err(e) => warn!("could not save profile: {}", e),
            }
        }
    }

    let supervisor = Supervisor::new();
    if let Err(e) = supervisor.start(cfg).await {
        error!("start failed: {}", e);
        return ExitCode::from(1);
    }

    if let Some((socks_addr, http_addr)) = supervisor.listen_addrs().await {
        info!("SOCKS5 proxy: {}", socks_addr);
        info!("HTTP proxy:   {}", http_addr);
    }
    info!("tunnel established, press Ctrl-C to disconnect");

    let code = wait_until_done(&supervisor).await;
    supervisor.stop().await;
    code
}

/// Block until Ctrl-C or the session dies, printing a stats line.
async fn wait_until_done(supervisor: &Supervisor) -> ExitCode {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("signal handler failed: {}", e);
                }
                println!();
                info!("disconnecting");
                return ExitCode::SUCCESS;
            }
            _ = ticker.tick() => {
                let status = supervisor.status();
                if status.state != LifecycleState::Running {
                    error!(
                        "session ended: {}",
                        status.last_error.unwrap_or_else(|| "unknown reason".into())
                    );
                    return ExitCode::from(1);
                }
                let c = status.counters;
                print!(
                    "\r  up {:>8.1} MiB   down {:>8.1} MiB   active {:>4}   total {:>6} ",
                    c.bytes_up as f64 / (1024.0 * 1024.0),
                    c.bytes_down as f64 / (1024.0 * 1024.0),
                    c.active_relays,
                    c.total_relays,
                );
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
        }
    }
}
