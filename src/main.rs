mod batch;
mod collector;
mod config;
mod drain;
mod dumper;
mod listener;
mod sender;


use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use collector::Collector;
use config::Config;
use dumper::FileDumper;
use sender::{ClusterSender, Sender};

/// Exceptional init failure: log and exit.
fn fatal(msg: &str, error: &dyn std::fmt::Display) -> ! {
    error!(%error, "{msg}");
    std::process::exit(1);
}

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    let level = std::env::var("CLICKHOUSE_BULK_LOG_LEVEL")
        .ok()
        .and_then(|val| {
            val.parse::<LevelFilter>().ok().or_else(|| {
                eprintln!("invalid CLICKHOUSE_BULK_LOG_LEVEL: {val:?}, defaulting to WARN");
                None
            })
        })
        .unwrap_or(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(level)
        .with(tracing_microjson::JsonLayer::new(std::io::stderr).with_target(true))
        .init();
}

fn setup_rustls() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls ring provider");
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() {
    if std::env::args().nth(1).as_deref() == Some("version") {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return;
    }

    setup_logging();
    setup_rustls();

    let config = Config::from_env().unwrap_or_else(|e| fatal("config error", &e));

    let dumper = Arc::new(FileDumper::new(&config.dump_dir));
    let mut cluster =
        ClusterSender::new(&config).unwrap_or_else(|e| fatal("failed to build HTTP client", &e));
    for server in &config.servers {
        cluster
            .add_server(server.as_str())
            .unwrap_or_else(|e| fatal("failed to register server", &e));
    }
    cluster.set_dumper(Arc::clone(&dumper));
    let sender = Arc::new(cluster);

    let cancel = CancellationToken::new();
    let collector = Collector::from_config(Arc::clone(&sender), &config);
    let ticker = collector.spawn_ticker(cancel.clone());
    let replay = config.dump_check_interval.map(|interval| {
        Arc::clone(&dumper).spawn_replay(Arc::clone(&sender), interval, cancel.clone())
    });

    let tcp = listener::bind(config.listener_port)
        .await
        .unwrap_or_else(|e| fatal("failed to start listener", &e));
    let listener_task = tokio::spawn(listener::serve(tcp, collector.clone(), cancel.clone()));
    info!(
        port = config.listener_port,
        servers = config.servers.len(),
        dump_dir = %dumper.path().display(),
        "relay started"
    );

    shutdown_signal().await;
    info!("shutdown signal received");

    cancel.cancel();
    let _ = listener_task.await;
    let _ = ticker.await;
    if let Some(replay) = replay {
        let _ = replay.await;
    }

    if let Err(e) = drain::drain(&collector, Some(dumper.as_ref()), config.shutdown_timeout).await {
        error!(error = %e, "shutdown incomplete");
        std::process::exit(1);
    }
}
