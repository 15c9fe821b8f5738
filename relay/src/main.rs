use std::net::SocketAddr;
use std::sync::Arc;

use clap::{AppSettings, Clap};
use tracing::info;
use tracing_subscriber::EnvFilter;
use warp::Filter;

use troparcel_relay::{api, config::RelayConfig, server::SharedState, store::RoomStore, ws};

#[derive(Clap)]
#[clap(setting = AppSettings::ColoredHelp)]
struct Opts {
    /// Overrides PORT.
    #[clap(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let opts = Opts::parse();

    let mut config = RelayConfig::from_env();
    if let Some(port) = opts.port {
        config.port = port;
    }

    let store = RoomStore::open(&config.persistence_dir)?;
    let state = Arc::new(SharedState::new(&config, store));

    spawn_compaction_loop(state.clone(), config.compaction_interval);
    spawn_idle_sweep_loop(state.clone());

    let ws_state = state.clone();
    let ws_route = warp::path::param::<String>()
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::query::<std::collections::HashMap<String, String>>())
        .and(warp::addr::remote())
        .and(warp::any().map(move || ws_state.clone()))
        .map(|room: String, websocket: warp::ws::Ws, query: std::collections::HashMap<String, String>, remote: Option<SocketAddr>, state: Arc<SharedState>| {
            let room = crate_room_name(&room);
            let token = query.get("token").cloned();
            websocket.on_upgrade(move |socket| ws::handle_connection(socket, room, token, remote, state))
        });

    let routes = ws_route.or(api::routes(state.clone()));

    let addr = SocketAddr::new(config.host, config.port);
    info!(%addr, "starting relay");

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let (_addr, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async move {
        let _ = rx.await;
    });

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        let _ = tx.send(());
    });

    server.await;
    state.flush_all();
    info!("relay stopped");
    Ok(())
}

fn crate_room_name(raw: &str) -> String {
    troparcel_relay::room::sanitise_room_name(raw)
}

fn spawn_compaction_loop(state: Arc<SharedState>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = state.clock_unix_secs();
            let reports = troparcel_relay::compaction::compact_all(&state.registry, &state.store, state.tombstone_max_age, now);
            info!(rooms = reports.len(), "periodic compaction pass complete");
        }
    });
}

fn spawn_idle_sweep_loop(state: Arc<SharedState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let swept = state.registry.sweep_idle();
            if !swept.is_empty() {
                info!(rooms = ?swept, "swept idle rooms");
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
