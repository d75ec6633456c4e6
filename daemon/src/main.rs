mod config;
mod db;
mod engine;
mod event;
mod index;
mod ipc;
mod paths;
mod process;
mod session;
mod ws;

use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::engine::Engine;
use crate::event::{DaemonEvent, EngineCommand};
use crate::index::DetectionIndex;
use crate::session::SessionRegistry;

#[tokio::main]
async fn main() {
    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = paths::app_data_dir();
    if let Err(e) = std::fs::create_dir_all(&app_dir) {
        eprintln!("Failed to create app data directory {}: {e}", app_dir.display());
        std::process::exit(1);
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path();
    let mut config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        eprintln!("[config] Error (using defaults): {e}");
        config::Config::default()
    });
    config.apply_env();
    config::set_debug(config.debug);

    // ── Games database ────────────────────────────────────────────────────────
    let database_path = config
        .database_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(paths::database_file_path);
    let games = db::load(&database_path).await;
    println!("[db] {} detectable games loaded", games.len());

    // ── Process scanner ───────────────────────────────────────────────────────
    let source = match process::platform_source() {
        Ok(source) => source,
        Err(e) => {
            eprintln!("[process] {e:#}");
            std::process::exit(1);
        }
    };

    // ── Transports (binding failures are fatal) ───────────────────────────────
    let ipc_server = match ipc::IpcServer::bind().await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("[ipc] {e:#}");
            std::process::exit(1);
        }
    };
    let ws_server = match ws::WsServer::bind().await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("[ws] {e:#}");
            std::process::exit(1);
        }
    };

    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(64);
    let (command_tx, command_rx) = mpsc::channel::<EngineCommand>(4);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(ipc_server.serve(event_tx.clone()));
    tokio::spawn(ws_server.serve(event_tx.clone()));
    tokio::spawn(engine::run(
        Engine::new(DetectionIndex::build(games)),
        source,
        event_tx.clone(),
        command_rx,
    ));
    tokio::spawn(db::refresh_periodically(database_path, command_tx));

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(DaemonEvent::Shutdown).await;
            }
        });
    }

    println!("presenced v{} started", env!("CARGO_PKG_VERSION"));

    // ── Dispatch loop ─────────────────────────────────────────────────────────
    let mut registry = SessionRegistry::new();

    while let Some(evt) = event_rx.recv().await {
        match evt {
            DaemonEvent::Connection(handle) => {
                println!(
                    "[session] Client {} connected as session {}",
                    handle.client_id, handle.id
                );
                registry.insert(handle);
            }

            DaemonEvent::Message { session_id, payload } => {
                // Inbound RPC commands are observed but not acted on.
                if config::debug_enabled() {
                    eprintln!(
                        "[session] Session {session_id} sent {}",
                        payload["cmd"].as_str().unwrap_or("<no cmd>")
                    );
                }
            }

            DaemonEvent::SessionClosed { session_id } => {
                registry.remove(session_id);
                println!("[session] Session {session_id} closed ({} open)", registry.len());
            }

            DaemonEvent::Activity(transition) => registry.dispatch(&transition),

            DaemonEvent::Shutdown => {
                println!("Shutting down");
                registry.close_all();
                // Let connection tasks flush their close frames before exit.
                registry
                    .drain(&mut event_rx, std::time::Duration::from_millis(250))
                    .await;
                break;
            }
        }
    }
}
