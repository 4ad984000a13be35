use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use blob_store::{DirStorage, StorageBackend};
use metrics::init_provider;
use state_store::{index::InMemoryIndex, BlobdState};
use tokio::{self, signal, sync::watch};
use tracing::info;

use crate::{
    config::ServerConfig,
    gc::Gc,
    routes::{create_routes, RouteState},
};

pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub blobd_state: Arc<BlobdState>,
    pub gc: Arc<Gc>,
}

impl Service {
    /// Builds the whole store and restores the index from disk. Restore runs
    /// to completion here, before any listener exists.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let storage: Arc<dyn StorageBackend> = Arc::new(
            DirStorage::new(&config.data_dir)
                .await
                .context("error initializing blob data root")?,
        );

        let blobd_state = Arc::new(BlobdState::new(
            Arc::new(InMemoryIndex::default()),
            storage.clone(),
        ));
        let report = blobd_state
            .restore(config.unknown_blob_policy, config.restore_clean)
            .await
            .context("error restoring blob state")?;
        info!(
            restored = report.restored,
            failed = report.failed,
            cleaned = report.cleaned,
            "blob state restored"
        );

        let gc = Arc::new(Gc::new(
            storage,
            Duration::from_secs(config.gc_interval_secs),
            config.unknown_blob_policy,
            shutdown_rx,
        ));

        Ok(Self {
            config,
            shutdown_tx,
            blobd_state,
            gc,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        let registry = init_provider();
        let route_state = RouteState {
            blobd_state: self.blobd_state.clone(),
            registry: Arc::new(registry),
            metrics: Arc::new(metrics::api_io_stats::Metrics::new()),
        };

        let gc = self.gc.clone();
        tokio::spawn(async move {
            gc.start().await;
        });

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(route_state);
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    shutdown_tx.send(()).unwrap();
    info!("signal received, shutting down server gracefully");
}
