use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use media_sync::{
    platform_probe, scan_library, CatalogStore, JobStore, MediaSyncService, ServiceParts, SqliteStore, StoreConfig,
    YtDlpExecutor,
};

use crate::config::MediaSyncConfig;
use crate::routes::{router, AppState, RouterOptions};
use crate::telemetry::MediaSyncMetrics;

/// Stored on jobs that were still running when the daemon last stopped
const INTERRUPTED_MESSAGE: &str = "interrupted by daemon restart";

pub struct MediaSyncDaemon {
    config: MediaSyncConfig,
    store: Arc<SqliteStore>,
    service: MediaSyncService,
    metrics: MediaSyncMetrics,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl MediaSyncDaemon {
    pub async fn new(config: MediaSyncConfig) -> Result<Self> {
        info!("Initializing media sync daemon");

        config.validate()?;

        tokio::fs::create_dir_all(&config.library.root)
            .await
            .with_context(|| format!("creating library root {}", config.library.root.display()))?;
        tokio::fs::create_dir_all(&config.library.data_dir)
            .await
            .with_context(|| format!("creating data dir {}", config.library.data_dir.display()))?;

        let store = Arc::new(
            SqliteStore::connect(StoreConfig::file(config.database_path()), config.library.root.clone()).await?,
        );
        info!(database = %config.database_path().display(), "Catalog opened");

        let interrupted = store.fail_unfinished(INTERRUPTED_MESSAGE).await?;
        if interrupted > 0 {
            warn!(interrupted, "Marked unfinished acquisition jobs as failed");
        }

        if config.library.scan_on_start {
            let filter = config.audio_filter()?;
            match scan_library(store.as_ref(), &config.library.root, &filter).await {
                Ok(added) => info!(added, "Library scanned"),
                Err(e) => error!(error = %e, "Library scan failed"),
            }
        }

        let catalog: Arc<dyn CatalogStore> = store.clone();
        let jobs: Arc<dyn JobStore> = store.clone();
        let service = MediaSyncService::new(
            config.service_options()?,
            ServiceParts {
                probe: platform_probe(config.probe_options()),
                catalog,
                jobs,
                executor: Arc::new(YtDlpExecutor::new(config.downloader_options())),
            },
        );

        Ok(Self {
            config,
            store,
            service,
            metrics: MediaSyncMetrics::new()?,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn service(&self) -> &MediaSyncService {
        &self.service
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<()> {
        info!("Starting media sync daemon");

        self.tasks
            .push(("device_monitor", self.service.start_monitor(self.cancel.child_token())));

        if self.config.telemetry.metrics.enabled {
            let handle = self.metrics.spawn_recorder(
                self.service.events().clone(),
                self.service.subscribe(),
                self.config.telemetry.metrics.refresh_interval,
                self.cancel.child_token(),
            );
            self.tasks.push(("metrics_recorder", handle));
        }

        let addr = self.config.socket_addr()?;
        let app = router(
            AppState {
                service: self.service.clone(),
                metrics: self.metrics.clone(),
            },
            RouterOptions {
                cors_allow_any: self.config.server.cors_allow_any,
                metrics_enabled: self.config.telemetry.metrics.enabled,
                thumbnail_dir: self.config.thumbnail_dir(),
            },
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        info!(%addr, library = %self.config.library.root.display(), "Control surface listening");

        let shutdown = self.cancel.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        });

        info!("Media sync daemon started successfully");

        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                Ok(())
            }
            result = &mut server => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::from(e).context("control surface failed")),
                Err(e) => Err(anyhow::Error::from(e).context("control surface task panicked")),
            },
        };

        self.shutdown().await;
        if !server.is_finished() {
            let _ = server.await;
        }
        info!("Media sync daemon stopped");
        outcome
    }

    async fn shutdown(&mut self) {
        info!("Shutting down daemon");
        self.cancel.cancel();

        for (name, handle) in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Background task ended abnormally");
            }
        }

        self.store.pool().close().await;
    }
}
