//! A running north connector: cache, connection and delivery loop.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use connector_core::{ConnectionConfig, ConnectionManager, ConnectionState, Connectable};
use north_cache::{CachedFile, ErrorStore, PointValue};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::coordinator::CacheCoordinator;
use super::delivery::{DeliveryLoop, RunReport};
use super::sink::Sink;
use crate::Result;
use crate::config::NorthSettings;
use crate::metrics::{MetricsEvent, MetricsSender, emit};

pub struct NorthConnector {
    settings: NorthSettings,
    coordinator: Arc<CacheCoordinator>,
    connection: ConnectionManager,
    delivery: Arc<DeliveryLoop>,
    events: MetricsSender,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NorthConnector {
    pub fn new(
        settings: NorthSettings,
        sink: Arc<dyn Sink>,
        data_folder: &Path,
        error_store: Arc<ErrorStore>,
        events: MetricsSender,
    ) -> Self {
        let coordinator = Arc::new(CacheCoordinator::new(
            settings.id.clone(),
            data_folder,
            settings.caching.clone(),
            error_store,
            events.clone(),
        ));

        let connection = ConnectionManager::new(
            ConnectionConfig::new(settings.id.clone())
                .with_retry_interval(settings.caching.retry_interval())
                .with_enabled(settings.enabled),
            Arc::new(sink.clone()) as Arc<dyn Connectable>,
        );

        let delivery = Arc::new(DeliveryLoop::new(
            coordinator.clone(),
            sink,
            connection.clone(),
            events.clone(),
        ));

        Self {
            settings,
            coordinator,
            connection,
            delivery,
            events,
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn settings(&self) -> &NorthSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn coordinator(&self) -> &Arc<CacheCoordinator> {
        &self.coordinator
    }

    /// Whether values and files from `south_id` go to this connector.
    ///
    /// An empty subscription list subscribes to every south connector.
    pub fn is_subscribed(&self, south_id: &str) -> bool {
        self.settings.enabled
            && (self.settings.subscribed_to.is_empty()
                || self.settings.subscribed_to.iter().any(|s| s == south_id))
    }

    /// Recover the caches, connect and start the background tasks.
    ///
    /// The caches are recovered even for a disabled connector so data
    /// acquired earlier stays on disk untouched.
    pub async fn start(&self) -> Result<()> {
        let span = info_span!("north", connector = %self.settings.id);
        self.coordinator.start().instrument(span.clone()).await?;

        if !self.settings.enabled {
            info!(connector = %self.settings.id, "North connector disabled");
            return Ok(());
        }

        let mut tasks = Vec::new();
        tasks.push(self.spawn_connection_watcher());
        if let Some(sweeper) = self
            .coordinator
            .start_archive_sweeper(self.cancel_token.child_token())
        {
            tasks.push(sweeper);
        }
        tasks.push(self.delivery.spawn(self.cancel_token.child_token()));
        self.tasks.lock().extend(tasks);

        self.connection.start().instrument(span).await;
        info!(
            connector = %self.settings.id,
            driver = self.settings.driver.type_name(),
            state = %self.connection.state(),
            "North connector started"
        );
        Ok(())
    }

    /// Stop delivery, then tear down the connection.
    ///
    /// A run in flight completes first; data that was not acknowledged stays
    /// in the cache.
    pub async fn stop(&self) {
        self.cancel_token.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(connector = %self.settings.id, error = %e, "North task ended abnormally");
            }
        }
        self.connection.stop().await;
        info!(connector = %self.settings.id, "North connector stopped");
    }

    pub async fn add_values(&self, source_id: &str, values: Vec<PointValue>) -> Result<usize> {
        self.coordinator.add_values(source_id, values).await
    }

    pub async fn add_content(&self, path: &Path) -> Result<CachedFile> {
        self.coordinator.add_content(path).await
    }

    /// Run one delivery pass right away.
    pub async fn run_once(&self) -> RunReport {
        self.delivery.run_once().await
    }

    fn spawn_connection_watcher(&self) -> JoinHandle<()> {
        let mut transitions = self.connection.transitions();
        let events = self.events.clone();
        let connector_id = self.settings.id.clone();
        let cancel_token = self.cancel_token.child_token();

        tokio::spawn(async move {
            loop {
                let state = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    received = transitions.recv() => match received {
                        Ok(state) => state,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(connector = %connector_id, skipped, "Connection watcher lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if state == ConnectionState::Connected {
                    emit(
                        &events,
                        MetricsEvent::Connected {
                            connector_id: connector_id.clone(),
                            timestamp: Utc::now(),
                        },
                    );
                }
            }
        })
    }
}
