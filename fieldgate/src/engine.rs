//! Builds and runs every configured connector.
//!
//! Startup order is north first, so that a south connector never acquires
//! data before its destinations can cache it. Shutdown is the reverse.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use connector_core::ConnectorError;
use futures::future::join_all;
use north_cache::{ErrorStore, PointValue};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::GatewayConfig;
use crate::metrics::{MetricsCollector, MetricsSender, metrics_channel};
use crate::north::{NorthConnector, build_sink};
use crate::south::{AcquisitionSink, SouthConnector, build_source};

/// Fans acquired data out to the subscribed north connectors.
pub struct Router {
    norths: Vec<Arc<NorthConnector>>,
}

impl Router {
    pub fn new(norths: Vec<Arc<NorthConnector>>) -> Self {
        Self { norths }
    }

    fn subscribers<'a>(
        &'a self,
        source_id: &'a str,
    ) -> impl Iterator<Item = &'a Arc<NorthConnector>> {
        self.norths.iter().filter(move |n| n.is_subscribed(source_id))
    }

    /// Reduce per-north results: the data is accepted when any subscriber
    /// cached it.
    fn settle(source_id: &str, attempted: usize, accepted: usize) -> connector_core::Result<()> {
        if attempted == 0 {
            return Err(ConnectorError::other(format!(
                "no north connector subscribed to '{source_id}'"
            )));
        }
        if accepted == 0 {
            return Err(ConnectorError::other("every north connector refused the data"));
        }
        Ok(())
    }
}

#[async_trait]
impl AcquisitionSink for Router {
    async fn add_values(
        &self,
        source_id: &str,
        values: Vec<PointValue>,
    ) -> connector_core::Result<()> {
        let (mut attempted, mut accepted) = (0, 0);
        for north in self.subscribers(source_id) {
            attempted += 1;
            match north.add_values(source_id, values.clone()).await {
                Ok(_) => accepted += 1,
                Err(e) => error!(north = %north.id(), south = %source_id, error = %e, "Values not cached"),
            }
        }
        Self::settle(source_id, attempted, accepted)
    }

    async fn add_content(&self, source_id: &str, path: &Path) -> connector_core::Result<()> {
        let (mut attempted, mut accepted) = (0, 0);
        for north in self.subscribers(source_id) {
            attempted += 1;
            match north.add_content(path).await {
                Ok(file) => {
                    accepted += 1;
                    debug!(north = %north.id(), cached = %file.cached_name(), "File cached");
                }
                Err(e) => error!(
                    north = %north.id(),
                    south = %source_id,
                    file = %path.display(),
                    error = %e,
                    "File not cached"
                ),
            }
        }
        Self::settle(source_id, attempted, accepted)
    }
}

pub struct Engine {
    norths: Vec<Arc<NorthConnector>>,
    souths: Vec<Arc<SouthConnector>>,
    collector: Arc<MetricsCollector>,
    events: MetricsSender,
    error_store: Arc<ErrorStore>,
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Start every enabled connector of `config`.
    ///
    /// A connector whose settings or driver cannot be built is logged and
    /// skipped; the others still start.
    pub async fn start(config: &GatewayConfig) -> Result<Self> {
        let data_folder = config.engine.data_folder.as_path();
        let error_store = Arc::new(ErrorStore::new(data_folder.join("error")));
        let (events, events_rx) = metrics_channel();
        let cancel_token = CancellationToken::new();

        let collector = Arc::new(MetricsCollector::new());
        let tasks = vec![collector.start(events_rx, cancel_token.child_token())];

        let mut norths = Vec::new();
        for settings in &config.north {
            let built = settings
                .validate()
                .and_then(|()| build_sink(settings, config))
                .map(|sink| {
                    NorthConnector::new(
                        settings.clone(),
                        sink,
                        data_folder,
                        error_store.clone(),
                        events.clone(),
                    )
                });
            let north = match built {
                Ok(north) => Arc::new(north),
                Err(e) => {
                    error!(connector = %settings.id, error = %e, "North connector skipped");
                    continue;
                }
            };
            if let Err(e) = north.start().await {
                error!(connector = %settings.id, error = %e, "North connector failed to start");
                continue;
            }
            norths.push(north);
        }

        let router: Arc<dyn AcquisitionSink> = Arc::new(Router::new(norths.clone()));

        let mut souths = Vec::new();
        for settings in &config.south {
            let source = match settings.validate().and_then(|()| build_source(settings)) {
                Ok(source) => source,
                Err(e) => {
                    error!(connector = %settings.id, error = %e, "South connector skipped");
                    continue;
                }
            };
            if !norths.iter().any(|n| n.is_subscribed(&settings.id)) {
                warn!(connector = %settings.id, "No north connector subscribed; acquired data will stay at the source");
            }
            let south = Arc::new(SouthConnector::new(settings.clone(), source, router.clone()));
            south.start().await;
            souths.push(south);
        }

        info!(
            engine = %config.engine.name,
            north = norths.len(),
            south = souths.len(),
            data_folder = %data_folder.display(),
            "Engine started"
        );

        Ok(Self {
            norths,
            souths,
            collector,
            events,
            error_store,
            cancel_token,
            tasks,
        })
    }

    pub fn norths(&self) -> &[Arc<NorthConnector>] {
        &self.norths
    }

    pub fn north(&self, id: &str) -> Option<&Arc<NorthConnector>> {
        self.norths.iter().find(|n| n.id() == id)
    }

    pub fn souths(&self) -> &[Arc<SouthConnector>] {
        &self.souths
    }

    pub fn south(&self, id: &str) -> Option<&Arc<SouthConnector>> {
        self.souths.iter().find(|s| s.id() == id)
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    pub fn events(&self) -> &MetricsSender {
        &self.events
    }

    pub fn error_store(&self) -> &Arc<ErrorStore> {
        &self.error_store
    }

    /// Stop acquisition, then delivery, then the background tasks.
    pub async fn stop(self) {
        join_all(self.souths.iter().map(|s| s.stop())).await;
        join_all(self.norths.iter().map(|n| n.stop())).await;
        self.cancel_token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Engine task ended abnormally");
            }
        }
        info!("Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NorthDriverConfig, NorthSettings};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bad_connector_skipped() {
        let dir = TempDir::new().unwrap();
        let mut config = GatewayConfig::default().with_data_folder(dir.path());
        config.north.push(NorthSettings::new(
            "bad",
            NorthDriverConfig::Http {
                endpoint: "not a url".to_string(),
                proxy: None,
                headers: Default::default(),
            },
        ));
        config
            .north
            .push(NorthSettings::new("console", NorthDriverConfig::Console { verbose: false }));

        let engine = Engine::start(&config).await.unwrap();
        assert!(engine.north("bad").is_none());
        assert!(engine.north("console").is_some());
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_router_requires_a_subscriber() {
        let dir = TempDir::new().unwrap();
        let (events, _rx) = metrics_channel();
        let settings = NorthSettings::new("console", NorthDriverConfig::Console { verbose: false })
            .with_subscriptions(vec!["line-1".to_string()]);
        let north = Arc::new(NorthConnector::new(
            settings,
            Arc::new(crate::north::drivers::ConsoleSink::new(false)),
            dir.path(),
            Arc::new(ErrorStore::new(dir.path().join("error"))),
            events,
        ));
        north.coordinator().start().await.unwrap();
        let router = Router::new(vec![north.clone()]);

        let values = vec![PointValue::new("temp", serde_json::json!(21.5))];
        router.add_values("line-1", values.clone()).await.unwrap();
        assert!(router.add_values("line-2", values).await.is_err());
        assert_eq!(north.coordinator().get_number_of_values().await, 1);
    }
}
