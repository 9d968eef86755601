//! A running south connector: connection plus poll loop.

use std::sync::Arc;
use std::time::Duration;

use connector_core::{ConnectionConfig, ConnectionManager, ConnectionState, Connectable};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::source::{AcquisitionSink, Source};
use crate::config::SouthSettings;

pub struct SouthConnector {
    settings: SouthSettings,
    source: Arc<dyn Source>,
    connection: ConnectionManager,
    output: Arc<dyn AcquisitionSink>,
    cancel_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SouthConnector {
    pub fn new(
        settings: SouthSettings,
        source: Arc<dyn Source>,
        output: Arc<dyn AcquisitionSink>,
    ) -> Self {
        let connection = ConnectionManager::new(
            ConnectionConfig::new(settings.id.clone())
                .with_retry_interval(settings.retry_interval())
                .with_enabled(settings.enabled),
            Arc::new(source.clone()) as Arc<dyn Connectable>,
        );
        Self {
            settings,
            source,
            connection,
            output,
            cancel_token: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub async fn start(&self) {
        if !self.settings.enabled {
            info!(connector = %self.settings.id, "South connector disabled");
            return;
        }
        let span = info_span!("south", connector = %self.settings.id);
        self.connection.start().instrument(span.clone()).await;

        let handle = spawn_poll_loop(
            self.settings.id.clone(),
            self.settings.scan_interval(),
            self.source.clone(),
            self.connection.clone(),
            self.output.clone(),
            self.cancel_token.child_token(),
        );
        *self.task.lock() = Some(handle);
        info!(
            connector = %self.settings.id,
            driver = self.source.driver_name(),
            state = %self.connection.state(),
            "South connector started"
        );
    }

    /// Stop polling, then tear down the connection.
    pub async fn stop(&self) {
        self.cancel_token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(connector = %self.settings.id, error = %e, "South task ended abnormally");
        }
        self.connection.stop().await;
        info!(connector = %self.settings.id, "South connector stopped");
    }

    /// Poll once right away, regardless of the schedule.
    pub async fn poll_once(&self) {
        poll(&self.settings.id, &*self.source, &self.connection, &*self.output).await;
    }
}

async fn poll(
    id: &str,
    source: &dyn Source,
    connection: &ConnectionManager,
    output: &dyn AcquisitionSink,
) {
    if !connection.is_connected() {
        return;
    }
    match source.poll(id, output).await {
        Ok(()) => {}
        Err(e) if e.is_transport() => {
            connection.report_transport_error(&e.to_string()).await;
        }
        Err(e) => warn!(connector = %id, error = %e, "Poll failed"),
    }
}

fn spawn_poll_loop(
    id: String,
    interval: Duration,
    source: Arc<dyn Source>,
    connection: ConnectionManager,
    output: Arc<dyn AcquisitionSink>,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    let span = info_span!("poll", connector = %id);

    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!(connector = %id, "Poll loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {}
                }
                poll(&id, &*source, &connection, &*output).await;
            }
        }
        .instrument(span),
    )
}
