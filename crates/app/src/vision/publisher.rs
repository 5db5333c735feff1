//! Fire-and-forget delivery of detection events to the backend.
//!
//! The producer hands envelopes over an unbounded channel to a dedicated
//! thread running a small tokio runtime; the capture loop never waits on
//! network I/O. Transport failures are logged and dropped.

use std::{sync::Arc, thread, time::Duration};

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tracing::{error, info, warn};

use crate::vision::{config::Settings, data::DetectionEnvelope};

/// Cloneable submission side handed to the pipeline worker.
#[derive(Clone)]
pub struct PublisherHandle {
    tx: UnboundedSender<DetectionEnvelope>,
}

impl PublisherHandle {
    pub(crate) fn new(tx: UnboundedSender<DetectionEnvelope>) -> Self {
        Self { tx }
    }

    /// Non-blocking hand-off; the event is dropped with a warning if the
    /// publisher task is gone.
    pub fn submit(&self, envelope: DetectionEnvelope) {
        if self.tx.send(envelope).is_err() {
            warn!("Publisher task is gone; dropping detection event");
        }
    }
}

/// Owns the publisher thread and its shutdown signal.
pub struct DetectionPublisher {
    tx: UnboundedSender<DetectionEnvelope>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DetectionPublisher {
    pub fn spawn(settings: Arc<Settings>) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = thread::Builder::new()
            .name("detection-publisher".into())
            .spawn(move || publisher_task(settings, rx, shutdown_rx))
            .context("Failed to spawn publisher thread")?;
        Ok(Self {
            tx,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn handle(&self) -> PublisherHandle {
        PublisherHandle::new(self.tx.clone())
    }

    /// Signal the task to stop and block until the thread exits, dropping the
    /// HTTP client with it.
    pub fn close(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Channel-only stand-in: submitted envelopes land on the returned
    /// receiver instead of the network.
    #[cfg(test)]
    pub(crate) fn stub() -> (Self, UnboundedReceiver<DetectionEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                shutdown: None,
                handle: None,
            },
            rx,
        )
    }
}

fn publisher_task(
    settings: Arc<Settings>,
    mut rx: UnboundedReceiver<DetectionEnvelope>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to start publisher runtime: {err}");
            return;
        }
    };

    runtime.block_on(async move {
        let client = match Client::builder().timeout(Duration::from_secs(10)).build() {
            Ok(client) => client,
            Err(err) => {
                error!("Failed to build publisher HTTP client: {err}");
                return;
            }
        };
        let url = format!(
            "{}{}",
            settings.backend_base_url, settings.backend_detection_endpoint
        );

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                received = rx.recv() => match received {
                    Some(envelope) => publish(&client, &url, &settings, envelope).await,
                    None => break,
                },
            }
        }
    });
}

async fn publish(client: &Client, url: &str, settings: &Settings, envelope: DetectionEnvelope) {
    if settings.skip_backend_push {
        info!("Skipping backend push (PV_SKIP_BACKEND=true)");
        return;
    }
    match client.post(url).json(&envelope).send().await {
        Ok(response) => {
            if let Err(err) = response.error_for_status() {
                error!("Backend rejected detection event: {err}");
                metrics::counter!("vision_publish_errors_total").increment(1);
            } else {
                metrics::counter!("vision_events_published_total").increment(1);
            }
        }
        Err(err) => {
            error!("Failed to push detection to backend: {err}");
            metrics::counter!("vision_publish_errors_total").increment(1);
        }
    }
}
