//! Progress stream for a starting resource.

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::events::LifecycleEvent;
use super::relay::spawn_log_relay;
use crate::container::ContainerRuntimeApi;
use crate::resource::{Resource, ResourceRepository, ResourceStatus};

/// Caller stream timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// How often the record is re-read.
    pub poll_interval_ms: u64,
    /// How long a caller is kept waiting before the stream gives up.
    pub caller_timeout_ms: u64,
    /// Log lines replayed when the relay attaches.
    pub log_tail: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            caller_timeout_ms: 90_000,
            log_tail: 100,
        }
    }
}

/// Stream a resource's progress towards RUNNING.
///
/// Emits the current status, relays container output, and ends with
/// `complete` on RUNNING, `error` on ERROR or STOPPED, or a final `status`
/// once the caller timeout passes.
///
/// A caller timeout closes the stream with neither `complete` nor `error`.
/// Only the caller stops waiting: the readiness monitor keeps running and
/// still writes the outcome to the record.
pub fn progress_stream(
    repo: ResourceRepository,
    runtime: Arc<dyn ContainerRuntimeApi>,
    id: String,
    settings: StreamSettings,
) -> ReceiverStream<LifecycleEvent> {
    let (tx, rx) = mpsc::channel(128);
    tokio::spawn(run_progress(repo, runtime, id, settings, tx));
    ReceiverStream::new(rx)
}

/// Stream a container's output as `log` events until it ends.
pub fn log_events(
    runtime: Arc<dyn ContainerRuntimeApi>,
    container_ref: String,
    tail: u32,
) -> ReceiverStream<LifecycleEvent> {
    let (tx, rx) = mpsc::channel(128);
    spawn_log_relay(runtime, container_ref, tail, tx, CancellationToken::new());
    ReceiverStream::new(rx)
}

fn describe(resource: &Resource) -> String {
    match resource.status {
        ResourceStatus::Starting => format!("{} is starting", resource.id),
        status => format!("{} is {}", resource.id, status),
    }
}

async fn run_progress(
    repo: ResourceRepository,
    runtime: Arc<dyn ContainerRuntimeApi>,
    id: String,
    settings: StreamSettings,
    tx: mpsc::Sender<LifecycleEvent>,
) {
    let relay_cancel = CancellationToken::new();
    let _relay_guard = relay_cancel.clone().drop_guard();

    let deadline = sleep(Duration::from_millis(settings.caller_timeout_ms));
    tokio::pin!(deadline);
    let mut ticker = interval(Duration::from_millis(settings.poll_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_status: Option<ResourceStatus> = None;
    let mut relaying = false;

    loop {
        tokio::select! {
            biased;
            _ = tx.closed() => return,
            // Last event is a plain `status`; the outcome lands on the record.
            _ = &mut deadline => {
                let _ = tx
                    .send(LifecycleEvent::status(format!(
                        "{} is still starting; it keeps starting in the background",
                        id
                    )))
                    .await;
                return;
            }
            _ = ticker.tick() => {}
        }

        let resource = match repo.get(&id).await {
            Ok(Some(resource)) => resource,
            Ok(None) => {
                let _ = tx
                    .send(LifecycleEvent::error(format!("resource not found: {}", id)))
                    .await;
                return;
            }
            Err(e) => {
                warn!("Progress poll for {} failed: {:#}", id, e);
                continue;
            }
        };

        if last_status != Some(resource.status) {
            last_status = Some(resource.status);
            if tx.send(LifecycleEvent::status(describe(&resource))).await.is_err() {
                return;
            }
        }

        let terminal = match resource.status {
            ResourceStatus::Running => Some(LifecycleEvent::complete(if resource.degraded_readiness {
                format!("{} is running (degraded readiness)", id)
            } else {
                format!("{} is running", id)
            })),
            ResourceStatus::Error => Some(LifecycleEvent::error(
                resource
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("{} failed to start", id)),
            )),
            ResourceStatus::Stopped => Some(LifecycleEvent::error(format!("{} was stopped", id))),
            ResourceStatus::Starting | ResourceStatus::Stopping => None,
        };
        if let Some(event) = terminal {
            let _ = tx.send(event).await;
            return;
        }

        if !relaying
            && resource.status == ResourceStatus::Starting
            && let Some(container_ref) = resource.container_ref.clone()
        {
            spawn_log_relay(
                Arc::clone(&runtime),
                container_ref,
                settings.log_tail,
                tx.clone(),
                relay_cancel.clone(),
            );
            relaying = true;
        }
    }
}
