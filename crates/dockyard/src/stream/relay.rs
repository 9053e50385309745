//! Live log relay.

use std::sync::Arc;

use futures::StreamExt;
use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{LifecycleEvent, sanitize_log_line};
use crate::container::ContainerRuntimeApi;

/// Follow a container's output and forward each line as a `log` event.
///
/// Ends when the output ends, the runtime fails, the receiver goes away or
/// `cancel` fires. Dropping the follow stream kills the runtime's `logs -f`.
pub fn spawn_log_relay(
    runtime: Arc<dyn ContainerRuntimeApi>,
    container_ref: String,
    tail: u32,
    tx: mpsc::Sender<LifecycleEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = match runtime.follow_logs(&container_ref, tail).await {
            Ok(lines) => lines,
            Err(e) => {
                debug!("Cannot follow logs of {}: {}", container_ref, e);
                return;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
                next = lines.next() => next,
            };

            match next {
                Some(Ok(line)) => {
                    let text = sanitize_log_line(&line.text);
                    if text.is_empty() {
                        continue;
                    }
                    if tx.send(LifecycleEvent::log(text)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!("Log relay for {} stopped: {}", container_ref, e);
                    break;
                }
                None => break,
            }
        }
    })
}
