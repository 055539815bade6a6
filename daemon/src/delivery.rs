/// Outbound event delivery.
///
/// Pipelines never write to stdout themselves; they hand events to a
/// `Delivery`, which for the daemon is a single writer task that serialises
/// each event as one JSON line.
use smasher_shared::ipc_protocol::ControlEvent;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Sink for events addressed to requesters.
pub trait Delivery: Send + Sync {
    fn deliver(&self, event: ControlEvent);
}

/// Writes events as newline-delimited JSON through a dedicated writer task.
#[derive(Clone)]
pub struct LineDelivery {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl LineDelivery {
    /// Spawn the writer task over `sink` (stdout in the daemon).
    pub fn spawn<W>(sink: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<ControlEvent>();
        let handle = tokio::spawn(async move {
            let mut sink = sink;
            while let Some(event) = rx.recv().await {
                let line = match event.to_json_line() {
                    Ok(line) => line,
                    Err(e) => {
                        error!("Failed to serialise {:?} event: {}", event.event, e);
                        continue;
                    }
                };
                if let Err(e) = sink.write_all(line.as_bytes()).await {
                    error!("Failed to write event: {}", e);
                    break;
                }
                if let Err(e) = sink.write_all(b"\n").await {
                    error!("Failed to write newline: {}", e);
                    break;
                }
                if let Err(e) = sink.flush().await {
                    error!("Failed to flush events: {}", e);
                    break;
                }
            }
            debug!("Event writer task ended");
        });
        (Self { tx }, handle)
    }
}

impl Delivery for LineDelivery {
    fn deliver(&self, event: ControlEvent) {
        if self.tx.send(event).is_err() {
            warn!("Event writer has stopped, event dropped");
        }
    }
}

/// Keeps every event in memory.
#[cfg(test)]
#[derive(Default)]
pub struct CollectingDelivery {
    events: std::sync::Mutex<Vec<ControlEvent>>,
}

#[cfg(test)]
impl CollectingDelivery {
    pub fn events(&self) -> Vec<ControlEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Delivery for CollectingDelivery {
    fn deliver(&self, event: ControlEvent) {
        self.events.lock().unwrap().push(event);
    }
}
