//! Per-direction retry queue and its drain task.
//!
//! Records destined for a disconnected side wait here and are replayed
//! oldest-first when the side comes back. The drain also owns deferred ACK
//! emission: a record enqueued under ACK-after-delivery policy carries
//! `needs_ack`, and its sender is acknowledged right after the forward
//! lands.

use crate::config::Hl7Settings;
use crate::endpoint::{PeerWriter, WriterWatch};
use crate::hl7;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Poll interval while the queue is empty. Polling is adequate at expected
/// message rates; no condition variable needed.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// One buffered application record.
#[derive(Debug, Clone)]
pub struct Pending {
    /// The raw HL7 payload, re-framed at write time.
    pub payload: bytes::Bytes,
    /// The sender has not been ACKed yet; acknowledge after delivery.
    pub needs_ack: bool,
}

/// Unbounded FIFO of application records for one forwarding direction.
/// Multi-producer safe; drained by a single task.
#[derive(Debug, Default)]
pub struct RetryQueue {
    inner: Mutex<VecDeque<Pending>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: Pending) {
        self.lock().push_back(record);
    }

    /// Puts a record back at the head, preserving order after a failed write.
    pub fn requeue_front(&self, record: Pending) {
        self.lock().push_front(record);
    }

    pub fn pop(&self) -> Option<Pending> {
        self.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Pending>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Drains `queue` into whichever writer is current on the destination side.
///
/// Runs for the life of the proxy. Waits while the destination slot is
/// empty; on a write failure the record goes back to the queue head and the
/// drain waits for the slot to be replaced before trying again.
pub async fn drain_task(
    queue: Arc<RetryQueue>,
    mut dest: WriterWatch,
    source: WriterWatch,
    settings: Arc<Hl7Settings>,
    cancel: CancellationToken,
) {
    let mut skip_generation: Option<u64> = None;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let writer = match current_writer(&dest, skip_generation) {
            Some(w) => w,
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = dest.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }
        };
        skip_generation = None;

        let record = match queue.pop() {
            Some(r) => r,
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = time::sleep(IDLE_POLL) => {}
                }
                continue;
            }
        };

        match writer.send(record.payload.clone()).await {
            Ok(()) => {
                debug!(
                    control_id = %hl7::control_id(&record.payload),
                    left = queue.len(),
                    "replayed buffered record"
                );
                if record.needs_ack {
                    send_deferred_ack(&source, &record.payload, &settings).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "replay failed, holding record for reconnect");
                skip_generation = Some(writer.generation());
                queue.requeue_front(record);
            }
        }
    }
}

fn current_writer(watch: &WriterWatch, skip_generation: Option<u64>) -> Option<PeerWriter> {
    watch
        .borrow()
        .clone()
        .filter(|w| Some(w.generation()) != skip_generation)
}

async fn send_deferred_ack(source: &WriterWatch, payload: &bytes::Bytes, settings: &Hl7Settings) {
    let Some(writer) = source.borrow().clone() else {
        debug!("sender gone, deferred ack dropped");
        return;
    };
    let ack = hl7::build_ack(payload, settings);
    if let Err(e) = writer.send(ack).await {
        warn!(error = %e, "deferred ack write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn rec(data: &'static [u8]) -> Pending {
        Pending {
            payload: Bytes::from_static(data),
            needs_ack: false,
        }
    }

    #[test]
    fn drains_in_fifo_order() {
        let q = RetryQueue::new();
        q.push(rec(b"one"));
        q.push(rec(b"two"));
        q.push(rec(b"three"));

        assert_eq!(q.len(), 3);
        assert_eq!(q.pop().unwrap().payload, Bytes::from_static(b"one"));
        assert_eq!(q.pop().unwrap().payload, Bytes::from_static(b"two"));
        assert_eq!(q.pop().unwrap().payload, Bytes::from_static(b"three"));
        assert!(q.pop().is_none());
    }

    #[test]
    fn requeue_front_preserves_order() {
        let q = RetryQueue::new();
        q.push(rec(b"one"));
        q.push(rec(b"two"));

        let head = q.pop().unwrap();
        q.requeue_front(head);

        assert_eq!(q.pop().unwrap().payload, Bytes::from_static(b"one"));
        assert_eq!(q.pop().unwrap().payload, Bytes::from_static(b"two"));
    }

    #[test]
    fn empty_checks() {
        let q = RetryQueue::new();
        assert!(q.is_empty());
        q.push(rec(b"x"));
        assert!(!q.is_empty());
    }
}
