use crate::types::{DeployEvent, EnrollmentId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

// Bounded per-enrollment buffer. A subscriber that falls further behind
// than this observes drops rather than growing the buffer.
const CHANNEL_CAPACITY: usize = 64;

/// EventHub fans deployment events out to subscribers, ordered per
/// enrollment. Buffers are bounded; slow subscribers lose events and the
/// loss is counted.
pub struct EventHub {
    channels: Mutex<HashMap<EnrollmentId, broadcast::Sender<DeployEvent>>>,
    dropped: Arc<AtomicU64>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to one enrollment's events, from this moment on.
    pub fn subscribe(&self, enrollment_id: EnrollmentId) -> EventStream {
        let receiver = self
            .channels
            .lock()
            .unwrap()
            .entry(enrollment_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        EventStream {
            receiver,
            dropped: self.dropped.clone(),
        }
    }

    /// Events lost to slow subscribers since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn publish(&self, enrollment_id: EnrollmentId, event: DeployEvent) {
        let sender = self
            .channels
            .lock()
            .unwrap()
            .entry(enrollment_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();

        // No subscribers is fine; delivery is best-effort.
        let _ = sender.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// EventStream yields one enrollment's events in order. Lagged gaps are
/// skipped and counted on the hub.
pub struct EventStream {
    receiver: broadcast::Receiver<DeployEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// The next event, or None once the hub is gone and the buffer is
    /// drained.
    pub async fn next(&mut self) -> Option<DeployEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain whatever is immediately available.
    pub fn drain(&mut self) -> Vec<DeployEvent> {
        let mut drained = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => drained.push(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed, Ordering::Relaxed);
                }
                Err(_) => return drained,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::Network;

    fn progress(enrollment_id: EnrollmentId, progress: u8) -> DeployEvent {
        DeployEvent::DeploymentProgress {
            enrollment_id,
            progress,
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let hub = EventHub::new();
        let mut stream = hub.subscribe(7);

        hub.publish(
            7,
            DeployEvent::DeploymentStarted {
                enrollment_id: 7,
                network: Network::Staging,
            },
        );
        hub.publish(7, progress(7, 10));
        hub.publish(7, progress(7, 25));

        assert!(matches!(
            stream.next().await.unwrap(),
            DeployEvent::DeploymentStarted { .. }
        ));
        assert_eq!(stream.next().await.unwrap(), progress(7, 10));
        assert_eq!(stream.next().await.unwrap(), progress(7, 25));
    }

    #[tokio::test]
    async fn enrollments_are_isolated() {
        let hub = EventHub::new();
        let mut seven = hub.subscribe(7);
        let mut eight = hub.subscribe(8);

        hub.publish(7, progress(7, 10));
        hub.publish(8, progress(8, 75));

        assert_eq!(seven.next().await.unwrap(), progress(7, 10));
        assert_eq!(eight.next().await.unwrap(), progress(8, 75));
        assert!(seven.drain().is_empty());
    }

    #[tokio::test]
    async fn slow_subscribers_drop_with_a_count() {
        let hub = EventHub::new();
        let mut stream = hub.subscribe(7);

        // Overflow the bounded buffer without receiving.
        for i in 0..(CHANNEL_CAPACITY as u8).wrapping_add(10) {
            hub.publish(7, progress(7, i));
        }

        // The next receive skips the gap and counts the loss.
        let first = stream.next().await.unwrap();
        assert_eq!(hub.dropped(), 10);
        assert_eq!(first, progress(7, 10));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_best_effort() {
        let hub = EventHub::new();
        hub.publish(9, progress(9, 50));

        // Only post-subscription events are delivered.
        let mut stream = hub.subscribe(9);
        hub.publish(9, progress(9, 75));
        assert_eq!(stream.next().await.unwrap(), progress(9, 75));
    }
}
