//! Job-lifecycle event stream, modeled on a broadcast-channel `EventBus`
//! generalized from console/stats variants to one with job-lifecycle
//! variants.

use tokio::sync::broadcast;

use crate::executor::JobState;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fired after the corresponding state transition; delivery never blocks
/// the dispatch loop (a lagging subscriber drops old events, it does not
/// backpressure the sender).
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    JobStarted(JobState),
    JobCompleted(JobState),
    StatusChanged(String),
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    /// Best-effort; a channel with no subscribers is not an error.
    pub fn publish(&self, event: DispatchEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::JobState;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(DispatchEvent::StatusChanged("running".into()));

        match rx.recv().await.unwrap() {
            DispatchEvent::StatusChanged(msg) => assert_eq!(msg, "running"),
            _ => panic!("unexpected event"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(DispatchEvent::JobStarted(JobState::new("r1", 1, 1, "main", None)));
    }
}
