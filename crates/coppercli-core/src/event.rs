//! A generic broadcast event dispatcher, reused by the driver, each
//! controller, and the proxy so every component exposes one coarse event
//! stream instead of fine-grained callback fan-out (§9 re-architecture note).

use tokio::sync::broadcast;

/// Wraps a [`tokio::sync::broadcast`] channel for a single event type `E`.
/// Cloning shares the same underlying channel, so every owner of a clone can
/// publish and every `subscribe()` caller gets an independent receiver.
pub struct EventDispatcher<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventDispatcher<E> {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Publish to all subscribers. Returns the number reached; `Err` only
    /// when there are currently no subscribers, which is not a failure for
    /// callers that fire-and-forget.
    pub fn publish(&self, event: E) -> Result<usize, broadcast::error::SendError<E>> {
        self.tx.send(event)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Clone for EventDispatcher<E> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<E: Clone> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Sample {
        Ping,
    }

    #[tokio::test]
    async fn broadcasts_to_every_subscriber() {
        let dispatcher: EventDispatcher<Sample> = EventDispatcher::default();
        let mut rx1 = dispatcher.subscribe();
        let mut rx2 = dispatcher.subscribe();

        dispatcher.publish(Sample::Ping).unwrap();

        assert_eq!(rx1.recv().await.unwrap(), Sample::Ping);
        assert_eq!(rx2.recv().await.unwrap(), Sample::Ping);
    }
}
