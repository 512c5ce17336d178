use hoard_types::ObjectId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Receiving end of a seal notification subscription.
pub type NotificationStream = mpsc::Receiver<ObjectId>;

/// Internal subscriber: an id for logging and its bounded queue.
struct Subscriber {
    id: u64,
    sender: mpsc::Sender<ObjectId>,
}

/// Fan-out of seal notifications to every subscriber.
///
/// Each subscriber gets its own bounded queue. Publishing never blocks: a
/// subscriber whose queue is full is dropped, which closes its stream once
/// the already queued ids have been drained.
pub struct SubscriberRegistry {
    subscribers: Vec<Subscriber>,
    capacity: usize,
    next_id: u64,
}

impl SubscriberRegistry {
    /// Create a registry whose subscribers buffer up to `capacity` ids.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            capacity: capacity.max(1),
            next_id: 0,
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&mut self) -> NotificationStream {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id: self.next_id,
            sender,
        });
        debug!(subscriber = self.next_id, "subscriber registered");
        receiver
    }

    /// Queue `id` for every subscriber. Returns how many were dropped.
    pub fn publish(&mut self, id: ObjectId) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|sub| match sub.sender.try_send(id) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = sub.id, "notification queue full, dropping subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = sub.id, "subscriber gone");
                false
            }
        });
        before - self.subscribers.len()
    }

    /// Number of subscribers still holding their stream.
    pub fn len(&self) -> usize {
        self.subscribers
            .iter()
            .filter(|sub| !sub.sender.is_closed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.subscribers.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> ObjectId {
        ObjectId::from_raw([n; 20])
    }

    #[test]
    fn delivers_in_publish_order() {
        let mut registry = SubscriberRegistry::new(16);
        let mut a = registry.subscribe();
        let mut b = registry.subscribe();

        for n in 1..=3 {
            assert_eq!(registry.publish(id(n)), 0);
        }

        for rx in [&mut a, &mut b] {
            let got: Vec<ObjectId> = (0..3).map(|_| rx.try_recv().unwrap()).collect();
            assert_eq!(got, vec![id(1), id(2), id(3)]);
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn full_subscriber_is_dropped_without_affecting_others() {
        let mut registry = SubscriberRegistry::new(2);
        let mut slow = registry.subscribe();
        let mut fast = registry.subscribe();

        registry.publish(id(1));
        assert_eq!(fast.try_recv().unwrap(), id(1));
        registry.publish(id(2));
        assert_eq!(fast.try_recv().unwrap(), id(2));

        // `slow` now holds two undrained ids; the third overflows it.
        assert_eq!(registry.publish(id(3)), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(fast.try_recv().unwrap(), id(3));

        // The dropped subscriber drains what it had, then sees the close.
        assert_eq!(slow.try_recv().unwrap(), id(1));
        assert_eq!(slow.try_recv().unwrap(), id(2));
        assert!(matches!(
            slow.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn closed_subscriber_is_pruned() {
        let mut registry = SubscriberRegistry::new(4);
        let rx = registry.subscribe();
        assert_eq!(registry.len(), 1);
        drop(rx);
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.publish(id(1)), 1);
        assert!(registry.is_empty());
    }
}
