//! Topic-based fan-out over bounded channels.
//!
//! Each subscription owns one channel that may be registered under several
//! topics. Publishing waits for room in every subscriber's channel, so a
//! subscription must either be read or be explicitly unsubscribed.

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct PubSub<T> {
    inner: Arc<Mutex<Inner<T>>>,
    capacity: usize,
}

#[derive(Debug)]
pub struct Subscription<T> {
    id: u64,
    topics: Vec<String>,
    rx: mpsc::Receiver<T>,
}

#[derive(Debug)]
struct Inner<T> {
    next_id: u64,
    by_topic: HashMap<String, Vec<Subscriber<T>>>,
}

#[derive(Debug)]
struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<T>,
}

// === impl PubSub ===

impl<T> Clone for PubSub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Clone + Send + 'static> PubSub<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                by_topic: HashMap::default(),
            })),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe<S: ToString>(&self, topics: impl IntoIterator<Item = S>) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let topics = topics.into_iter().map(|t| t.to_string()).collect::<Vec<_>>();

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        for topic in &topics {
            inner
                .by_topic
                .entry(topic.clone())
                .or_default()
                .push(Subscriber { id, tx: tx.clone() });
        }
        drop(inner);

        tracing::trace!(id, ?topics, "Subscribed");
        Subscription { id, topics, rx }
    }

    /// Delivers `msg` to every subscriber of `topic`, waiting for channel
    /// capacity as needed. Returns the number of subscribers reached.
    pub async fn publish(&self, topic: &str, msg: T) -> usize {
        let txs = self.senders(topic);
        let mut delivered = 0;
        for tx in txs {
            if tx.send(msg.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Delivers `msg` to every subscriber of `topic` that has room for it.
    pub fn try_publish(&self, topic: &str, msg: T) -> usize {
        let txs = self.senders(topic);
        let mut delivered = 0;
        for tx in txs {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(topic, "Subscriber is full; dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Removes the subscription from every topic and drains its channel.
    ///
    /// Returns once the channel is closed and empty. Safe to call while
    /// publishes to the subscription's topics are in flight.
    pub async fn unsubscribe(&self, sub: &mut Subscription<T>) {
        {
            let mut inner = self.inner.lock();
            for topic in &sub.topics {
                if let Some(subs) = inner.by_topic.get_mut(topic) {
                    subs.retain(|s| s.id != sub.id);
                    if subs.is_empty() {
                        inner.by_topic.remove(topic);
                    }
                }
            }
        }

        sub.rx.close();
        let mut drained = 0usize;
        while sub.rx.recv().await.is_some() {
            drained += 1;
        }
        tracing::trace!(id = sub.id, drained, "Unsubscribed");
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.lock().by_topic.get(topic).map_or(0, Vec::len)
    }

    fn senders(&self, topic: &str) -> Vec<mpsc::Sender<T>> {
        self.inner
            .lock()
            .by_topic
            .get(topic)
            .map(|subs| subs.iter().map(|s| s.tx.clone()).collect())
            .unwrap_or_default()
    }
}

// === impl Subscription ===

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<T, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    #[tokio::test]
    async fn fans_out_by_topic() {
        let pubsub = PubSub::<u32>::new(8);
        let mut a = pubsub.subscribe(["a"]);
        let mut ab = pubsub.subscribe(["a", "b"]);

        assert_eq!(pubsub.publish("a", 1).await, 2);
        assert_eq!(pubsub.publish("b", 2).await, 1);
        assert_eq!(pubsub.publish("c", 3).await, 0);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(ab.recv().await, Some(1));
        assert_eq!(ab.recv().await, Some(2));
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_drains_unread_messages() {
        let pubsub = PubSub::<u32>::new(8);
        let mut sub = pubsub.subscribe(["topic"]);
        for i in 0..3 {
            pubsub.publish("topic", i).await;
        }

        time::timeout(time::Duration::from_secs(1), pubsub.unsubscribe(&mut sub))
            .await
            .expect("unsubscribe must not block");

        assert!(sub.is_closed());
        assert!(sub.is_empty());
        assert_eq!(sub.recv().await, None);
        assert_eq!(pubsub.subscriber_count("topic"), 0);
        assert_eq!(pubsub.publish("topic", 4).await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_releases_blocked_publisher() {
        let pubsub = PubSub::<u32>::new(1);
        let mut sub = pubsub.subscribe(["topic"]);
        pubsub.publish("topic", 0).await;

        // The channel is full, so this publish waits until the subscriber
        // goes away.
        let publisher = tokio::spawn({
            let pubsub = pubsub.clone();
            async move { pubsub.publish("topic", 1).await }
        });
        tokio::task::yield_now().await;

        pubsub.unsubscribe(&mut sub).await;
        let delivered = time::timeout(time::Duration::from_secs(1), publisher)
            .await
            .expect("publisher must complete")
            .expect("publisher must not panic");
        assert!(delivered <= 1);
        assert!(sub.is_closed());
    }

    #[tokio::test]
    async fn try_publish_skips_full_subscribers() {
        let pubsub = PubSub::<u32>::new(1);
        let mut sub = pubsub.subscribe(["topic"]);
        assert_eq!(pubsub.try_publish("topic", 1), 1);
        assert_eq!(pubsub.try_publish("topic", 2), 0);
        assert_eq!(sub.recv().await, Some(1));
    }
}
