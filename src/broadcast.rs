//! Keyed fan-out of progress events to live subscribers.
//!
//! Each job key owns at most one channel. Every subscriber of that key gets
//! its own unbounded queue so a slow SSE client never blocks the downloader.
//! A terminal event tears the whole channel down after delivery; dropping a
//! [`Subscription`] only removes that one subscriber.

use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::ids::VideoJobKey;
use crate::playlist::PlaylistProgress;
use crate::download::VideoProgress;

pub const VIDEO_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const PLAYLIST_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub type VideoBroadcaster = Broadcaster<VideoJobKey, VideoProgress>;
pub type PlaylistBroadcaster = Broadcaster<String, PlaylistProgress>;

/// Events that know when their stream is over.
pub trait ProgressEvent: Clone + Send + 'static {
    fn is_terminal(&self) -> bool;
}

pub trait JobKey: Clone + Debug + Eq + Hash + Send + Sync + 'static {}

impl<T> JobKey for T where T: Clone + Debug + Eq + Hash + Send + Sync + 'static {}

pub struct Broadcaster<K, E> {
    inner: Arc<Registry<K, E>>,
}

impl<K, E> Clone for Broadcaster<K, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Registry<K, E> {
    channels: Mutex<HashMap<K, Vec<Subscriber<E>>>>,
    next_id: AtomicU64,
    idle_timeout: Duration,
}

struct Subscriber<E> {
    id: u64,
    tx: mpsc::UnboundedSender<E>,
}

impl<K: JobKey, E: ProgressEvent> Broadcaster<K, E> {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Registry {
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                idle_timeout,
            }),
        }
    }

    /// Joins the channel for `key`, creating it if nobody is listening yet.
    pub fn subscribe(&self, key: K) -> Subscription<K, E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .channels
            .lock()
            .entry(key.clone())
            .or_default()
            .push(Subscriber { id, tx });
        debug!(?key, id, "progress subscriber attached");

        Subscription {
            key,
            id,
            rx,
            registry: self.inner.clone(),
            finished: false,
        }
    }

    /// Delivers `event` to every current subscriber of `key` and returns how
    /// many received it. Without subscribers the event is dropped.
    pub fn publish(&self, key: &K, event: E) -> usize {
        let terminal = event.is_terminal();
        let mut channels = self.inner.channels.lock();
        let Some(subscribers) = channels.get_mut(key) else {
            return 0;
        };

        subscribers.retain(|subscriber| !subscriber.tx.is_closed());
        let mut delivered = 0;
        for subscriber in subscribers.iter() {
            if subscriber.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }

        if terminal || subscribers.is_empty() {
            channels.remove(key);
        }
        delivered
    }

    pub fn subscriber_count(&self, key: &K) -> usize {
        self.inner
            .channels
            .lock()
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }
}

impl<K, E> Registry<K, E>
where
    K: Eq + Hash,
{
    fn release(&self, key: &K, id: u64) {
        let mut channels = self.channels.lock();
        if let Some(subscribers) = channels.get_mut(key) {
            subscribers.retain(|subscriber| subscriber.id != id);
            if subscribers.is_empty() {
                channels.remove(key);
            }
        }
    }
}

/// One listener on one job key. Ends after a terminal event, after the idle
/// timeout, or when the channel is torn down.
pub struct Subscription<K: Eq + Hash, E> {
    key: K,
    id: u64,
    rx: mpsc::UnboundedReceiver<E>,
    registry: Arc<Registry<K, E>>,
    finished: bool,
}

impl<K: JobKey, E: ProgressEvent> Subscription<K, E> {
    pub async fn next(&mut self) -> Option<E> {
        if self.finished {
            return None;
        }
        match tokio::time::timeout(self.registry.idle_timeout, self.rx.recv()).await {
            Ok(Some(event)) => {
                if event.is_terminal() {
                    self.finish();
                }
                Some(event)
            }
            Ok(None) => {
                self.finish();
                None
            }
            Err(_) => {
                debug!(key = ?self.key, id = self.id, "progress subscription idle, closing");
                self.finish();
                None
            }
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn into_stream(self) -> impl Stream<Item = E> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|event| (event, subscription))
        })
    }

    fn finish(&mut self) {
        self.finished = true;
        self.registry.release(&self.key, self.id);
    }
}

impl<K: Eq + Hash, E> Drop for Subscription<K, E> {
    fn drop(&mut self) {
        self.registry.release(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Tick {
        value: u8,
        done: bool,
    }

    impl ProgressEvent for Tick {
        fn is_terminal(&self) -> bool {
            self.done
        }
    }

    fn tick(value: u8) -> Tick {
        Tick { value, done: false }
    }

    fn hub() -> Broadcaster<String, Tick> {
        Broadcaster::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let hub = hub();
        let mut first = hub.subscribe("job".into());
        let mut second = hub.subscribe("job".into());
        assert_eq!(hub.subscriber_count(&"job".to_string()), 2);
        assert_eq!(hub.channel_count(), 1);

        assert_eq!(hub.publish(&"job".into(), tick(10)), 2);
        assert_eq!(first.next().await, Some(tick(10)));
        assert_eq!(second.next().await, Some(tick(10)));
    }

    #[tokio::test]
    async fn dropping_one_subscriber_keeps_the_other() {
        let hub = hub();
        let first = hub.subscribe("job".into());
        let mut second = hub.subscribe("job".into());
        drop(first);

        assert_eq!(hub.subscriber_count(&"job".to_string()), 1);
        assert_eq!(hub.publish(&"job".into(), tick(42)), 1);
        assert_eq!(second.next().await, Some(tick(42)));
    }

    #[tokio::test]
    async fn keys_do_not_cross_talk() {
        let hub = hub();
        let mut a = hub.subscribe("a".into());
        let _b = hub.subscribe("b".into());
        assert_eq!(hub.publish(&"b".into(), tick(1)), 1);
        assert_eq!(hub.publish(&"a".into(), tick(2)), 1);
        assert_eq!(a.next().await, Some(tick(2)));
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let hub = hub();
        assert_eq!(hub.publish(&"nobody".into(), tick(5)), 0);
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn terminal_event_closes_stream_and_channel() {
        let hub = hub();
        let mut sub = hub.subscribe("job".into());
        hub.publish(&"job".into(), tick(50));
        hub.publish(
            &"job".into(),
            Tick {
                value: 100,
                done: true,
            },
        );
        assert_eq!(hub.channel_count(), 0);

        assert_eq!(sub.next().await, Some(tick(50)));
        assert!(sub.next().await.unwrap().done);
        assert_eq!(sub.next().await, None);

        // A later subscriber for the same key starts on a fresh channel.
        let _again = hub.subscribe("job".into());
        assert_eq!(hub.subscriber_count(&"job".to_string()), 1);
    }

    #[tokio::test]
    async fn idle_subscription_times_out_and_releases() {
        let hub: Broadcaster<String, Tick> = Broadcaster::new(Duration::from_millis(30));
        let mut sub = hub.subscribe("slow".into());
        assert_eq!(sub.next().await, None);
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn stream_yields_until_terminal() {
        use futures::StreamExt;

        let hub = hub();
        let stream = hub.subscribe("job".into()).into_stream();
        hub.publish(&"job".into(), tick(1));
        hub.publish(&"job".into(), tick(2));
        hub.publish(
            &"job".into(),
            Tick {
                value: 3,
                done: true,
            },
        );
        let values: Vec<u8> = stream.map(|event| event.value).collect().await;
        assert_eq!(values, vec![1, 2, 3]);
    }
}
