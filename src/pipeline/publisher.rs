//! Latest-frame preview publisher
//!
//! Every subscriber owns one [`FrameSlot`]. Publishing walks an immutable
//! snapshot of the slot list and overwrites each slot, so a stalled reader
//! never holds up the capture thread and always sees the newest frame next.
//!
//! ```text
//!   capture thread                        render loops
//!   publish(frame) ──► slots snapshot ──► [slot A] ──► try_take()
//!                      (ArcSwap<Vec>)  ├► [slot B] ──► try_take()
//!                                      └► [slot C] ──► try_take()
//! ```
//!
//! The subscriber map sits behind a mutex that is only taken by
//! `subscribe`/`unsubscribe`, which then store a fresh snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::slot::{FrameSlot, SlotWrite};
use crate::error::FrameError;
use crate::Frame;

/// Identity of one subscriber's slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What happened to a published frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Written to `slots` live slots (zero when nobody is subscribed)
    Delivered { slots: usize },
    /// Sequence number not newer than the last published frame
    Stale { sequence: u64 },
    /// Malformed frame
    Rejected(FrameError),
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishOutcome::Delivered { .. })
    }
}

/// Point-in-time publisher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub published: u64,
    pub stale: u64,
    pub rejected: u64,
    /// Unconsumed frames displaced by a newer one, summed over slots
    pub overwritten: u64,
    pub subscribers: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    stale: AtomicU64,
    rejected: AtomicU64,
    overwritten: AtomicU64,
}

struct Shared {
    /// Hot-path view of the live slots
    slots: ArcSwap<Vec<Arc<FrameSlot>>>,

    /// Authoritative subscriber set; only touched on attach/detach
    registry: Mutex<HashMap<SubscriptionId, Arc<FrameSlot>>>,

    next_id: AtomicU64,

    subscriber_count: AtomicUsize,

    counters: CachePadded<Counters>,
}

impl Shared {
    fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(FrameSlot::new());

        {
            let mut registry = self.registry.lock();
            registry.insert(id, Arc::clone(&slot));
            self.slots
                .store(Arc::new(registry.values().cloned().collect()));
            self.subscriber_count.store(registry.len(), Ordering::Relaxed);
            debug!(subscription = %id, subscribers = registry.len(), "Subscriber attached");
        }

        Subscription {
            id,
            slot,
            publisher: Arc::downgrade(self),
        }
    }

    fn detach(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock();
        let Some(slot) = registry.remove(&id) else {
            return false;
        };

        slot.close();
        self.slots
            .store(Arc::new(registry.values().cloned().collect()));
        self.subscriber_count.store(registry.len(), Ordering::Relaxed);

        debug!(subscription = %id, subscribers = registry.len(), "Subscriber detached");
        true
    }

    fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Relaxed)
    }

    fn stats(&self) -> PublisherStats {
        let counters = &self.counters;
        PublisherStats {
            published: counters.published.load(Ordering::Relaxed),
            stale: counters.stale.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            overwritten: counters.overwritten.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Producer side of the fan-out between the capture loop and any number of
/// preview renderers.
///
/// There is exactly one per subscriber set and it is not `Clone`: the
/// sequence check and the slot writes happen on one thread, so a slot can
/// never be overwritten by an older frame. Renderers attach through a
/// [`PublisherHandle`].
///
/// ```compile_fail
/// fn second_producer<T: Clone>() {}
/// second_producer::<streamliter::PreviewPublisher>();
/// ```
pub struct PreviewPublisher {
    shared: Arc<Shared>,

    /// Smallest sequence number that will still be accepted
    next_sequence: u64,
}

impl PreviewPublisher {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: ArcSwap::from_pointee(Vec::new()),
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                subscriber_count: AtomicUsize::new(0),
                counters: CachePadded::new(Counters::default()),
            }),
            next_sequence: 0,
        }
    }

    /// Cloneable handle for attaching renderers and reading stats
    pub fn handle(&self) -> PublisherHandle {
        PublisherHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Offer a frame to every subscriber.
    ///
    /// Never blocks and never fails: malformed and out-of-order frames are
    /// counted and reported through the returned outcome.
    pub fn publish(&mut self, frame: Frame) -> PublishOutcome {
        let counters = &self.shared.counters;

        if let Err(err) = frame.validate() {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("preview_frames_rejected_total").increment(1);
            warn!(sequence = frame.sequence(), error = %err, "Rejected malformed frame");
            return PublishOutcome::Rejected(err);
        }

        let sequence = frame.sequence();
        if sequence < self.next_sequence {
            counters.stale.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("preview_frames_stale_total").increment(1);
            trace!(sequence, "Dropped stale frame");
            return PublishOutcome::Stale { sequence };
        }
        self.next_sequence = sequence.saturating_add(1);

        let frame = Arc::new(frame);
        let slots = self.shared.slots.load();
        let mut delivered = 0;
        let mut overwritten = 0;

        for slot in slots.iter() {
            match slot.put(Arc::clone(&frame)) {
                SlotWrite::Filled => delivered += 1,
                SlotWrite::Overwrote => {
                    delivered += 1;
                    overwritten += 1;
                }
                SlotWrite::Closed => {}
            }
        }

        counters.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("preview_frames_published_total").increment(1);
        if overwritten > 0 {
            counters.overwritten.fetch_add(overwritten, Ordering::Relaxed);
            metrics::counter!("preview_frames_overwritten_total").increment(overwritten);
            trace!(sequence, overwritten, "Replaced unconsumed frames");
        }

        PublishOutcome::Delivered { slots: delivered }
    }

    /// Attach a new subscriber with an empty slot
    pub fn subscribe(&self) -> Subscription {
        self.shared.subscribe()
    }

    /// Release a subscriber's slot. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.detach(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscriber_count()
    }

    pub fn stats(&self) -> PublisherStats {
        self.shared.stats()
    }
}

impl Default for PreviewPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer-side view of a [`PreviewPublisher`]: attach, detach, stats.
///
/// Cheap to clone; clones share the same subscriber set and counters.
#[derive(Clone)]
pub struct PublisherHandle {
    shared: Arc<Shared>,
}

impl PublisherHandle {
    pub fn subscribe(&self) -> Subscription {
        self.shared.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.detach(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscriber_count()
    }

    pub fn stats(&self) -> PublisherStats {
        self.shared.stats()
    }
}

/// A subscriber's handle on its slot.
///
/// Dropping it detaches from the publisher.
pub struct Subscription {
    id: SubscriptionId,
    slot: Arc<FrameSlot>,
    publisher: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Take the latest pending frame without blocking
    pub fn try_take(&self) -> Option<Arc<Frame>> {
        self.slot.try_take()
    }

    /// Block until a frame arrives or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Arc<Frame>> {
        self.slot.wait_timeout(timeout)
    }

    /// Wait for the next frame; `None` once detached
    pub async fn next(&self) -> Option<Arc<Frame>> {
        self.slot.wait().await
    }

    pub fn is_pending(&self) -> bool {
        self.slot.is_pending()
    }

    /// False once detached, or once the publisher and all its handles are gone
    pub fn is_attached(&self) -> bool {
        !self.slot.is_closed() && self.publisher.strong_count() > 0
    }

    /// Detach now. Safe to call more than once, and from any thread.
    pub fn unsubscribe(&self) {
        match self.publisher.upgrade() {
            Some(shared) => {
                shared.detach(self.id);
            }
            None => self.slot.close(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pending", &self.slot.is_pending())
            .field("closed", &self.slot.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::PixelFormat;

    fn frame(sequence: u64) -> Frame {
        Frame::new(
            sequence,
            2,
            1,
            PixelFormat::Rgb24,
            Bytes::from_static(&[0, 1, 2, 3, 4, 5]),
        )
    }

    #[test]
    fn test_publish_without_subscribers() {
        let mut publisher = PreviewPublisher::new();
        assert_eq!(
            publisher.publish(frame(1)),
            PublishOutcome::Delivered { slots: 0 }
        );
        assert_eq!(publisher.stats().published, 1);
    }

    #[test]
    fn test_subscribe_starts_empty() {
        let mut publisher = PreviewPublisher::new();
        publisher.publish(frame(1));

        let sub = publisher.subscribe();
        assert!(sub.try_take().is_none());
        assert_eq!(publisher.subscriber_count(), 1);
    }

    #[test]
    fn test_equal_sequence_is_stale() {
        let mut publisher = PreviewPublisher::new();
        let sub = publisher.subscribe();

        assert!(publisher.publish(frame(4)).is_delivered());
        assert_eq!(
            publisher.publish(frame(4)),
            PublishOutcome::Stale { sequence: 4 }
        );
        assert_eq!(sub.try_take().unwrap().sequence(), 4);
        assert!(sub.try_take().is_none());
        assert_eq!(publisher.stats().stale, 1);
    }

    #[test]
    fn test_rejected_frame_does_not_advance_sequence() {
        let mut publisher = PreviewPublisher::new();
        let sub = publisher.subscribe();

        let empty = Frame::new(10, 2, 1, PixelFormat::Rgb24, Bytes::new());
        assert_eq!(
            publisher.publish(empty),
            PublishOutcome::Rejected(FrameError::EmptyBuffer)
        );

        assert!(publisher.publish(frame(3)).is_delivered());
        assert_eq!(sub.try_take().unwrap().sequence(), 3);

        let stats = publisher.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.published, 1);
    }

    #[test]
    fn test_overflowing_geometry_rejected() {
        let mut publisher = PreviewPublisher::new();
        let sub = publisher.subscribe();

        let huge = Frame::new(
            1,
            0x8000_0000,
            1,
            PixelFormat::Bgra32,
            Bytes::from_static(&[0, 0, 0, 0]),
        );
        assert_eq!(
            publisher.publish(huge),
            PublishOutcome::Rejected(FrameError::GeometryOverflow {
                width: 0x8000_0000,
                height: 1
            })
        );
        assert!(sub.try_take().is_none());
        assert_eq!(publisher.stats().rejected, 1);
    }

    #[test]
    fn test_overwrite_counted_per_slot() {
        let mut publisher = PreviewPublisher::new();
        let _a = publisher.subscribe();
        let _b = publisher.subscribe();

        publisher.publish(frame(1));
        publisher.publish(frame(2));

        assert_eq!(publisher.stats().overwritten, 2);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let mut publisher = PreviewPublisher::new();
        let sub = publisher.subscribe();
        let id = sub.id();

        assert!(publisher.unsubscribe(id));
        assert!(!publisher.unsubscribe(id));
        assert!(!sub.is_attached());
        assert_eq!(publisher.subscriber_count(), 0);

        publisher.publish(frame(1));
        assert!(sub.try_take().is_none());

        sub.unsubscribe();
        drop(sub);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn test_drop_detaches() {
        let mut publisher = PreviewPublisher::new();
        let sub = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);

        drop(sub);
        assert_eq!(publisher.subscriber_count(), 0);
        assert_eq!(
            publisher.publish(frame(1)),
            PublishOutcome::Delivered { slots: 0 }
        );
    }

    #[test]
    fn test_subscription_outlives_publisher() {
        let mut publisher = PreviewPublisher::new();
        let sub = publisher.subscribe();
        publisher.publish(frame(1));
        drop(publisher);

        assert!(!sub.is_attached());
        // Frame published before the drop is still readable
        assert_eq!(sub.try_take().unwrap().sequence(), 1);
    }

    #[test]
    fn test_handles_share_subscribers() {
        let mut publisher = PreviewPublisher::new();
        let handle = publisher.handle();
        let other = handle.clone();
        let sub = other.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);

        publisher.publish(frame(1));
        assert_eq!(sub.try_take().unwrap().sequence(), 1);
        assert_eq!(handle.stats().published, 1);

        assert!(handle.unsubscribe(sub.id()));
        assert_eq!(other.subscriber_count(), 0);
    }

    #[test]
    fn test_slots_never_regress_with_concurrent_readers() {
        let mut publisher = PreviewPublisher::new();
        let handle = publisher.handle();
        let ready = Arc::new(std::sync::Barrier::new(5));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let sub = handle.subscribe();
                let ready = Arc::clone(&ready);
                std::thread::spawn(move || {
                    ready.wait();
                    let mut seen = Vec::new();
                    while let Some(frame) = sub.wait_timeout(Duration::from_millis(500)) {
                        seen.push(frame.sequence());
                    }
                    seen
                })
            })
            .collect();

        // Producer lives on its own thread; handles stay behind for readers
        let producer = std::thread::spawn(move || {
            ready.wait();
            for sequence in 1..=2_000 {
                publisher.publish(frame(sequence));
            }
            publisher
        });

        let publisher = producer.join().unwrap();
        for reader in readers {
            let seen = reader.join().unwrap();
            assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "{seen:?}");
            assert_eq!(seen.last(), Some(&2_000));
        }
        assert_eq!(publisher.stats().stale, 0);
    }
}
