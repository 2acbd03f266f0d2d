//! Bounded event buffer shared between vendor callback threads and the
//! draining consumer.
//!
//! Producers call [`EventSink::submit`] from whatever thread the vendor
//! runtime invokes its callbacks on; one consumer thread periodically calls
//! [`EventSink::drain`]. When the buffer is full the event is counted as
//! dropped and never stored, so a stalled consumer costs a counter increment
//! per event, not memory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::events::TraceEvent;

/// Outcome of a single submit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    Ok,
    /// Buffer full; the event was discarded and counted.
    Dropped,
}

/// Callback invoked with each event before it is buffered. Runs on the
/// producer thread and must not block or call [`EventSink::drain`]. A single
/// re-entrant `submit` from inside the callback is tolerated; deeper
/// re-entry is undefined.
pub type LiveCallback = Box<dyn Fn(&TraceEvent) + Send + Sync>;

/// Bounded MPSC event buffer with drop accounting.
///
/// The queue itself is a mutexed ring; producer concurrency per adapter is
/// low and the critical section is a push, so contention stays negligible.
pub struct EventSink {
    queue: Mutex<VecDeque<TraceEvent>>,
    capacity: usize,
    captured: AtomicU64,
    dropped: AtomicU64,
    /// Stored as `Arc` so invocation happens outside the lock; a re-entrant
    /// `submit` from the callback then cannot deadlock on this slot.
    live_callback: RwLock<Option<Arc<LiveCallback>>>,
}

impl EventSink {
    pub const DEFAULT_CAPACITY: usize = 1 << 16;

    pub fn new(capacity: usize) -> Self {
        EventSink {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(Self::DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
            captured: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            live_callback: RwLock::new(None),
        }
    }

    /// Submit one event. O(1) amortised; never blocks on the consumer.
    ///
    /// The live callback, when installed, sees the event before it is placed
    /// in the buffer.
    pub fn submit(&self, event: TraceEvent) -> SubmitResult {
        let callback = self.live_callback.read().unwrap().clone();
        if let Some(cb) = callback {
            cb(&event);
        }

        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            drop(queue);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return SubmitResult::Dropped;
        }
        queue.push_back(event);
        drop(queue);
        self.captured.fetch_add(1, Ordering::Relaxed);
        SubmitResult::Ok
    }

    /// Move up to `max` events out, in the order they were submitted.
    pub fn drain(&self, max: usize) -> Vec<TraceEvent> {
        let mut queue = self.queue.lock().unwrap();
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    /// Drain everything currently buffered.
    pub fn drain_all(&self) -> Vec<TraceEvent> {
        self.drain(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `(captured, dropped)`. The sum equals the number of submit attempts.
    pub fn counts(&self) -> (u64, u64) {
        (
            self.captured.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }

    pub fn events_captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn set_live_callback(&self, callback: LiveCallback) {
        *self.live_callback.write().unwrap() = Some(Arc::new(callback));
    }

    pub fn clear_live_callback(&self) {
        *self.live_callback.write().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn marker(ts: u64) -> TraceEvent {
        let mut event = TraceEvent::new(EventKind::Marker);
        event.timestamp = ts;
        event
    }

    #[test]
    fn test_submit_drain_order() {
        let sink = EventSink::new(16);
        for ts in 0..5 {
            assert_eq!(sink.submit(marker(ts)), SubmitResult::Ok);
        }
        let events = sink.drain(3);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].timestamp, 0);
        assert_eq!(events[2].timestamp, 2);
        let rest = sink.drain_all();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].timestamp, 3);
    }

    #[test]
    fn test_drop_accounting() {
        let sink = EventSink::new(4);
        let attempts = 10u64;
        for ts in 0..attempts {
            sink.submit(marker(ts));
        }
        let (captured, dropped) = sink.counts();
        assert_eq!(captured, 4);
        assert_eq!(dropped, 6);
        assert_eq!(captured + dropped, attempts);
        // Dropped events are never stored.
        assert_eq!(sink.drain_all().len(), 4);
    }

    #[test]
    fn test_live_callback_runs_before_buffering() {
        let sink = EventSink::new(16);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        sink.set_live_callback(Box::new(move |event| {
            assert_eq!(event.kind, EventKind::Marker);
            seen_cb.fetch_add(1, Ordering::SeqCst);
        }));
        sink.submit(marker(1));
        sink.submit(marker(2));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        sink.clear_live_callback();
        sink.submit(marker(3));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_single_reentrant_submit() {
        let sink = Arc::new(EventSink::new(16));
        let weak = Arc::downgrade(&sink);
        sink.set_live_callback(Box::new(move |event| {
            // Echo each marker as a custom event; the echo itself does not
            // recurse further.
            if event.kind == EventKind::Marker {
                if let Some(sink) = weak.upgrade() {
                    sink.submit(TraceEvent::new(EventKind::Custom));
                }
            }
        }));
        assert_eq!(sink.submit(marker(1)), SubmitResult::Ok);
        let events = sink.drain_all();
        assert_eq!(events.len(), 2);
        // The re-entrant submission finished before the outer event landed.
        assert_eq!(events[0].kind, EventKind::Custom);
        assert_eq!(events[1].kind, EventKind::Marker);
    }

    #[test]
    fn test_multi_producer_counts() {
        let sink = Arc::new(EventSink::new(1024));
        let mut handles = Vec::new();
        for t in 0..4 {
            let sink = sink.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    sink.submit(marker(t * 1000 + i));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let (captured, dropped) = sink.counts();
        assert_eq!(captured + dropped, 400);
        assert_eq!(sink.drain_all().len() as u64, captured);
    }
}
