//! Frame delivery: fans decoded frames out to exactly one consumer per
//! session, strictly FIFO, with backpressure.
//!
//! A session picks its sink once, at subscribe time:
//!
//! * **Callback** — an async closure invoked for every item and awaited
//!   before the next item is dispatched. A slow callback therefore
//!   back-pressures the decode path directly; there is no internal
//!   buffering to compensate (notification coalescing or loss upstream
//!   is the transport's concern).
//! * **Queue** — a bounded `tokio::sync::mpsc` channel pushed with
//!   `try_send`, which never blocks decoding. The caller provisions the
//!   capacity; overflow is a caller sizing error and the frame is
//!   dropped with an error log.
//!
//! When the owning session terminates — explicit stop, disconnect, or a
//! rejected start — the sink receives a single [`StreamItem::EndOfStream`]
//! sentinel, so a queue consumer can detect termination without any
//! external signalling.

use futures::future::BoxFuture;
use log::{debug, error};
use tokio::sync::mpsc;

/// One delivered item: a frame, or the end-of-stream sentinel emitted
/// exactly once when the owning session terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem<F> {
    Frame(F),
    EndOfStream,
}

impl<F> StreamItem<F> {
    /// The contained frame, if this is not the sentinel.
    pub fn into_frame(self) -> Option<F> {
        match self {
            StreamItem::Frame(f) => Some(f),
            StreamItem::EndOfStream => None,
        }
    }
}

type Callback<F> = Box<dyn FnMut(StreamItem<F>) -> BoxFuture<'static, ()> + Send>;

/// The consumer side of one streaming session.
pub enum FrameSink<F> {
    /// Awaited per item; see the module docs for the backpressure
    /// contract.
    Callback(Callback<F>),
    /// Bounded, caller-provisioned, non-blocking push; overflow drops
    /// the frame.
    Queue(mpsc::Sender<StreamItem<F>>),
}

impl<F: Send + 'static> FrameSink<F> {
    /// Build a callback sink from an async closure.
    ///
    /// ```no_run
    /// # use polar_rs::delivery::{FrameSink, StreamItem};
    /// # use polar_rs::types::HeartRateFrame;
    /// let sink = FrameSink::callback(|item: StreamItem<HeartRateFrame>| async move {
    ///     if let StreamItem::Frame(frame) = item {
    ///         println!("{} bpm", frame.bpm);
    ///     }
    /// });
    /// ```
    pub fn callback<C, Fut>(mut f: C) -> Self
    where
        C: FnMut(StreamItem<F>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        FrameSink::Callback(Box::new(move |item| Box::pin(f(item))))
    }

    /// Build a queue sink from the sender half of a bounded channel.
    ///
    /// Size the channel so that pushes never overflow at your stream's
    /// notification rate; the engine will not block to wait for space.
    pub fn queue(tx: mpsc::Sender<StreamItem<F>>) -> Self {
        FrameSink::Queue(tx)
    }

    /// Deliver one item. Never blocks on a queue; awaits a callback to
    /// completion.
    pub(crate) async fn deliver(&mut self, item: StreamItem<F>) {
        match self {
            FrameSink::Callback(cb) => cb(item).await,
            FrameSink::Queue(tx) => match tx.try_send(item) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    error!("frame queue full — frame dropped; provision a larger queue");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("frame queue receiver dropped; frame discarded");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn queue_preserves_order_without_blocking() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut sink = FrameSink::queue(tx);
        for i in 0..16u32 {
            sink.deliver(StreamItem::Frame(i)).await;
        }
        for i in 0..16u32 {
            assert_eq!(rx.recv().await, Some(StreamItem::Frame(i)));
        }
    }

    #[tokio::test]
    async fn queue_overflow_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(2);
        let mut sink = FrameSink::queue(tx);
        // Third push must return immediately even though the queue is full.
        for i in 0..3u32 {
            sink.deliver(StreamItem::Frame(i)).await;
        }
        assert_eq!(rx.recv().await, Some(StreamItem::Frame(0)));
        assert_eq!(rx.recv().await, Some(StreamItem::Frame(1)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn callback_is_awaited_per_item() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        let mut sink = FrameSink::callback(move |item: StreamItem<u32>| {
            let seen = Arc::clone(&seen_cb);
            async move {
                tokio::task::yield_now().await;
                if let StreamItem::Frame(i) = item {
                    // FIFO: each frame observes exactly the count of its
                    // predecessors, so no two callbacks overlapped.
                    assert_eq!(seen.load(Ordering::SeqCst), i as usize);
                }
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        for i in 0..8u32 {
            sink.deliver(StreamItem::Frame(i)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 8);
    }
}
