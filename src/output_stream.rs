//! Broadcast primitive: one producer, many callback subscribers plus one
//! blocking iterator.
//!
//! Follows the same panic-tolerant fan-out pattern used for concurrent task
//! spawns elsewhere in this crate (a failing task is logged and does not
//! stop its siblings): here, a callback that panics is caught, logged, and
//! does not prevent the remaining callbacks -- or the `each` iterator --
//! from seeing the item.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Broadcasts items produced by one writer to zero-or-more callbacks and to
/// one blocking iterator. Closable with close-sentinel semantics: once
/// closed, `emit` is a silent no-op and the iterator drains whatever was
/// accepted before close, then terminates.
pub struct OutputStream<T> {
    callbacks: Mutex<Vec<Callback<T>>>,
    closed: AtomicBool,
    iter_tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    iter_rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
}

impl<T> std::fmt::Debug for OutputStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStream")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> OutputStream<T> {
    /// Construct an empty, open stream.
    pub fn new() -> Self {
        let (iter_tx, iter_rx) = mpsc::unbounded_channel();
        Self {
            callbacks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            iter_tx: Mutex::new(Some(iter_tx)),
            iter_rx: Mutex::new(Some(iter_rx)),
        }
    }

    /// Register a callback, invoked synchronously (in registration order)
    /// for every subsequent `emit`. Multiple registrations are allowed.
    pub async fn on_data<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.callbacks.lock().await.push(Arc::new(callback));
    }

    /// A blocking iterator over every item accepted before close, followed
    /// by termination. Call at most once per stream; a second call returns
    /// a stream that yields nothing (the receiver was already taken).
    pub async fn each(&self) -> impl futures::Stream<Item = T> {
        let rx = self.iter_rx.lock().await.take();
        futures::stream::unfold(rx, |mut rx| async move {
            match rx.as_mut() {
                Some(r) => r.recv().await.map(|item| (item, rx)),
                None => None,
            }
        })
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver `item` to every registered callback (outside the callback
    /// lock, so a slow or reentrant callback cannot block `emit` itself or
    /// a concurrent `on_data` registration) and to the `each` iterator. A
    /// silent no-op once closed.
    pub async fn emit(&self, item: T) {
        if self.is_closed() {
            return;
        }
        let callbacks = self.callbacks.lock().await.clone();
        for cb in &callbacks {
            let cb = Arc::clone(cb);
            let item_ref = &item;
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| cb(item_ref)));
            if let Err(_panic) = result {
                tracing::error!("OutputStream callback panicked; continuing with remaining callbacks");
            }
        }
        // Ignore send errors: the iterator may simply never be consumed.
        if let Some(tx) = self.iter_tx.lock().await.as_ref() {
            let _ = tx.send(item);
        }
    }

    /// Idempotent close. No further `emit` calls are delivered; the `each`
    /// iterator terminates once it has drained items accepted before this
    /// call. Dropping the held sender here is what lets `recv()` observe
    /// end-of-stream -- without it, the `each` iterator would block forever
    /// after draining the items accepted before close.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.iter_tx.lock().await.take();
    }
}

impl<T: Clone + Send + Sync + 'static> Default for OutputStream<T> {
    fn default() -> Self {
        Self::new()
    }
}
