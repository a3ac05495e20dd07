//! Live subscription handle: a stream of full-set deliveries plus an
//! idempotent cancel.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use civicwatch_core::{CivicError, IncidentRecord};

/// One delivery: the complete current record set, or the error that broke
/// the subscription. Nothing follows an error.
pub type FeedDelivery = Result<Vec<IncidentRecord>, CivicError>;

/// Producer half held by the store implementation.
pub type FeedSender = mpsc::UnboundedSender<FeedDelivery>;

type Teardown = Box<dyn FnOnce() + Send>;

struct SubscriptionInner {
    cancelled: AtomicBool,
    teardown: Mutex<Option<Teardown>>,
}

/// Cancellation handle. Clones share state; the teardown runs exactly once no
/// matter how many clones call [`cancel`](Subscription::cancel).
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                cancelled: AtomicBool::new(false),
                teardown: Mutex::new(Some(Box::new(teardown))),
            }),
        }
    }

    /// Returns `true` only for the call that actually unsubscribed.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        let teardown = self
            .inner
            .teardown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(teardown) = teardown {
            teardown();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Consumer half of a live subscription. Cancelled on drop.
pub struct IncidentFeed {
    rx: mpsc::UnboundedReceiver<FeedDelivery>,
    subscription: Subscription,
}

impl IncidentFeed {
    pub fn new(rx: mpsc::UnboundedReceiver<FeedDelivery>, subscription: Subscription) -> Self {
        Self { rx, subscription }
    }

    /// Build a connected sender/feed pair; `teardown` runs on the first cancel.
    pub fn channel(teardown: impl FnOnce() + Send + 'static) -> (FeedSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx, Subscription::new(teardown)))
    }

    /// Next delivery, or `None` once the store side has closed.
    pub async fn next_delivery(&mut self) -> Option<FeedDelivery> {
        self.rx.recv().await
    }

    pub fn cancel(&self) -> bool {
        self.subscription.cancel()
    }

    pub fn subscription(&self) -> Subscription {
        self.subscription.clone()
    }
}

impl Stream for IncidentFeed {
    type Item = FeedDelivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for IncidentFeed {
    fn drop(&mut self) {
        self.subscription.cancel();
    }
}
