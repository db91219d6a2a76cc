// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Change notification for registry mutations.
//!
//! Every subscriber lives in one list and carries a delivery tag:
//!
//! - `Sync` callbacks run inline on the task that completed the mutation.
//!   They should be quick (e.g. push into a channel).
//! - `Deferred` callbacks produce a future that is spawned onto the tokio
//!   runtime, so slow consumers never hold up the writer.
//!
//! Failures (errors or panics) are logged and swallowed. They happen strictly
//! after the mutation was persisted and cannot affect it or other
//! subscribers.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use protocol::ModelList;

type SyncCallback = dyn Fn(&ModelList) -> Result<()> + Send + Sync;
type DeferredCallback = dyn Fn(ModelList) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Handle returned by `subscribe*`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Clone)]
enum Delivery {
    Sync(Arc<SyncCallback>),
    Deferred(Arc<DeferredCallback>),
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriberId,
    delivery: Delivery,
}

/// Subscriber list plus the dispatch routine.
#[derive(Default)]
pub struct Notifier {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, delivery: Delivery) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { id, delivery });
        id
    }

    /// Register a callback invoked inline after each mutation.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&ModelList) -> Result<()> + Send + Sync + 'static,
    {
        self.push(Delivery::Sync(Arc::new(callback)))
    }

    /// Register an async callback; each notification is spawned as a task.
    pub fn subscribe_deferred<F, Fut>(&self, callback: F) -> SubscriberId
    where
        F: Fn(ModelList) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let wrapped = move |list: ModelList| callback(list).boxed();
        self.push(Delivery::Deferred(Arc::new(wrapped)))
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn clear(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Deliver `list` to every subscriber.
    pub fn notify(&self, list: &ModelList) {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        debug!(
            "notifying {} subscriber(s) of registry version {}",
            subscribers.len(),
            list.version
        );

        for sub in subscribers {
            match sub.delivery {
                Delivery::Sync(callback) => {
                    match catch_unwind(AssertUnwindSafe(|| (*callback)(list))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("registry subscriber {:?} failed: {:#}", sub.id, e),
                        Err(_) => warn!("registry subscriber {:?} panicked", sub.id),
                    }
                }
                Delivery::Deferred(callback) => {
                    let owned = list.clone();
                    let fut = match catch_unwind(AssertUnwindSafe(|| (*callback)(owned))) {
                        Ok(fut) => fut,
                        Err(_) => {
                            warn!("registry subscriber {:?} panicked", sub.id);
                            continue;
                        }
                    };
                    spawn_delivery(sub.id, fut);
                }
            }
        }
    }
}

fn spawn_delivery(id: SubscriberId, fut: BoxFuture<'static, Result<()>>) {
    let task = async move {
        if let Err(e) = fut.await {
            warn!("deferred registry subscriber {:?} failed: {:#}", id, e);
        }
    };
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => {
            // No runtime on this thread (e.g. a blocking caller); drive the
            // delivery on its own thread instead of dropping it.
            std::thread::spawn(move || futures::executor::block_on(task));
        }
    }
}
