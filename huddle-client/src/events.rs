//! Callback subscription plumbing.
//!
//! Room events are delivered to registered callbacks; a [`Subscription`]
//! is the RAII registration handle, removed on drop. Callbacks run on
//! whatever task produced the event, so they should be quick and must not
//! block.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use huddle_store::{NodeId, StorageUpdate};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct TopicInner<T> {
    next_id: u64,
    subscribers: Vec<(u64, Callback<T>)>,
}

/// One event stream with any number of subscribers.
pub(crate) struct Topic<T> {
    inner: Arc<Mutex<TopicInner<T>>>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Topic<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TopicInner {
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.push((id, Arc::new(callback)));
            id
        };
        let weak: Weak<Mutex<TopicInner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
                    inner.subscribers.retain(|(sub_id, _)| *sub_id != id);
                }
            })),
        }
    }

    pub fn emit(&self, value: &T) {
        // snapshot under the lock, invoke outside it
        let callbacks: Vec<Callback<T>> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in callbacks {
            callback(value);
        }
    }

    fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .is_empty()
    }
}

/// Registration handle; dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Explicit, readable form of `drop(subscription)`.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Per-node storage subscriptions.
pub(crate) struct NodeTopics {
    topics: Mutex<HashMap<NodeId, Topic<StorageUpdate>>>,
}

impl NodeTopics {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(
        &self,
        id: NodeId,
        callback: impl Fn(&StorageUpdate) + Send + Sync + 'static,
    ) -> Subscription {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(id)
            .or_insert_with(Topic::new)
            .subscribe(callback)
    }

    pub fn emit(&self, update: &StorageUpdate) {
        let topic = {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            // drop topics whose last subscriber went away
            topics.retain(|_, topic| !topic.is_empty());
            topics.get(&update.node()).cloned()
        };
        if let Some(topic) = topic {
            topic.emit(update);
        }
    }
}
