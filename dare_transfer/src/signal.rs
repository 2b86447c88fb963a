//! Notifications tied to GPU completion.
//!
//! Both types are cheap handles around shared state: cloning one gives another handle to the
//! same callback list or resource list.
use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

use crate::util::lock;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A list of callbacks run once the submission they depend on has retired
#[derive(Clone, Default)]
pub struct CompletionSignal {
    callbacks: Arc<Mutex<Vec<Callback>>>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` on the next [`Self::fire`]
    pub fn connect<F: FnOnce() + Send + 'static>(&self, callback: F) {
        lock(&self.callbacks).push(Box::new(callback));
    }

    /// Runs and disconnects every connected callback, returning how many ran.
    ///
    /// Callbacks run after the internal lock is released, so they may connect new callbacks.
    pub fn fire(&self) -> usize {
        let callbacks = self.take();
        let count = callbacks.len();
        for callback in callbacks {
            callback();
        }
        count
    }

    /// Number of callbacks waiting for the next fire
    pub fn pending(&self) -> usize {
        lock(&self.callbacks).len()
    }

    fn take(&self) -> Vec<Callback> {
        std::mem::take(&mut *lock(&self.callbacks))
    }
}

impl Debug for CompletionSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Strong references held until the submission using them has retired
#[derive(Clone, Default)]
pub struct ResourceKeeper {
    resources: Arc<Mutex<Vec<Arc<dyn Any + Send + Sync>>>>,
}

impl ResourceKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keep<T: Any + Send + Sync>(&self, resource: Arc<T>) {
        lock(&self.resources).push(resource);
    }

    /// Drops every kept reference, returning how many there were
    pub fn clear(&self) -> usize {
        self.take().len()
    }

    fn take(&self) -> Vec<Arc<dyn Any + Send + Sync>> {
        std::mem::take(&mut *lock(&self.resources))
    }

    pub fn len(&self) -> usize {
        lock(&self.resources).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for ResourceKeeper {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceKeeper")
            .field("len", &self.len())
            .finish()
    }
}

/// The callbacks and resources of a retired submission, detached from their signal and keeper.
///
/// Completions are taken under the scheduler lock and completed after it is released.
#[must_use = "a completion runs nothing until completed"]
pub(crate) struct Completion {
    callbacks: Vec<Callback>,
    resources: Vec<Arc<dyn Any + Send + Sync>>,
}

impl Completion {
    pub(crate) fn take(signal: &CompletionSignal, keeper: &ResourceKeeper) -> Self {
        Self {
            callbacks: signal.take(),
            resources: keeper.take(),
        }
    }

    /// Runs the callbacks, then drops the resources
    pub(crate) fn complete(self) {
        let Self {
            callbacks,
            resources,
        } = self;
        for callback in callbacks {
            callback();
        }
        drop(resources);
    }
}
