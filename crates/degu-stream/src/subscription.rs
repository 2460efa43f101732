#![forbid(unsafe_code)]

//! Subscriber storage for watch and change lists.
//!
//! A list holds two kinds of entries: persistent callbacks, owned by the
//! list for the stream's lifetime, and scoped callbacks, held as `Weak`
//! references whose strong side lives in a [`Subscription`] guard. Dead
//! scoped entries are pruned lazily when the list is snapshotted, and a
//! snapshot keeps scoped entries weak until the moment they are invoked, so
//! a guard dropped mid-publish stops delivery for the rest of that publish.

use std::rc::{Rc, Weak};

use crate::stream::PropertyStream;

/// A subscriber callback. Receives the stream that published.
pub(crate) type Callback = Rc<dyn Fn(&PropertyStream)>;
type CallbackWeak = Weak<dyn Fn(&PropertyStream)>;

#[derive(Clone)]
pub(crate) enum Slot {
    Persistent(Callback),
    Scoped(CallbackWeak),
}

impl Slot {
    fn is_live(&self) -> bool {
        match self {
            Self::Persistent(_) => true,
            Self::Scoped(weak) => weak.strong_count() > 0,
        }
    }

    /// The callback, or `None` if its guard has been dropped.
    pub(crate) fn upgrade(&self) -> Option<Callback> {
        match self {
            Self::Persistent(cb) => Some(Rc::clone(cb)),
            Self::Scoped(weak) => weak.upgrade(),
        }
    }
}

/// Ordered subscriber list. Registration order is invocation order.
#[derive(Default)]
pub(crate) struct SubscriberList {
    slots: Vec<Slot>,
}

impl SubscriberList {
    pub(crate) fn push(&mut self, callback: impl Fn(&PropertyStream) + 'static) {
        self.slots.push(Slot::Persistent(Rc::new(callback)));
    }

    pub(crate) fn push_scoped(
        &mut self,
        callback: impl Fn(&PropertyStream) + 'static,
    ) -> Subscription {
        let strong: Callback = Rc::new(callback);
        self.slots.push(Slot::Scoped(Rc::downgrade(&strong)));
        Subscription {
            _guard: Box::new(strong),
        }
    }

    /// Number of entries, including dead scoped ones not yet pruned.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Prune dead entries and clone out the rest, so the caller can invoke
    /// them without holding a borrow of the stream. Scoped entries stay
    /// weak; upgrade each one right before calling it.
    pub(crate) fn snapshot(&mut self) -> Vec<Slot> {
        self.slots.retain(Slot::is_live);
        self.slots.clone()
    }
}

impl std::fmt::Debug for SubscriberList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberList")
            .field("len", &self.slots.len())
            .finish()
    }
}

/// RAII guard for a scoped subscriber.
///
/// Dropping the guard drops the only strong reference to the callback, so
/// the stream's `Weak` entry fails to upgrade on the next publish.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    _guard: Box<dyn std::any::Any>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
