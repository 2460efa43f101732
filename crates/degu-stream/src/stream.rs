#![forbid(unsafe_code)]

//! Observable property container with per-key watchers, any-change
//! listeners, and batched notification.
//!
//! # Design
//!
//! [`PropertyStream`] keeps its fields in shared, reference-counted storage
//! (`Rc<RefCell<..>>`) keyed by name. Only keys marked observable are
//! instrumented: a write to one of them notifies its watchers and then the
//! change listeners, or, while frozen, is recorded as dirty and published
//! once at `unfreeze()`.
//!
//! # States
//!
//! ```text
//!            freeze()
//!   ACTIVE ───────────▶ FROZEN ──┐ freeze() (flat: stays, nested: depth+1)
//!     ▲                   │  ◀───┘
//!     └───── unfreeze() ──┘   publish dirty watchers, then one change
//! ```
//!
//! # Invariants
//!
//! 1. Watchers for a key run in registration order; change listeners
//!    likewise.
//! 2. A write to an unobserved key never invokes a subscriber.
//! 3. While frozen no subscriber runs; on thaw each dirty key's watchers run
//!    once and change listeners run at most once.
//! 4. No borrow of the inner state is held while a subscriber runs, so
//!    subscribers may write back to the stream.
//! 5. `version` increments once per observed write.
//!
//! # Failure Modes
//!
//! - **Subscriber panic**: unwinds through the triggering call. The dirty
//!   keys were already taken out of the freeze state, so keys not yet
//!   published by a panicking thaw are dropped and the stream is ACTIVE.
//! - **Panic inside `batch`**: the batch's own freeze is released during
//!   unwinding and its deferred writes are dropped unpublished. Outer
//!   nested freezes stay in effect.
//! - **Guard dropped mid-publish**: a scoped subscriber whose guard is
//!   dropped by an earlier subscriber is skipped for the rest of that
//!   publish.
//! - **Reference cycle**: a callback that captures a clone of its own stream
//!   keeps the stream alive forever. Callbacks receive the stream as an
//!   argument; use that instead.
//!
//! # Usage
//!
//! ```
//! use degu_stream::PropertyStream;
//! use serde_json::json;
//!
//! let person = PropertyStream::builder()
//!     .observed("name", "John")
//!     .observed("age", 23)
//!     .build();
//!
//! person.watch("age", |p| println!("age is now {:?}", p.get("age")));
//! person.set("age", 24);
//! person.update(&json!({"name": "Riki", "age": 30})).unwrap();
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::freeze::{FreezeState, Release};
use crate::subscription::{Slot, SubscriberList, Subscription};

/// Shared interior for [`PropertyStream`].
struct StreamInner {
    fields: FxHashMap<String, Value>,
    observed: FxHashSet<String>,
    watchers: FxHashMap<String, SubscriberList>,
    listeners: SubscriberList,
    freeze: FreezeState,
    version: u64,
    config: StreamConfig,
}

/// An observable key/value container.
///
/// Cloning a `PropertyStream` creates a new handle to the **same** inner
/// state: fields, subscribers and freeze state are shared.
pub struct PropertyStream {
    inner: Rc<RefCell<StreamInner>>,
}

// Manual Clone: shares the same Rc.
impl Clone for PropertyStream {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Default for PropertyStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PropertyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("PropertyStream")
            .field("label", &inner.config.label)
            .field("fields", &inner.fields.len())
            .field("observed", &inner.observed.len())
            .field("frozen", &inner.freeze.is_frozen())
            .field("version", &inner.version)
            .finish()
    }
}

impl PropertyStream {
    /// Create an empty stream with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StreamConfig::default())
    }

    /// Create an empty stream with the given configuration.
    #[must_use]
    pub fn with_config(config: StreamConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StreamInner {
                fields: FxHashMap::default(),
                observed: FxHashSet::default(),
                watchers: FxHashMap::default(),
                listeners: SubscriberList::default(),
                freeze: FreezeState::new(config.freeze_mode),
                version: 0,
                config,
            })),
        }
    }

    /// Start building a stream with initial fields.
    #[must_use]
    pub fn builder() -> PropertyStreamBuilder {
        PropertyStreamBuilder::default()
    }

    /// A copy of the configuration this stream was built with.
    #[must_use]
    pub fn config(&self) -> StreamConfig {
        self.inner.borrow().config.clone()
    }

    // ── Instrumentation ──────────────────────────────────────────────────

    /// Opt `key` into change notification. A key with no value yet is
    /// defined as `null`. Marking twice has no further effect.
    pub fn mark_observable(&self, key: impl Into<String>) {
        let key = key.into();
        let mut inner = self.inner.borrow_mut();
        inner.fields.entry(key.clone()).or_insert(Value::Null);
        if inner.observed.insert(key.clone()) {
            trace!(label = ?inner.config.label, key = %key, "key marked observable");
        }
    }

    /// Whether writes to `key` notify subscribers.
    #[must_use]
    pub fn is_observable(&self, key: &str) -> bool {
        self.inner.borrow().observed.contains(key)
    }

    /// Observed keys, sorted.
    #[must_use]
    pub fn observed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.borrow().observed.iter().cloned().collect();
        keys.sort_unstable();
        keys
    }

    // ── Field access ─────────────────────────────────────────────────────

    /// A clone of the value stored at `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.borrow().fields.get(key).cloned()
    }

    /// Deserialize the value stored at `key` into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, StreamError> {
        let value = self
            .get(key)
            .ok_or_else(|| StreamError::MissingKey(key.to_owned()))?;
        serde_json::from_value(value).map_err(|err| StreamError::TypeMismatch {
            key: key.to_owned(),
            message: err.to_string(),
        })
    }

    /// Whether a value is stored at `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.borrow().fields.contains_key(key)
    }

    /// Store `value` at `key`.
    ///
    /// For an observed key this notifies the key's watchers and then every
    /// change listener, or marks the key dirty while frozen. Equal values
    /// are not suppressed.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        {
            let mut inner = self.inner.borrow_mut();
            let observed = inner.observed.contains(&key);
            inner.fields.insert(key.clone(), value);
            if !observed {
                return;
            }
            inner.version += 1;
            if inner.freeze.is_frozen() {
                let first = inner.freeze.mark_dirty(&key);
                trace!(label = ?inner.config.label, key = %key, first, "deferred write");
                return;
            }
            trace!(label = ?inner.config.label, key = %key, version = inner.version, "observed write");
        }
        self.publish_change_for(&key);
        self.publish();
    }

    /// Serialize `value` and store it at `key`, as [`set`](Self::set).
    pub fn set_as<T: Serialize + ?Sized>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), StreamError> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|err| StreamError::TypeMismatch {
            key: key.clone(),
            message: err.to_string(),
        })?;
        self.set(key, value);
        Ok(())
    }

    // ── Subscription ─────────────────────────────────────────────────────

    /// Run `callback` after every notified write to `key`.
    pub fn watch(&self, key: impl Into<String>, callback: impl Fn(&PropertyStream) + 'static) {
        self.inner
            .borrow_mut()
            .watchers
            .entry(key.into())
            .or_default()
            .push(callback);
    }

    /// Like [`watch`](Self::watch), but delivery stops when the returned
    /// guard is dropped.
    pub fn watch_scoped(
        &self,
        key: impl Into<String>,
        callback: impl Fn(&PropertyStream) + 'static,
    ) -> Subscription {
        self.inner
            .borrow_mut()
            .watchers
            .entry(key.into())
            .or_default()
            .push_scoped(callback)
    }

    /// Run `callback` after every notified write to any observed key.
    pub fn change(&self, callback: impl Fn(&PropertyStream) + 'static) {
        self.inner.borrow_mut().listeners.push(callback);
    }

    /// Like [`change`](Self::change), but delivery stops when the returned
    /// guard is dropped.
    pub fn change_scoped(&self, callback: impl Fn(&PropertyStream) + 'static) -> Subscription {
        self.inner.borrow_mut().listeners.push_scoped(callback)
    }

    /// Registered watchers for `key`, including dropped scoped ones not yet
    /// pruned.
    #[must_use]
    pub fn watcher_count(&self, key: &str) -> usize {
        self.inner
            .borrow()
            .watchers
            .get(key)
            .map_or(0, SubscriberList::len)
    }

    /// Registered change listeners, including dropped scoped ones not yet
    /// pruned.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.borrow().listeners.len()
    }

    // ── Publishing ───────────────────────────────────────────────────────

    /// Invoke every change listener.
    pub fn publish(&self) {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            if inner.config.debug {
                debug!(label = ?inner.config.label, listeners = inner.listeners.len(), "publish");
            }
            inner.listeners.snapshot()
        };
        self.run(&callbacks);
    }

    /// Invoke every watcher of `key`. No-op when nothing watches it.
    pub fn publish_change_for(&self, key: &str) {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            let label = inner
                .config
                .debug
                .then(|| inner.config.label.clone().unwrap_or_default());
            let Some(list) = inner.watchers.get_mut(key) else {
                return;
            };
            if let Some(label) = label {
                debug!(label = %label, key = %key, watchers = list.len(), "publish change");
            }
            list.snapshot()
        };
        self.run(&callbacks);
    }

    fn run(&self, slots: &[Slot]) {
        for slot in slots {
            // A guard dropped by an earlier subscriber takes effect here.
            if let Some(cb) = slot.upgrade() {
                cb(self);
            }
        }
    }

    // ── Batching ─────────────────────────────────────────────────────────

    /// Defer notification of observed writes until [`unfreeze`](Self::unfreeze).
    pub fn freeze(&self) {
        self.inner.borrow_mut().freeze.freeze();
    }

    /// Leave the frozen state and publish what was deferred: each dirty
    /// key's watchers in first-touch order, then the change listeners once
    /// if anything was dirty. No-op when not frozen.
    pub fn unfreeze(&self) {
        let dirty = {
            let mut inner = self.inner.borrow_mut();
            match inner.freeze.release() {
                Release::Idle | Release::Held => return,
                Release::Thawed(dirty) => {
                    if !dirty.is_empty() {
                        debug!(label = ?inner.config.label, keys = dirty.len(), "flushing frozen writes");
                    }
                    dirty
                }
            }
        };
        if dirty.is_empty() {
            return;
        }
        for key in &dirty {
            self.publish_change_for(key);
        }
        self.publish();
    }

    /// Whether observed writes are currently deferred.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.inner.borrow().freeze.is_frozen()
    }

    /// Keys written while frozen, in first-touch order.
    #[must_use]
    pub fn dirty_keys(&self) -> Vec<String> {
        self.inner.borrow().freeze.dirty().to_vec()
    }

    /// Run `f` between `freeze()` and `unfreeze()`.
    ///
    /// If `f` panics, the freeze it opened is released while unwinding and
    /// the writes it deferred are dropped unpublished.
    pub fn batch<R>(&self, f: impl FnOnce(&PropertyStream) -> R) -> R {
        self.freeze();
        let guard = ThawOnUnwind { stream: self };
        let out = f(self);
        std::mem::forget(guard);
        self.unfreeze();
        out
    }

    /// Undo one freeze without publishing. Used when a batch unwinds.
    fn release_silently(&self) {
        let mut inner = self.inner.borrow_mut();
        if let Release::Thawed(dirty) = inner.freeze.release() {
            if !dirty.is_empty() {
                warn!(label = ?inner.config.label, keys = dirty.len(), "batch panicked, dropping frozen writes");
            }
        }
    }

    /// Assign every entry of the JSON object `data` as one batch.
    ///
    /// Anything other than an object is rejected with
    /// [`StreamError::InvalidArgument`] before any state changes. With
    /// `strict_keys` set, an entry for a key the stream does not hold is
    /// rejected with [`StreamError::UnknownKey`], also before any write.
    pub fn update(&self, data: &Value) -> Result<(), StreamError> {
        let Value::Object(entries) = data else {
            return Err(StreamError::not_a_mapping(data));
        };
        {
            let inner = self.inner.borrow();
            if inner.config.strict_keys {
                if let Some(unknown) = entries.keys().find(|k| !inner.fields.contains_key(*k)) {
                    warn!(label = ?inner.config.label, key = %unknown, "update rejected: unknown key");
                    return Err(StreamError::UnknownKey(unknown.clone()));
                }
            }
        }
        self.batch(|stream| {
            for (key, value) in entries {
                stream.set(key.clone(), value.clone());
            }
        });
        Ok(())
    }

    /// Serialize `data` and apply it with [`update`](Self::update).
    pub fn update_from<T: Serialize + ?Sized>(&self, data: &T) -> Result<(), StreamError> {
        let value =
            serde_json::to_value(data).map_err(|err| StreamError::Serialize(err.to_string()))?;
        self.update(&value)
    }

    /// Number of observed writes so far, frozen or not.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.borrow().version
    }
}

/// Releases a batch's freeze if its closure unwinds. Forgotten on the
/// normal path.
struct ThawOnUnwind<'a> {
    stream: &'a PropertyStream,
}

impl Drop for ThawOnUnwind<'_> {
    fn drop(&mut self) {
        self.stream.release_silently();
    }
}

/// Builder that sets up fields and observed keys before the stream is
/// shared.
#[derive(Debug, Default)]
pub struct PropertyStreamBuilder {
    config: StreamConfig,
    fields: Vec<(String, Value, bool)>,
}

impl PropertyStreamBuilder {
    /// Use `config` for the built stream.
    #[must_use]
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a plain field. Writes to it never notify.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((key.into(), value.into(), false));
        self
    }

    /// Add a field and mark it observable.
    #[must_use]
    pub fn observed(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((key.into(), value.into(), true));
        self
    }

    /// Build the stream. Initial values do not notify.
    #[must_use]
    pub fn build(self) -> PropertyStream {
        let stream = PropertyStream::with_config(self.config);
        {
            let mut inner = stream.inner.borrow_mut();
            for (key, value, observed) in self.fields {
                if observed {
                    inner.observed.insert(key.clone());
                }
                inner.fields.insert(key, value);
            }
        }
        stream
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FreezeMode;
    use serde_json::json;
    use std::cell::Cell;

    fn counter() -> (Rc<Cell<u32>>, impl Fn(&PropertyStream) + 'static) {
        let count = Rc::new(Cell::new(0u32));
        let count_clone = Rc::clone(&count);
        (count, move |_: &PropertyStream| {
            count_clone.set(count_clone.get() + 1)
        })
    }

    fn person() -> PropertyStream {
        PropertyStream::builder()
            .observed("name", "John")
            .observed("age", 23)
            .field("note", "plain")
            .build()
    }

    #[test]
    fn builder_sets_initial_values() {
        let p = person();
        assert_eq!(p.get("name"), Some(json!("John")));
        assert_eq!(p.get_as::<u32>("age").unwrap(), 23);
        assert!(p.is_observable("age"));
        assert!(!p.is_observable("note"));
        assert_eq!(p.observed_keys(), vec!["age".to_string(), "name".to_string()]);
        assert_eq!(p.version(), 0);
    }

    #[test]
    fn mark_observable_defines_missing_key_as_null() {
        let s = PropertyStream::new();
        assert!(!s.contains("x"));
        s.mark_observable("x");
        assert_eq!(s.get("x"), Some(Value::Null));
        assert!(s.is_observable("x"));
    }

    #[test]
    fn mark_observable_keeps_existing_value() {
        let s = PropertyStream::new();
        s.set("x", 5);
        s.mark_observable("x");
        s.mark_observable("x");
        assert_eq!(s.get("x"), Some(json!(5)));
        assert_eq!(s.observed_keys(), vec!["x".to_string()]);
    }

    #[test]
    fn watch_and_change_fire_once_per_write() {
        let p = person();
        let (watched, on_age) = counter();
        let (changed, on_change) = counter();
        p.watch("age", on_age);
        p.change(on_change);

        p.set("age", 24);
        assert_eq!(watched.get(), 1);
        assert_eq!(changed.get(), 1);

        // Same value again is not suppressed.
        p.set("age", 24);
        assert_eq!(watched.get(), 2);
        assert_eq!(changed.get(), 2);
        assert_eq!(p.version(), 2);
    }

    #[test]
    fn watchers_of_other_keys_do_not_fire() {
        let p = person();
        let (watched, on_name) = counter();
        p.watch("name", on_name);
        p.set("age", 40);
        assert_eq!(watched.get(), 0);
    }

    #[test]
    fn unobserved_write_is_silent() {
        let p = person();
        let (changed, on_change) = counter();
        let (watched, on_note) = counter();
        p.change(on_change);
        p.watch("note", on_note);
        p.set("note", "edited");
        p.set("brand_new", 1);
        assert_eq!(changed.get(), 0);
        assert_eq!(watched.get(), 0);
        assert_eq!(p.get("note"), Some(json!("edited")));
        assert_eq!(p.version(), 0);
    }

    #[test]
    fn watchers_run_before_listeners() {
        let p = person();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l1 = Rc::clone(&log);
        p.change(move |_| l1.borrow_mut().push("change"));
        let l2 = Rc::clone(&log);
        p.watch("age", move |_| l2.borrow_mut().push("watch-1"));
        let l3 = Rc::clone(&log);
        p.watch("age", move |_| l3.borrow_mut().push("watch-2"));

        p.set("age", 1);
        assert_eq!(*log.borrow(), vec!["watch-1", "watch-2", "change"]);
    }

    #[test]
    fn callback_sees_new_value() {
        let p = person();
        let seen = Rc::new(Cell::new(0u64));
        let seen_clone = Rc::clone(&seen);
        p.watch("age", move |s| {
            seen_clone.set(s.get_as::<u64>("age").unwrap());
        });
        p.set("age", 77);
        assert_eq!(seen.get(), 77);
    }

    #[test]
    fn freeze_defers_and_coalesces() {
        let p = person();
        let (names, on_name) = counter();
        let (ages, on_age) = counter();
        let (changed, on_change) = counter();
        p.watch("name", on_name);
        p.watch("age", on_age);
        p.change(on_change);

        p.freeze();
        assert!(p.is_frozen());
        p.set("name", "Riki");
        p.set("name", "Riki");
        p.set("age", 30);
        assert_eq!(changed.get(), 0);
        assert_eq!(p.dirty_keys(), vec!["name".to_string(), "age".to_string()]);

        p.unfreeze();
        assert!(!p.is_frozen());
        assert_eq!(names.get(), 1);
        assert_eq!(ages.get(), 1);
        assert_eq!(changed.get(), 1);
        assert!(p.dirty_keys().is_empty());
        assert_eq!(p.version(), 3);
    }

    #[test]
    fn thaw_publishes_dirty_watchers_then_one_change() {
        let p = person();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l1 = Rc::clone(&log);
        p.change(move |_| l1.borrow_mut().push("change"));
        let l2 = Rc::clone(&log);
        p.watch("name", move |_| l2.borrow_mut().push("name"));
        let l3 = Rc::clone(&log);
        p.watch("age", move |_| l3.borrow_mut().push("age"));

        p.batch(|s| {
            s.set("age", 1);
            s.set("name", "x");
        });
        assert_eq!(*log.borrow(), vec!["age", "name", "change"]);
    }

    #[test]
    fn empty_freeze_publishes_nothing() {
        let p = person();
        let (changed, on_change) = counter();
        p.change(on_change);
        p.freeze();
        p.set("note", "unobserved");
        p.unfreeze();
        assert_eq!(changed.get(), 0);
    }

    #[test]
    fn unfreeze_when_active_is_noop() {
        let p = person();
        let (changed, on_change) = counter();
        p.change(on_change);
        p.unfreeze();
        assert_eq!(changed.get(), 0);
        assert!(!p.is_frozen());
    }

    #[test]
    fn flat_freeze_released_by_one_unfreeze() {
        let p = person();
        let (changed, on_change) = counter();
        p.change(on_change);
        p.freeze();
        p.freeze();
        p.set("age", 2);
        p.unfreeze();
        assert!(!p.is_frozen());
        assert_eq!(changed.get(), 1);
    }

    #[test]
    fn nested_freeze_needs_matching_unfreezes() {
        let p = PropertyStream::builder()
            .config(StreamConfig::default().with_freeze_mode(FreezeMode::Nested))
            .observed("a", 0)
            .build();
        let (changed, on_change) = counter();
        p.change(on_change);

        p.freeze();
        p.freeze();
        p.set("a", 1);
        p.unfreeze();
        assert!(p.is_frozen());
        assert_eq!(changed.get(), 0);
        p.unfreeze();
        assert_eq!(changed.get(), 1);
    }

    #[test]
    fn update_batches_writes() {
        let p = person();
        let (names, on_name) = counter();
        let (ages, on_age) = counter();
        let (changed, on_change) = counter();
        p.watch("name", on_name);
        p.watch("age", on_age);
        p.change(on_change);

        p.update(&json!({"name": "Riki", "age": 30})).unwrap();
        assert_eq!((names.get(), ages.get(), changed.get()), (1, 1, 1));
        assert_eq!(p.get("name"), Some(json!("Riki")));
        assert!(!p.is_frozen());
    }

    #[test]
    fn update_rejects_non_mapping() {
        let p = person();
        let (changed, on_change) = counter();
        p.change(on_change);
        for bad in [Value::Null, json!(42), json!("s"), json!([1, 2])] {
            let err = p.update(&bad).unwrap_err();
            assert!(matches!(err, StreamError::InvalidArgument { .. }));
        }
        assert_eq!(changed.get(), 0);
        assert!(!p.is_frozen());
        assert_eq!(p.get("age"), Some(json!(23)));
    }

    #[test]
    fn strict_update_rejects_unknown_key_without_writing() {
        let p = PropertyStream::builder()
            .config(StreamConfig::default().with_strict_keys(true))
            .observed("a", 0)
            .build();
        let (changed, on_change) = counter();
        p.change(on_change);

        let err = p.update(&json!({"a": 1, "zzz": 2})).unwrap_err();
        assert_eq!(err, StreamError::UnknownKey("zzz".into()));
        assert_eq!(p.get("a"), Some(json!(0)));
        assert!(!p.contains("zzz"));
        assert_eq!(changed.get(), 0);
    }

    #[test]
    fn lenient_update_adds_plain_fields() {
        let p = person();
        p.update(&json!({"extra": true})).unwrap();
        assert_eq!(p.get("extra"), Some(json!(true)));
        assert!(!p.is_observable("extra"));
    }

    #[test]
    fn update_from_struct() {
        #[derive(Serialize)]
        struct Patch<'a> {
            name: &'a str,
            age: u8,
        }
        let p = person();
        let (changed, on_change) = counter();
        p.change(on_change);
        p.update_from(&Patch { name: "Ana", age: 5 }).unwrap();
        assert_eq!(p.get_as::<String>("name").unwrap(), "Ana");
        assert_eq!(changed.get(), 1);

        let err = p.update_from(&vec![1, 2]).unwrap_err();
        assert!(matches!(err, StreamError::InvalidArgument { found: "array", .. }));

        // Non-string map keys cannot become a JSON object.
        let bad = std::collections::BTreeMap::from([((1, 2), 3)]);
        let err = p.update_from(&bad).unwrap_err();
        assert!(matches!(err, StreamError::Serialize(_)));
        assert_eq!(changed.get(), 1);
        assert!(!p.is_frozen());
    }

    #[test]
    fn update_publishes_in_caller_key_order() {
        let p = PropertyStream::builder()
            .observed("a", 0)
            .observed("b", 0)
            .build();
        let log = Rc::new(RefCell::new(Vec::new()));
        for key in ["a", "b"] {
            let log = Rc::clone(&log);
            p.watch(key, move |_| log.borrow_mut().push(key));
        }

        p.update(&json!({"b": 1, "a": 2})).unwrap();
        assert_eq!(*log.borrow(), vec!["b", "a"]);

        log.borrow_mut().clear();
        p.batch(|s| {
            s.set("b", 3);
            s.set("a", 4);
        });
        assert_eq!(*log.borrow(), vec!["b", "a"]);
    }

    #[test]
    fn scoped_listener_dropped_mid_publish_does_not_fire() {
        let p = person();
        let (late, on_late) = counter();
        let guard: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let guard_clone = Rc::clone(&guard);
        p.change(move |_| {
            guard_clone.borrow_mut().take();
        });
        *guard.borrow_mut() = Some(p.change_scoped(on_late));

        p.set("age", 1);
        assert_eq!(late.get(), 0);
        assert_eq!(p.listener_count(), 2);
        p.set("age", 2);
        assert_eq!(p.listener_count(), 1);
    }

    #[test]
    fn scoped_watcher_dropped_mid_publish_does_not_fire() {
        let p = person();
        let (late, on_late) = counter();
        let guard: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let guard_clone = Rc::clone(&guard);
        p.watch("age", move |_| {
            guard_clone.borrow_mut().take();
        });
        *guard.borrow_mut() = Some(p.watch_scoped("age", on_late));

        p.set("age", 1);
        assert_eq!(late.get(), 0);
    }

    #[test]
    fn panicking_batch_releases_freeze() {
        let p = person();
        let (ages, on_age) = counter();
        let (changed, on_change) = counter();
        p.watch("age", on_age);
        p.change(on_change);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            p.batch(|s| {
                s.set("age", 40);
                panic!("batch failed");
            })
        }));
        assert!(result.is_err());
        assert!(!p.is_frozen());
        assert!(p.dirty_keys().is_empty());
        assert_eq!((ages.get(), changed.get()), (0, 0));
        // The write itself landed; only its notification was dropped.
        assert_eq!(p.get("age"), Some(json!(40)));

        p.set("age", 41);
        assert_eq!((ages.get(), changed.get()), (1, 1));
    }

    #[test]
    fn panicking_batch_inside_nested_freeze_keeps_outer_freeze() {
        let p = PropertyStream::builder()
            .config(StreamConfig::default().with_freeze_mode(FreezeMode::Nested))
            .observed("a", 0)
            .build();
        let (changed, on_change) = counter();
        p.change(on_change);

        p.freeze();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            p.batch(|s| {
                s.set("a", 1);
                panic!("batch failed");
            })
        }));
        assert!(result.is_err());
        assert!(p.is_frozen());
        p.unfreeze();
        assert!(!p.is_frozen());
        assert_eq!(changed.get(), 1);
    }

    #[test]
    fn typed_accessors() {
        let p = person();
        p.set_as("tags", &["a", "b"]).unwrap();
        assert_eq!(p.get_as::<Vec<String>>("tags").unwrap(), vec!["a", "b"]);
        assert_eq!(
            p.get_as::<u8>("missing").unwrap_err(),
            StreamError::MissingKey("missing".into())
        );
        let err = p.get_as::<u8>("name").unwrap_err();
        assert!(matches!(err, StreamError::TypeMismatch { key, .. } if key == "name"));
    }

    #[test]
    fn scoped_subscriptions_stop_on_drop() {
        let p = person();
        let (watched, on_age) = counter();
        let (changed, on_change) = counter();
        let w = p.watch_scoped("age", on_age);
        let c = p.change_scoped(on_change);

        p.set("age", 1);
        assert_eq!((watched.get(), changed.get()), (1, 1));

        drop(w);
        drop(c);
        p.set("age", 2);
        assert_eq!((watched.get(), changed.get()), (1, 1));
        assert_eq!(p.watcher_count("age"), 0);
        assert_eq!(p.listener_count(), 0);
    }

    #[test]
    fn manual_publish() {
        let p = person();
        let (watched, on_age) = counter();
        let (changed, on_change) = counter();
        p.watch("age", on_age);
        p.change(on_change);

        p.publish_change_for("age");
        p.publish_change_for("nobody-watches");
        p.publish();
        assert_eq!((watched.get(), changed.get()), (1, 1));
        assert_eq!(p.version(), 0);
    }

    #[test]
    fn reentrant_write_cascades_before_outer_listeners_continue() {
        let p = person();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l1 = Rc::clone(&log);
        p.change(move |s| {
            l1.borrow_mut().push("change-1");
            if s.get_as::<String>("name").unwrap() == "John" {
                s.set("name", "Nested");
            }
        });
        let l2 = Rc::clone(&log);
        p.watch("name", move |_| l2.borrow_mut().push("watch-name"));
        let l3 = Rc::clone(&log);
        p.change(move |_| l3.borrow_mut().push("change-2"));

        p.set("age", 50);
        assert_eq!(
            *log.borrow(),
            vec![
                "change-1",   // outer
                "watch-name", // nested write
                "change-1",   // nested
                "change-2",   // nested
                "change-2",   // outer resumes
            ]
        );
    }

    #[test]
    fn subscriber_added_during_publish_fires_next_time() {
        let p = person();
        let (late, on_late) = counter();
        let on_late = Rc::new(on_late);
        let added = Rc::new(Cell::new(false));
        let added_clone = Rc::clone(&added);
        p.change(move |s| {
            if !added_clone.replace(true) {
                let on_late = Rc::clone(&on_late);
                s.change(move |s| (*on_late)(s));
            }
        });

        p.set("age", 1);
        assert_eq!(late.get(), 0);
        p.set("age", 2);
        assert_eq!(late.get(), 1);
    }

    #[test]
    fn panicking_watcher_during_thaw_leaves_stream_usable() {
        let p = person();
        let (ages, on_age) = counter();
        let (changed, on_change) = counter();
        p.watch("name", |_| panic!("boom"));
        p.watch("age", on_age);
        p.change(on_change);

        p.freeze();
        p.set("name", "x");
        p.set("age", 1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| p.unfreeze()));
        assert!(result.is_err());

        // Remaining dirty keys were discarded; the stream is active again.
        assert!(!p.is_frozen());
        assert!(p.dirty_keys().is_empty());
        assert_eq!((ages.get(), changed.get()), (0, 0));
        p.unfreeze();
        assert_eq!(ages.get(), 0);

        p.set("age", 2);
        assert_eq!((ages.get(), changed.get()), (1, 1));
    }

    #[test]
    fn clone_shares_state() {
        let a = person();
        let b = a.clone();
        let (changed, on_change) = counter();
        a.change(on_change);
        b.set("age", 99);
        assert_eq!(a.get("age"), Some(json!(99)));
        assert_eq!(changed.get(), 1);
    }

    #[test]
    fn debug_format() {
        let p = PropertyStream::builder()
            .config(StreamConfig::default().with_label("person"))
            .observed("a", 1)
            .build();
        let dbg = format!("{p:?}");
        assert!(dbg.contains("PropertyStream"));
        assert!(dbg.contains("person"));
        assert!(dbg.contains("version"));
    }
}
