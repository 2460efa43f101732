#![forbid(unsafe_code)]

//! Cooperative per-frame callback scheduler.
//!
//! # Design
//!
//! [`Raf`] holds an ordered list of frame callbacks and dispatches them once
//! per frame. It never spins its own loop: the host drives it by calling
//! [`tick`](Raf::tick) with a millisecond timestamp (from an animation
//! frame, a render loop, or a test clock), or [`tick_now`](Raf::tick_now).
//!
//! With an fps cap, a tick arriving less than `1000 / fps` ms after the last
//! dispatched frame is skipped. When a frame does run, the frame clock is
//! re-aligned to `timestamp - delta % interval`, so the dispatch rate tracks
//! the cap instead of drifting with tick jitter.
//!
//! The running flag and fps cap are published through a
//! [`PropertyStream`] (`running`, `fps`), so components can react to the
//! scheduler starting or stopping.
//!
//! # Invariants
//!
//! 1. Callbacks run in registration order, at most once per frame.
//! 2. A callback removed during a frame does not run later in that frame; a
//!    callback added during a frame first runs on the next one.
//! 3. `frame` increments by exactly 1 per dispatched frame.
//! 4. With a cap, the k-th frame after a start is at least
//!    `(k - 1) * interval` ms after the first.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Tick while stopped | Returns `false`, nothing runs |
//! | Timestamp earlier than last frame | Delta clamps to 0 |
//! | Invalid fps | `RafError::InvalidFps`, cap unchanged |
//! | Callback panics | Unwinds through `tick`; the frame counter has already advanced |

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use degu_stream::{PropertyStream, StreamConfig, Value};
use tracing::{debug, trace};
use web_time::Instant;

use crate::error::RafError;

/// Options for a [`Raf`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RafConfig {
    /// Frame-rate cap. `None` dispatches on every tick. Default: `None`.
    pub fps: Option<f64>,
    /// Start running on construction. Default: false.
    pub autostart: bool,
}

/// Timing of one dispatched frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    /// 1-based frame number since the scheduler was created.
    pub frame: u64,
    /// Timestamp passed to `tick`, in ms.
    pub timestamp_ms: f64,
    /// Time since the previous dispatched frame; 0 for the first frame
    /// after a start.
    pub delta_ms: f64,
    /// Time since the first frame after the most recent start.
    pub elapsed_ms: f64,
}

/// Handle returned by [`Raf::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RafId(u64);

type FrameCallback = Rc<dyn Fn(&FrameInfo)>;

struct Entry {
    id: RafId,
    callback: FrameCallback,
    active: Rc<Cell<bool>>,
}

struct RafInner {
    entries: Vec<Entry>,
    next_id: u64,
    fps: Option<f64>,
    running: bool,
    frame: u64,
    /// Aligned time of the last dispatched frame.
    last_ms: Option<f64>,
    /// Time of the first frame since the last start.
    start_ms: Option<f64>,
}

/// Per-frame callback scheduler.
///
/// Cloning a `Raf` creates a new handle to the same scheduler.
pub struct Raf {
    inner: Rc<RefCell<RafInner>>,
    state: PropertyStream,
    origin: Instant,
}

impl Clone for Raf {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            state: self.state.clone(),
            origin: self.origin,
        }
    }
}

impl Default for Raf {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Raf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Raf")
            .field("running", &inner.running)
            .field("fps", &inner.fps)
            .field("frame", &inner.frame)
            .field("callbacks", &inner.entries.len())
            .finish()
    }
}

fn validate_fps(fps: Option<f64>) -> Result<Option<f64>, RafError> {
    match fps {
        Some(v) if !v.is_finite() || v <= 0.0 => Err(RafError::InvalidFps(v)),
        other => Ok(other),
    }
}

fn fps_value(fps: Option<f64>) -> Value {
    fps.map_or(Value::Null, Value::from)
}

impl Raf {
    /// Create a stopped scheduler with no fps cap.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a scheduler from `config`.
    pub fn with_config(config: RafConfig) -> Result<Self, RafError> {
        let fps = validate_fps(config.fps)?;
        let raf = Self::build(fps);
        if config.autostart {
            raf.start();
        }
        Ok(raf)
    }

    fn build(fps: Option<f64>) -> Self {
        let state = PropertyStream::builder()
            .config(StreamConfig::default().with_label("raf"))
            .observed("running", false)
            .observed("fps", fps_value(fps))
            .build();
        Self {
            inner: Rc::new(RefCell::new(RafInner {
                entries: Vec::new(),
                next_id: 0,
                fps,
                running: false,
                frame: 0,
                last_ms: None,
                start_ms: None,
            })),
            state,
            origin: Instant::now(),
        }
    }

    /// Observable state: `running` (bool) and `fps` (number or null).
    #[must_use]
    pub fn state(&self) -> &PropertyStream {
        &self.state
    }

    /// Register a frame callback.
    pub fn watch(&self, callback: impl Fn(&FrameInfo) + 'static) -> RafId {
        let mut inner = self.inner.borrow_mut();
        let id = RafId(inner.next_id);
        inner.next_id += 1;
        inner.entries.push(Entry {
            id,
            callback: Rc::new(callback),
            active: Rc::new(Cell::new(true)),
        });
        id
    }

    /// Remove a frame callback. Returns false if `id` was not registered.
    pub fn unwatch(&self, id: RafId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let Some(pos) = inner.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = inner.entries.remove(pos);
        entry.active.set(false);
        true
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// Begin dispatching frames. No-op when already running.
    pub fn start(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.running {
                return;
            }
            inner.running = true;
            inner.last_ms = None;
            inner.start_ms = None;
            debug!(callbacks = inner.entries.len(), "raf started");
        }
        self.state.set("running", true);
    }

    /// Stop dispatching frames. No-op when already stopped.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.running {
                return;
            }
            inner.running = false;
            inner.last_ms = None;
            debug!(frame = inner.frame, "raf stopped");
        }
        self.state.set("running", false);
    }

    /// Whether ticks dispatch frames.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.borrow().running
    }

    /// Set or clear the frame-rate cap.
    pub fn set_fps(&self, fps: Option<f64>) -> Result<(), RafError> {
        let fps = validate_fps(fps)?;
        self.inner.borrow_mut().fps = fps;
        debug!(fps = ?fps, "raf fps set");
        self.state.set("fps", fps_value(fps));
        Ok(())
    }

    /// Current frame-rate cap.
    #[must_use]
    pub fn fps(&self) -> Option<f64> {
        self.inner.borrow().fps
    }

    /// Frames dispatched so far.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.inner.borrow().frame
    }

    /// Milliseconds since this scheduler was created, on a monotonic clock.
    #[must_use]
    pub fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }

    /// Tick with the current monotonic time.
    pub fn tick_now(&self) -> bool {
        self.tick(self.now_ms())
    }

    /// Offer a frame at `timestamp_ms`. Returns true if callbacks ran.
    pub fn tick(&self, timestamp_ms: f64) -> bool {
        let (info, callbacks) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.running {
                return false;
            }
            let delta = inner
                .last_ms
                .map_or(0.0, |last| (timestamp_ms - last).max(0.0));
            match (inner.fps, inner.last_ms) {
                (Some(fps), Some(_)) => {
                    let interval = 1000.0 / fps;
                    if delta < interval {
                        trace!(delta, interval, "frame throttled");
                        return false;
                    }
                    inner.last_ms = Some(timestamp_ms - delta % interval);
                }
                _ => inner.last_ms = Some(timestamp_ms),
            }
            let start = *inner.start_ms.get_or_insert(timestamp_ms);
            inner.frame += 1;
            let info = FrameInfo {
                frame: inner.frame,
                timestamp_ms,
                delta_ms: delta,
                elapsed_ms: (timestamp_ms - start).max(0.0),
            };
            let callbacks: Vec<(FrameCallback, Rc<Cell<bool>>)> = inner
                .entries
                .iter()
                .map(|e| (Rc::clone(&e.callback), Rc::clone(&e.active)))
                .collect();
            (info, callbacks)
        };
        for (callback, active) in &callbacks {
            if active.get() {
                callback(&info);
            }
        }
        true
    }

    /// Stop and drop every callback.
    pub fn dispose(&self) {
        self.stop();
        let entries = std::mem::take(&mut self.inner.borrow_mut().entries);
        for entry in &entries {
            entry.active.set(false);
        }
        debug!(dropped = entries.len(), "raf disposed");
    }
}
