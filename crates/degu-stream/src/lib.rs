#![forbid(unsafe_code)]

//! Observable property container for degu.
//!
//! # Role in degu
//! `degu-stream` is the reactive core that components build on: a container
//! whose marked fields publish every write to per-key watchers and to
//! any-change listeners, with a freeze/unfreeze batching mode so multi-field
//! updates notify once.
//!
//! # Primary pieces
//! - [`PropertyStream`]: the container and its subscriber tables.
//! - [`Subscription`]: RAII guard for scoped subscribers.
//! - [`StreamConfig`]: label, debug events, freeze mode, strict keys.
//! - [`StreamError`]: failures of bulk updates and typed access.
//!
//! Values are [`serde_json::Value`], re-exported as [`Value`].

pub mod config;
pub mod error;
mod freeze;
pub mod logging;
pub mod stream;
pub mod subscription;

pub use config::{FreezeMode, StreamConfig};
pub use error::StreamError;
pub use serde_json::Value;
pub use stream::{PropertyStream, PropertyStreamBuilder};
pub use subscription::Subscription;
