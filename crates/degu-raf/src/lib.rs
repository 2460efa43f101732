#![forbid(unsafe_code)]

//! Per-frame update loop for degu components.
//!
//! [`Raf`] dispatches registered callbacks once per frame, optionally capped
//! to a frame rate, and publishes its running state through a
//! [`degu_stream::PropertyStream`].

pub mod error;
pub mod raf;

pub use error::RafError;
pub use raf::{FrameInfo, Raf, RafConfig, RafId};
