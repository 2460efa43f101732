#![forbid(unsafe_code)]

/// Errors from frame scheduler operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RafError {
    /// A frame-rate cap was zero, negative, or not finite.
    InvalidFps(f64),
}

impl std::fmt::Display for RafError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFps(fps) => {
                write!(f, "invalid fps {fps}: expected a finite value above 0")
            }
        }
    }
}

impl std::error::Error for RafError {}
