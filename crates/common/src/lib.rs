//! Common types for the OpenRouter key-rotation proxy

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
