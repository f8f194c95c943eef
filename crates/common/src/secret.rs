//! Secret wrapper for sensitive values

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Masked rendering for logs: first four and last four characters with
    /// the middle replaced. Values of eight characters or fewer are fully
    /// masked so short keys leak nothing. Counts characters, not bytes, so
    /// arbitrary UTF-8 credentials never split a char boundary.
    pub fn masked(&self) -> String {
        let s = &self.0;
        let chars = s.chars().count();
        if chars <= 8 {
            return "****".to_string();
        }
        let head: String = s.chars().take(4).collect();
        let tail: String = s.chars().skip(chars - 4).collect();
        format!("{head}****{tail}")
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
