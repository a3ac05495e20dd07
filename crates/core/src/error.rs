use thiserror::Error;

use crate::snapshot::Metric;

#[derive(Error, Debug)]
pub enum CivicError {
    /// Missing or invalid backing-service configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Identity acquisition failed.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A single incident append failed. Never partially written.
    #[error("Store write error: {0}")]
    StoreWrite(String),

    /// The live incident feed broke.
    #[error("Store subscription error: {0}")]
    StoreSubscription(String),

    /// A metric reading outside [0, 1] or not finite.
    #[error("Malformed snapshot: {metric} = {value}")]
    MalformedSnapshot { metric: Metric, value: f64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl CivicError {
    /// Whether the error belongs to the store boundary (write or feed).
    pub fn is_store_error(&self) -> bool {
        matches!(self, CivicError::StoreWrite(_) | CivicError::StoreSubscription(_))
    }
}

pub type Result<T> = std::result::Result<T, CivicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_classified() {
        assert!(CivicError::StoreWrite("rejected".into()).is_store_error());
        assert!(CivicError::StoreSubscription("closed".into()).is_store_error());
        assert!(!CivicError::Authentication("bad token".into()).is_store_error());
        assert!(!CivicError::Configuration("missing key".into()).is_store_error());
    }
}
