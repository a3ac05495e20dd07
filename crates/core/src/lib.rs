pub mod config;
pub mod error;
pub mod incident;
pub mod snapshot;

pub use config::Config;
pub use error::*;
pub use incident::*;
pub use snapshot::*;
