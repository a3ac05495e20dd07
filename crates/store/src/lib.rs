//! Collaborator boundary for the remote incident store and identity.
//!
//! This crate provides:
//! - [`IncidentStore`] and [`IdentityProvider`] traits
//! - [`IncidentFeed`]: a cancellable stream of full-snapshot deliveries
//! - [`acquire_principal`]: token sign-in with anonymous fallback and a timeout
//! - In-process reference implementations ([`MemoryIncidentStore`], [`LocalIdentity`])

pub mod feed;
pub mod identity;
pub mod memory;
pub mod traits;

pub use feed::{FeedDelivery, FeedSender, IncidentFeed, Subscription};
pub use identity::{acquire_principal, LocalIdentity};
pub use memory::MemoryIncidentStore;
pub use traits::{IdentityProvider, IncidentStore};
