use std::sync::Arc;

use async_trait::async_trait;

use civicwatch_core::{CollectionRef, IncidentDraft, PrincipalId, RecordId, Result};

use crate::feed::IncidentFeed;

/// Append-only remote incident collection with a live full-set feed.
///
/// Implementations assign the record id and the persistence timestamp.
/// A failed append must not leave a partial record behind.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// Append one draft. Fails with `CivicError::StoreWrite`.
    async fn append(&self, collection: &CollectionRef, draft: &IncidentDraft) -> Result<RecordId>;

    /// Open a live subscription. Every change to the collection delivers the
    /// complete current record set (not a diff), in no particular order.
    /// Fails with `CivicError::StoreSubscription`.
    async fn watch(&self, collection: &CollectionRef) -> Result<IncidentFeed>;
}

/// Blanket implementation so `Arc<dyn IncidentStore>` can be used directly.
#[async_trait]
impl<T: IncidentStore + ?Sized> IncidentStore for Arc<T> {
    async fn append(&self, collection: &CollectionRef, draft: &IncidentDraft) -> Result<RecordId> {
        (**self).append(collection, draft).await
    }

    async fn watch(&self, collection: &CollectionRef) -> Result<IncidentFeed> {
        (**self).watch(collection).await
    }
}

/// Identity bootstrap. Yields an opaque principal before store access.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in_with_token(&self, token: &str) -> Result<PrincipalId>;

    async fn sign_in_anonymously(&self) -> Result<PrincipalId>;
}

#[async_trait]
impl<T: IdentityProvider + ?Sized> IdentityProvider for Arc<T> {
    async fn sign_in_with_token(&self, token: &str) -> Result<PrincipalId> {
        (**self).sign_in_with_token(token).await
    }

    async fn sign_in_anonymously(&self) -> Result<PrincipalId> {
        (**self).sign_in_anonymously().await
    }
}
