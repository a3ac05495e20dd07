use std::sync::Arc;

use civicwatch_core::config::StoreConfig;
use civicwatch_core::{CollectionRef, PrincipalId};
use civicwatch_store::IncidentStore;

/// A store handle bound to one principal's incident collection.
///
/// Only obtainable with a [`PrincipalId`], so anything holding a binding runs
/// after identity bootstrap.
#[derive(Clone)]
pub struct StoreBinding {
    store: Arc<dyn IncidentStore>,
    collection: CollectionRef,
    principal: PrincipalId,
}

impl StoreBinding {
    pub fn new(store: Arc<dyn IncidentStore>, config: &StoreConfig, principal: &PrincipalId) -> Self {
        Self {
            store,
            collection: CollectionRef::for_principal(&config.app_id, principal, &config.collection),
            principal: principal.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn IncidentStore> {
        &self.store
    }

    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    pub fn principal(&self) -> &PrincipalId {
        &self.principal
    }
}

impl std::fmt::Debug for StoreBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBinding")
            .field("collection", &self.collection)
            .field("principal", &self.principal)
            .finish()
    }
}
