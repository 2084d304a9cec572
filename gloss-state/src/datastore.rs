use std::path::Path;

use chrono::{DateTime, Utc};

use crate::db::{self, DbHandle};
use crate::entitlements::{EntitlementPatch, EntitlementState, UserEntitlement};
use crate::errors::StateError;

/// Owns the in-memory entitlement state and writes every effective
/// mutation through to the embedded database. All access goes through
/// one `Arc<Mutex<DataStore>>`, so a read-modify-write performed inside
/// a single lock hold is atomic with respect to other requests.
pub struct DataStore {
    pub entitlement_state: EntitlementState,
    db: Option<DbHandle>,
}

impl DataStore {
    /// Open the store backed by the database at `path`, loading all
    /// persisted records into memory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let db = db::open_db(path)?;
        let mut entitlement_state = EntitlementState::new();
        for record in db::load_entitlements(&db)? {
            entitlement_state.insert(record);
        }
        log::info!(
            "datastore opened with {} entitlement record(s)",
            entitlement_state.len()
        );
        Ok(Self {
            entitlement_state,
            db: Some(db),
        })
    }

    /// An unpersisted store. Used by tests and ephemeral tooling.
    pub fn in_memory() -> Self {
        Self {
            entitlement_state: EntitlementState::new(),
            db: None,
        }
    }

    fn persist(&self, record: &UserEntitlement) -> Result<(), StateError> {
        if let Some(db) = &self.db {
            db::store_entitlement(db, record)?;
        }
        Ok(())
    }

    pub fn get(&self, user_id: &str) -> Option<&UserEntitlement> {
        self.entitlement_state.get(user_id)
    }

    pub fn find_by_customer(&self, customer_id: &str) -> Option<&UserEntitlement> {
        self.entitlement_state.find_by_customer(customer_id)
    }

    /// Lookups that find no record create, persist and return a default
    /// free record rather than erroring.
    pub fn get_or_create(
        &mut self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UserEntitlement, StateError> {
        match self.entitlement_state.get(user_id) {
            Some(record) => Ok(record.clone()),
            None => {
                let record = UserEntitlement::new(user_id.to_string(), now);
                self.persist(&record)?;
                self.entitlement_state.insert(record.clone());
                log::info!("created default free entitlement for user {}", user_id);
                Ok(record)
            }
        }
    }

    /// The record with the daily reset transition applied. Every read
    /// or metering path goes through here so the rollover happens
    /// before any quota comparison.
    pub fn current(
        &mut self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UserEntitlement, StateError> {
        let mut record = self.get_or_create(user_id, now)?;
        if record.roll_over(now.date_naive(), now) {
            log::info!("daily usage reset for user {}", user_id);
            self.persist(&record)?;
            self.entitlement_state.insert(record.clone());
        }
        Ok(record)
    }

    /// Mutate an existing record in place. The closure returns whether
    /// it changed anything; only effective changes are persisted.
    pub fn update<F>(&mut self, user_id: &str, mutate: F) -> Result<UserEntitlement, StateError>
    where
        F: FnOnce(&mut UserEntitlement) -> bool,
    {
        let record = self
            .entitlement_state
            .get_mut(user_id)
            .ok_or_else(|| StateError::NotFound(format!("entitlement for user {}", user_id)))?;
        let changed = mutate(record);
        let snapshot = record.clone();
        if changed {
            self.persist(&snapshot)?;
        }
        Ok(snapshot)
    }

    /// Upsert by user id: the record is created first if absent, so a
    /// checkout that lands before any query still reconciles.
    pub fn apply_patch_by_user(
        &mut self,
        user_id: &str,
        patch: &EntitlementPatch,
        now: DateTime<Utc>,
    ) -> Result<UserEntitlement, StateError> {
        self.get_or_create(user_id, now)?;
        self.update(user_id, |record| record.apply_patch(patch, now))
    }

    /// Upsert by provider customer id. Fails with `NotFound` when no
    /// local record references that customer.
    pub fn apply_patch_by_customer(
        &mut self,
        customer_id: &str,
        patch: &EntitlementPatch,
        now: DateTime<Utc>,
    ) -> Result<UserEntitlement, StateError> {
        let user_id = self
            .entitlement_state
            .find_by_customer(customer_id)
            .map(|record| record.user_id.clone())
            .ok_or_else(|| {
                StateError::NotFound(format!("entitlement referencing customer {}", customer_id))
            })?;
        self.update(&user_id, |record| record.apply_patch(patch, now))
    }

    /// Drop a customer reference the provider no longer recognizes
    /// (test/live mode switches leave these behind).
    pub fn clear_provider_customer(
        &mut self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UserEntitlement, StateError> {
        self.update(user_id, |record| {
            if record.provider_customer_id.is_some() {
                record.provider_customer_id = None;
                record.updated_at = now;
                true
            } else {
                false
            }
        })
    }

    /// Maintenance: zero every counter as of `now`. Returns how many
    /// records were touched.
    pub fn reset_all_usage(&mut self, now: DateTime<Utc>) -> Result<usize, StateError> {
        let today = now.date_naive();
        let mut count = 0;
        for user_id in self.entitlement_state.user_ids() {
            self.update(&user_id, |record| {
                record.usage_today = 0;
                record.last_reset_date = today;
                record.updated_at = now;
                true
            })?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{SubscriptionStatus, SubscriptionTier};

    #[test]
    fn get_or_create_persists_default_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.redb");
        let now = Utc::now();

        {
            let mut store = DataStore::open(&path).unwrap();
            let record = store.get_or_create("user-1", now).unwrap();
            assert_eq!(record.tier, SubscriptionTier::Free);
            assert_eq!(record.status, SubscriptionStatus::None);
            assert_eq!(record.usage_today, 0);
        }

        let store = DataStore::open(&path).unwrap();
        assert!(store.get("user-1").is_some());
    }

    #[test]
    fn patch_by_customer_requires_existing_reference() {
        let mut store = DataStore::in_memory();
        let now = Utc::now();

        let patch = EntitlementPatch {
            status: Some(SubscriptionStatus::Canceled),
            ..Default::default()
        };
        let err = store.apply_patch_by_customer("cus_404", &patch, now);
        assert!(matches!(err, Err(StateError::NotFound(_))));

        store.get_or_create("user-1", now).unwrap();
        store
            .apply_patch_by_user(
                "user-1",
                &EntitlementPatch {
                    provider_customer_id: Some("cus_404".to_string()),
                    ..Default::default()
                },
                now,
            )
            .unwrap();

        let updated = store.apply_patch_by_customer("cus_404", &patch, now).unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Canceled);
    }

    #[test]
    fn reset_all_usage_touches_every_record() {
        let mut store = DataStore::in_memory();
        let now = Utc::now();
        for user in ["a", "b", "c"] {
            store.get_or_create(user, now).unwrap();
            store
                .update(user, |record| {
                    record.usage_today = 5;
                    true
                })
                .unwrap();
        }

        assert_eq!(store.reset_all_usage(now).unwrap(), 3);
        for user in ["a", "b", "c"] {
            assert_eq!(store.get(user).unwrap().usage_today, 0);
        }
    }
}
