//! Persistent ACME state
//!
//! Each record class is an in-memory map behind its own reader-writer lock,
//! written through to `acme/<collection>/<id>.json`. Writers of one class
//! are serialized by a separate mutex, so transitions of one record are
//! linearizable while readers only ever wait for the map swap, never for
//! the disk. Maps are reloaded from disk at startup.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::types::{Account, Authorization, Challenge, Order};
use crate::error::{Error, Result};
use crate::storage::{AcmeCollection, SafeName, Storage, MODE_PRIVATE};

pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync {
    const KIND: &'static str;

    fn id(&self) -> &str;
}

impl Record for Account {
    const KIND: &'static str = "account";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Order {
    const KIND: &'static str = "order";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Authorization {
    const KIND: &'static str = "authorization";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Challenge {
    const KIND: &'static str = "challenge";

    fn id(&self) -> &str {
        &self.id
    }
}

pub struct Collection<T> {
    kind: AcmeCollection,
    items: RwLock<HashMap<String, T>>,
    writer: Mutex<()>,
}

impl<T: Record> Collection<T> {
    fn load(storage: &Storage, kind: AcmeCollection) -> Result<Self> {
        let dir = storage.paths().acme_collection(kind);
        let mut items = HashMap::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    kind,
                    items: RwLock::new(items),
                    writer: Mutex::new(()),
                })
            }
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            match serde_json::from_slice::<T>(&bytes) {
                Ok(record) => {
                    items.insert(record.id().to_string(), record);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable ACME record"),
            }
        }
        debug!(kind = T::KIND, count = items.len(), "loaded ACME records");
        Ok(Self {
            kind,
            items: RwLock::new(items),
            writer: Mutex::new(()),
        })
    }

    fn write(&self, storage: &Storage, record: &T) -> Result<()> {
        let id = SafeName::parse(record.id())?;
        let bytes = serde_json::to_vec_pretty(record)?;
        storage.write_file(&storage.paths().acme_record(self.kind, &id), &bytes, MODE_PRIVATE)
    }

    fn erase(&self, storage: &Storage, id: &str) -> Result<()> {
        let id = SafeName::parse(id)?;
        storage.remove_file(&storage.paths().acme_record(self.kind, &id))
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.items.read().get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<T> {
        self.get(id)
            .ok_or_else(|| Error::NotFound(format!("{} {id}", T::KIND)))
    }

    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        self.items.read().values().find(|r| predicate(r)).cloned()
    }

    pub fn filter(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.items
            .read()
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, storage: &Storage, record: T) -> Result<()> {
        let _writer = self.writer.lock();
        self.write(storage, &record)?;
        self.items.write().insert(record.id().to_string(), record);
        Ok(())
    }

    /// Apply `change` to a copy, persist it, then publish it
    ///
    /// Nothing is written when `change` fails. The map lock is not held
    /// while `change` runs or the file is written.
    fn update<R>(
        &self,
        storage: &Storage,
        id: &str,
        change: impl FnOnce(&mut T) -> Result<R>,
    ) -> Result<(T, R)> {
        let _writer = self.writer.lock();
        let mut record = self.require(id)?;
        let out = change(&mut record)?;
        self.write(storage, &record)?;
        self.items.write().insert(id.to_string(), record.clone());
        Ok((record, out))
    }

    fn remove_where(&self, storage: &Storage, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        let _writer = self.writer.lock();
        let doomed: Vec<String> = self
            .items
            .read()
            .iter()
            .filter(|(_, r)| predicate(r))
            .map(|(id, _)| id.clone())
            .collect();
        let mut erased = Vec::with_capacity(doomed.len());
        for id in doomed {
            match self.erase(storage, &id) {
                Ok(()) => erased.push(id),
                Err(e) => warn!(kind = T::KIND, id = %id, error = %e, "failed to delete ACME record"),
            }
        }
        let mut items = self.items.write();
        erased.iter().filter_map(|id| items.remove(id)).collect()
    }
}

/// Counts removed by [`AcmeStore::delete_expired`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredSweep {
    pub orders: usize,
    pub authorizations: usize,
    pub challenges: usize,
}

pub struct AcmeStore {
    storage: Arc<Storage>,
    pub accounts: Collection<Account>,
    pub orders: Collection<Order>,
    pub authorizations: Collection<Authorization>,
    pub challenges: Collection<Challenge>,
}

impl AcmeStore {
    /// Load every record collection from disk
    pub fn open(storage: Arc<Storage>) -> Result<Self> {
        let store = Self {
            accounts: Collection::load(&storage, AcmeCollection::Accounts)?,
            orders: Collection::load(&storage, AcmeCollection::Orders)?,
            authorizations: Collection::load(&storage, AcmeCollection::Authorizations)?,
            challenges: Collection::load(&storage, AcmeCollection::Challenges)?,
            storage,
        };
        info!(
            accounts = store.accounts.len(),
            orders = store.orders.len(),
            "ACME state loaded"
        );
        Ok(store)
    }

    pub fn account_by_key_hash(&self, key_hash: &str) -> Option<Account> {
        self.accounts.find(|a| a.key_hash == key_hash)
    }

    pub fn insert_account(&self, account: Account) -> Result<()> {
        self.accounts.insert(&self.storage, account)
    }

    pub fn update_account<R>(&self, id: &str, change: impl FnOnce(&mut Account) -> Result<R>) -> Result<(Account, R)> {
        self.accounts.update(&self.storage, id, change)
    }

    pub fn insert_order(&self, order: Order) -> Result<()> {
        self.orders.insert(&self.storage, order)
    }

    pub fn update_order<R>(&self, id: &str, change: impl FnOnce(&mut Order) -> Result<R>) -> Result<(Order, R)> {
        self.orders.update(&self.storage, id, change)
    }

    pub fn insert_authorization(&self, authz: Authorization) -> Result<()> {
        self.authorizations.insert(&self.storage, authz)
    }

    pub fn update_authorization<R>(
        &self,
        id: &str,
        change: impl FnOnce(&mut Authorization) -> Result<R>,
    ) -> Result<(Authorization, R)> {
        self.authorizations.update(&self.storage, id, change)
    }

    pub fn insert_challenge(&self, challenge: Challenge) -> Result<()> {
        self.challenges.insert(&self.storage, challenge)
    }

    pub fn update_challenge<R>(
        &self,
        id: &str,
        change: impl FnOnce(&mut Challenge) -> Result<R>,
    ) -> Result<(Challenge, R)> {
        self.challenges.update(&self.storage, id, change)
    }

    /// Challenges of one authorization, in the authorization's order
    pub fn challenges_of(&self, authz: &Authorization) -> Vec<Challenge> {
        authz
            .challenges
            .iter()
            .filter_map(|id| self.challenges.get(id))
            .collect()
    }

    /// Remove orders and authorizations past their expiry, and the
    /// challenges of removed authorizations
    pub fn delete_expired(&self, now: DateTime<Utc>) -> ExpiredSweep {
        let orders = self.orders.remove_where(&self.storage, |o| o.expires < now);
        let authzs = self
            .authorizations
            .remove_where(&self.storage, |a| a.expires < now);
        let challenge_ids: Vec<&String> = authzs.iter().flat_map(|a| a.challenges.iter()).collect();
        let challenges = self
            .challenges
            .remove_where(&self.storage, |c| challenge_ids.contains(&&c.id));
        ExpiredSweep {
            orders: orders.len(),
            authorizations: authzs.len(),
            challenges: challenges.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::types::{AuthorizationStatus, Identifier, OrderStatus};
    use crate::audit::AuditLog;
    use chrono::Duration;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> Arc<Storage> {
        Arc::new(Storage::files_only(dir.path(), Arc::new(AuditLog::tracing_only())).unwrap())
    }

    fn order(id: &str, expires: DateTime<Utc>) -> Order {
        Order {
            id: id.into(),
            account_id: "acct".into(),
            status: OrderStatus::Pending,
            expires,
            identifiers: vec![Identifier::dns("svc.local")],
            authorizations: vec![format!("{id}-authz")],
            finalize_url: format!("http://ca/acme/finalize/{id}"),
            certificate_url: None,
            not_before: None,
            not_after: None,
            csr: None,
            certificate_name: None,
            certificate_serial: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    fn authz(id: &str, expires: DateTime<Utc>) -> Authorization {
        Authorization {
            id: id.into(),
            order_id: "o".into(),
            account_id: "acct".into(),
            identifier: Identifier::dns("svc.local"),
            status: AuthorizationStatus::Pending,
            expires,
            challenges: vec![],
            wildcard: false,
        }
    }

    #[test]
    fn test_records_survive_reload() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let store = AcmeStore::open(storage.clone()).unwrap();
        store.insert_order(order("o1", Utc::now() + Duration::hours(1))).unwrap();
        store
            .update_order("o1", |o| o.transition(OrderStatus::Ready))
            .unwrap();

        let reloaded = AcmeStore::open(storage).unwrap();
        assert_eq!(reloaded.orders.require("o1").unwrap().status, OrderStatus::Ready);
        assert!(dir.path().join("acme/orders/o1.json").exists());

        reloaded
            .insert_authorization(authz("a1", Utc::now() + Duration::hours(1)))
            .unwrap();
        assert!(dir.path().join("acme/authz/a1.json").exists());
    }

    #[test]
    fn test_failed_update_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = AcmeStore::open(storage(&dir)).unwrap();
        store.insert_order(order("o1", Utc::now() + Duration::hours(1))).unwrap();
        let err = store
            .update_order("o1", |o| o.transition(OrderStatus::Valid))
            .unwrap_err();
        assert!(matches!(err, Error::ConflictingState(_)));
        assert_eq!(store.orders.require("o1").unwrap().status, OrderStatus::Pending);
        assert!(matches!(
            store.update_order("missing", |_| Ok(())),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_expired() {
        let dir = TempDir::new().unwrap();
        let store = AcmeStore::open(storage(&dir)).unwrap();
        let now = Utc::now();
        store.insert_order(order("old", now - Duration::minutes(1))).unwrap();
        store.insert_order(order("new", now + Duration::hours(1))).unwrap();
        store.insert_authorization(authz("old-a", now - Duration::minutes(1))).unwrap();

        let swept = store.delete_expired(now);
        assert_eq!(swept.orders, 1);
        assert_eq!(swept.authorizations, 1);
        assert!(store.orders.get("old").is_none());
        assert!(store.orders.get("new").is_some());
        assert!(!dir.path().join("acme/orders/old.json").exists());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let store = AcmeStore::open(storage(&dir)).unwrap();
        store.insert_order(order("o1", Utc::now() + Duration::hours(1))).unwrap();

        std::thread::scope(|scope| {
            for t in 0..8 {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..5 {
                        store
                            .update_order("o1", |o| {
                                o.identifiers.push(Identifier::dns(format!("h{t}-{i}.local")));
                                Ok(())
                            })
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(store.orders.require("o1").unwrap().identifiers.len(), 41);
        let reloaded = AcmeStore::open(storage(&dir)).unwrap();
        assert_eq!(reloaded.orders.require("o1").unwrap().identifiers.len(), 41);
    }

    #[test]
    fn test_readers_are_not_blocked_by_an_update() {
        let dir = TempDir::new().unwrap();
        let store = AcmeStore::open(storage(&dir)).unwrap();
        store.insert_order(order("o1", Utc::now() + Duration::hours(1))).unwrap();

        let (_, seen) = store
            .update_order("o1", |o| {
                o.transition(OrderStatus::Ready)?;
                // readers still see the published record while the update is in flight
                Ok(store.orders.get("o1").map(|current| current.status))
            })
            .unwrap();
        assert_eq!(seen, Some(OrderStatus::Pending));
        assert_eq!(store.orders.require("o1").unwrap().status, OrderStatus::Ready);
    }
}
