//! An in-process document store with the same versioning and transaction
//! semantics as the PostgreSQL one. Nothing is persisted.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use err_derive::Error;
use log::*;
use r2d2::ManageConnection;
use serde_json::Value;

use crate::documents::Version;
use crate::persistence::{ConcurrencyError, Storage};

#[derive(Debug, Error)]
#[error(display = "memory store unavailable")]
pub struct MemoryError;

#[derive(Debug, Clone, Default)]
struct Table {
    rows: BTreeMap<String, Row>,
    next_version: u64,
}

#[derive(Debug, Clone)]
struct Row {
    kind: String,
    body: Value,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    table: Arc<Mutex<Table>>,
}

/// A pooled handle onto a shared `MemoryStore`.
#[derive(Debug)]
pub struct MemoryDocuments {
    store: MemoryStore,
}

struct Staged {
    table: RefCell<Table>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryConnectionManager {
    store: MemoryStore,
}

impl Table {
    fn load(&self, id: &str) -> Option<Value> {
        self.rows.get(id).map(|row| row.body.clone())
    }

    fn load_kind(&self, kind: &str) -> Vec<Value> {
        self.rows
            .values()
            .filter(|row| row.kind == kind)
            .map(|row| row.body.clone())
            .collect()
    }

    fn current_version(&self, id: &str) -> Option<&str> {
        self.rows
            .get(id)
            .and_then(|row| row.body.get("_version"))
            .and_then(Value::as_str)
    }

    fn save(&mut self, id: &str, kind: &str, expected: &Version, mut body: Value) -> Result<Version> {
        let matches = match self.current_version(id) {
            None => expected.is_new(),
            Some(current) => !expected.is_new() && current == expected.as_str(),
        };
        if !matches {
            warn!("Save of {} expected version {:?}", id, expected);
            return Err(ConcurrencyError.into());
        }

        self.next_version += 1;
        let version = Version::new(format!("{:x}", self.next_version));
        match body.as_object_mut() {
            Some(obj) => {
                obj.insert("_version".to_string(), Value::from(version.as_str()));
            }
            None => bail!("document {} is not a JSON object", id),
        }
        self.rows.insert(
            id.to_string(),
            Row {
                kind: kind.to_string(),
                body,
            },
        );
        Ok(version)
    }

    fn delete(&mut self, id: &str, expected: &Version) -> Result<()> {
        if self.current_version(id) != Some(expected.as_str()) {
            warn!("Delete of {} expected version {:?}", id, expected);
            return Err(ConcurrencyError.into());
        }
        self.rows.remove(id);
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<Table>> {
        self.table
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl MemoryConnectionManager {
    pub fn new(store: MemoryStore) -> Self {
        MemoryConnectionManager { store }
    }
}

impl ManageConnection for MemoryConnectionManager {
    type Connection = MemoryDocuments;
    type Error = MemoryError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let store = self.store.clone();
        Ok(MemoryDocuments { store })
    }

    fn is_valid(&self, _conn: &mut Self::Connection) -> Result<(), Self::Error> {
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

impl Storage for MemoryDocuments {
    fn setup(&self) -> Result<()> {
        Ok(())
    }

    fn load_document(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.store.lock()?.load(id))
    }

    fn load_kind(&self, kind: &str) -> Result<Vec<Value>> {
        Ok(self.store.lock()?.load_kind(kind))
    }

    fn save_document(
        &self,
        id: &str,
        kind: &str,
        expected: &Version,
        body: Value,
    ) -> Result<Version> {
        self.store.lock()?.save(id, kind, expected, body)
    }

    fn delete_document(&self, id: &str, expected: &Version) -> Result<()> {
        self.store.lock()?.delete(id, expected)
    }

    fn transaction(&self, body: &mut dyn FnMut(&dyn Storage) -> Result<()>) -> Result<()> {
        // The lock is held for the whole body, so transactions are serialised.
        let mut guard = self.store.lock()?;
        let staged = Staged {
            table: RefCell::new(guard.clone()),
        };
        body(&staged)?;
        *guard = staged.table.into_inner();
        Ok(())
    }
}

impl Storage for Staged {
    fn setup(&self) -> Result<()> {
        Ok(())
    }

    fn load_document(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.table.borrow().load(id))
    }

    fn load_kind(&self, kind: &str) -> Result<Vec<Value>> {
        Ok(self.table.borrow().load_kind(kind))
    }

    fn save_document(
        &self,
        id: &str,
        kind: &str,
        expected: &Version,
        body: Value,
    ) -> Result<Version> {
        self.table.borrow_mut().save(id, kind, expected, body)
    }

    fn delete_document(&self, id: &str, expected: &Version) -> Result<()> {
        self.table.borrow_mut().delete(id, expected)
    }

    fn transaction(&self, body: &mut dyn FnMut(&dyn Storage) -> Result<()>) -> Result<()> {
        let nested = Staged {
            table: RefCell::new(self.table.borrow().clone()),
        };
        body(&nested)?;
        *self.table.borrow_mut() = nested.table.into_inner();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::documents::{DocMeta, HasMeta};
    use crate::ids::{Entity, IdGen};
    use crate::persistence::StorageExt;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
    struct Jar {
        #[serde(flatten)]
        meta: DocMeta<Jar>,
        grams: f64,
    }
    impl Entity for Jar {
        const PREFIX: &'static str = "jar";
    }
    impl HasMeta for Jar {
        fn meta(&self) -> &DocMeta<Self> {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut DocMeta<Self> {
            &mut self.meta
        }
    }

    #[derive(Clone, Debug, Deserialize, Serialize)]
    struct Lid {
        #[serde(flatten)]
        meta: DocMeta<Lid>,
    }
    impl Entity for Lid {
        const PREFIX: &'static str = "lid";
    }
    impl HasMeta for Lid {
        fn meta(&self) -> &DocMeta<Self> {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut DocMeta<Self> {
            &mut self.meta
        }
    }

    fn jar(idgen: &IdGen, grams: f64) -> Jar {
        Jar {
            meta: DocMeta::new_with_id(idgen.generate()),
            grams,
        }
    }

    fn docs() -> MemoryDocuments {
        MemoryConnectionManager::default()
            .connect()
            .expect("connect")
    }

    #[test]
    fn save_then_load() {
        let docs = docs();
        let mut doc = jar(&IdGen::new(), 250.0);

        docs.save(&mut doc).expect("save");
        assert!(!doc.meta.version.is_new());

        assert_eq!(docs.load(&doc.meta.id).expect("load"), Some(doc));
    }

    #[test]
    fn connections_share_one_store() {
        let manager = MemoryConnectionManager::default();
        let first = manager.connect().expect("connect");
        let second = manager.connect().expect("connect");
        let mut doc = jar(&IdGen::new(), 1.0);

        first.save(&mut doc).expect("save");

        assert_eq!(second.load(&doc.meta.id).expect("load"), Some(doc));
    }

    #[test]
    fn stale_save_is_rejected() {
        let docs = docs();
        let mut doc = jar(&IdGen::new(), 250.0);
        docs.save(&mut doc).expect("save");
        let mut stale = doc.clone();

        doc.grams = 100.0;
        docs.save(&mut doc).expect("save update");

        stale.grams = 50.0;
        let err = docs.save(&mut stale).expect_err("stale save");
        assert_eq!(err.downcast_ref::<ConcurrencyError>(), Some(&ConcurrencyError));
    }

    #[test]
    fn creating_an_existing_document_is_rejected() {
        let docs = docs();
        let mut doc = jar(&IdGen::new(), 250.0);
        docs.save(&mut doc).expect("save");

        let mut again = Jar {
            meta: DocMeta::new_with_id(doc.meta.id),
            grams: 1.0,
        };
        let err = docs.save(&mut again).expect_err("duplicate create");
        assert!(err.downcast_ref::<ConcurrencyError>().is_some());
    }

    #[test]
    fn load_all_filters_by_kind_in_creation_order() {
        let docs = docs();
        let idgen = IdGen::new();
        let mut a = jar(&idgen, 1.0);
        let mut b = jar(&idgen, 2.0);
        let mut lid = Lid {
            meta: DocMeta::new_with_id(idgen.generate()),
        };
        docs.save(&mut b).expect("save");
        docs.save(&mut lid).expect("save");
        docs.save(&mut a).expect("save");

        let jars = docs.load_all::<Jar>().expect("load_all");
        let mut expected = vec![a, b];
        expected.sort_by_key(|j| j.meta.id);
        assert_eq!(jars, expected);
    }

    #[test]
    fn failed_transaction_discards_every_write() {
        let docs = docs();
        let idgen = IdGen::new();
        let mut kept = jar(&idgen, 10.0);
        docs.save(&mut kept).expect("save");

        let res: Result<()> = docs.atomically(|tx| {
            let mut j = kept.clone();
            j.grams = 0.0;
            tx.save(&mut j)?;
            tx.save(&mut jar(&idgen, 5.0))?;
            bail!("kitchen on fire")
        });

        assert!(res.is_err());
        assert_eq!(docs.load_all::<Jar>().expect("load_all"), vec![kept]);
    }

    #[test]
    fn successful_transaction_publishes_writes() {
        let docs = docs();
        let idgen = IdGen::new();
        let mut a = jar(&idgen, 1.0);

        let id = docs
            .atomically(|tx| {
                tx.save(&mut a)?;
                Ok(a.meta.id)
            })
            .expect("atomically");

        assert!(docs.load::<Jar>(&id).expect("load").is_some());
    }

    #[test]
    fn delete_checks_version() {
        let docs = docs();
        let mut doc = jar(&IdGen::new(), 1.0);
        docs.save(&mut doc).expect("save");
        let stale = doc.clone();
        docs.save(&mut doc).expect("resave");

        assert!(docs.delete(&stale).is_err());
        docs.delete(&doc).expect("delete");
        assert_eq!(docs.load(&doc.meta.id).expect("load"), None::<Jar>);
    }
}
