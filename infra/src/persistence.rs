use anyhow::{anyhow, Context, Result};
use err_derive::Error;
use log::*;
use postgres::GenericConnection;
use r2d2::ManageConnection;
use r2d2_postgres::PostgresConnectionManager;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::documents::{HasMeta, Version};
use crate::ids::{Entity, Id};

#[derive(Debug, Error, PartialEq, Eq)]
#[error(display = "stale version")]
pub struct ConcurrencyError;

/// Raw document operations. Implementations must be usable as trait objects,
/// so typed access lives in `StorageExt`.
pub trait Storage {
    fn setup(&self) -> Result<()>;
    fn load_document(&self, id: &str) -> Result<Option<Value>>;
    /// All documents of one kind, in id order.
    fn load_kind(&self, kind: &str) -> Result<Vec<Value>>;
    /// Writes `body` if the stored version still matches `expected`; a new
    /// document is expected to carry the empty version.
    fn save_document(&self, id: &str, kind: &str, expected: &Version, body: Value)
        -> Result<Version>;
    fn delete_document(&self, id: &str, expected: &Version) -> Result<()>;
    /// Runs `body` against a view of the store whose writes become visible
    /// only if `body` succeeds.
    fn transaction(&self, body: &mut dyn FnMut(&dyn Storage) -> Result<()>) -> Result<()>;
}

pub trait StorageExt: Storage {
    fn load<D: DeserializeOwned + Entity>(&self, id: &Id<D>) -> Result<Option<D>> {
        match self.load_document(&id.to_string())? {
            Some(body) => {
                let doc = serde_json::from_value(body).with_context(|| format!("decode {}", id))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    fn load_all<D: DeserializeOwned + Entity>(&self) -> Result<Vec<D>> {
        self.load_kind(D::PREFIX)?
            .into_iter()
            .map(|body| {
                serde_json::from_value(body).with_context(|| format!("decode {}", D::PREFIX))
            })
            .collect()
    }

    fn save<D: Serialize + Entity + HasMeta>(&self, doc: &mut D) -> Result<()> {
        let body = serde_json::to_value(&*doc)?;
        let id = doc.meta().id.to_string();
        let version = self.save_document(&id, D::PREFIX, &doc.meta().version, body)?;
        debug!("Saved {} at version {:?}", id, version);
        doc.meta_mut().version = version;
        Ok(())
    }

    fn delete<D: Entity + HasMeta>(&self, doc: &D) -> Result<()> {
        let meta = doc.meta();
        self.delete_document(&meta.id.to_string(), &meta.version)
    }

    fn atomically<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&dyn Storage) -> Result<R>,
    {
        let mut f = Some(f);
        let mut result = None;
        self.transaction(&mut |docs: &dyn Storage| {
            let f = f
                .take()
                .ok_or_else(|| anyhow!("transaction body invoked twice"))?;
            result = Some(f(docs)?);
            Ok(())
        })?;
        result.ok_or_else(|| anyhow!("transaction finished without a result"))
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

const SETUP_SQL: &str = include_str!("persistence.sql");
const LOAD_SQL: &str = "SELECT body FROM documents WHERE id = $1";
const LOAD_KIND_SQL: &str = "SELECT body FROM documents WHERE kind = $1 ORDER BY id COLLATE \"C\"";
const INSERT_SQL: &str = "WITH a AS (SELECT $1::jsonb AS body) \
                          INSERT INTO documents (id, kind, body) \
                          SELECT $2, $3, jsonb_set(a.body, '{_version}', to_jsonb(to_hex(txid_current()))) \
                          FROM a \
                          WHERE NOT EXISTS (SELECT 1 FROM documents d WHERE d.id = $2)";
const UPDATE_SQL: &str = "UPDATE documents \
                          SET body = jsonb_set($1::jsonb, '{_version}', to_jsonb(to_hex(txid_current()))) \
                          WHERE id = $2 AND body -> '_version' = to_jsonb($3::text)";
const DELETE_SQL: &str = "DELETE FROM documents WHERE id = $1 AND body -> '_version' = to_jsonb($2::text)";
const VERSION_SQL: &str = "SELECT to_hex(txid_current())";

/// Document storage over anything that speaks to PostgreSQL; either a plain
/// connection or an open transaction.
#[derive(Debug)]
pub struct Documents<C> {
    connection: C,
}

impl<C: GenericConnection> Documents<C> {
    pub fn wrap(connection: C) -> Self {
        Documents { connection }
    }

    pub fn get_ref(&self) -> &C {
        &self.connection
    }

    fn current_version(&self) -> Result<Version> {
        let rows = self.connection.query(VERSION_SQL, &[])?;
        let version: String = rows
            .iter()
            .next()
            .ok_or_else(|| anyhow!("Missing version row?"))?
            .get_opt(0)
            .ok_or_else(|| anyhow!("Missing version column?"))??;
        Ok(Version::new(version))
    }
}

impl<C: GenericConnection> Storage for Documents<C> {
    fn setup(&self) -> Result<()> {
        self.connection
            .batch_execute(SETUP_SQL)
            .context("create documents table")?;
        Ok(())
    }

    fn load_document(&self, id: &str) -> Result<Option<Value>> {
        let rows = self.connection.query(LOAD_SQL, &[&id])?;
        match rows.iter().next() {
            Some(row) => {
                let body: Value = row
                    .get_opt(0)
                    .ok_or_else(|| anyhow!("Missing column in row?"))??;
                Ok(Some(body))
            }
            None => Ok(None),
        }
    }

    fn load_kind(&self, kind: &str) -> Result<Vec<Value>> {
        let rows = self.connection.query(LOAD_KIND_SQL, &[&kind])?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let body: Value = row
                .get_opt(0)
                .ok_or_else(|| anyhow!("Missing column in row?"))??;
            out.push(body);
        }
        debug!("Loaded {} {} documents", out.len(), kind);
        Ok(out)
    }

    fn save_document(
        &self,
        id: &str,
        kind: &str,
        expected: &Version,
        body: Value,
    ) -> Result<Version> {
        let nrows = if expected.is_new() {
            self.connection
                .execute(INSERT_SQL, &[&body, &id, &kind])?
        } else {
            self.connection
                .execute(UPDATE_SQL, &[&body, &id, &expected.as_str()])?
        };
        debug!("Save of {} modified {} rows", id, nrows);
        if nrows != 1 {
            warn!("Update of {} impacted {} rows not 1", id, nrows);
            return Err(ConcurrencyError.into());
        }
        self.current_version()
    }

    fn delete_document(&self, id: &str, expected: &Version) -> Result<()> {
        let nrows = self
            .connection
            .execute(DELETE_SQL, &[&id, &expected.as_str()])?;
        if nrows != 1 {
            warn!("Delete of {} impacted {} rows not 1", id, nrows);
            return Err(ConcurrencyError.into());
        }
        Ok(())
    }

    fn transaction(&self, body: &mut dyn FnMut(&dyn Storage) -> Result<()>) -> Result<()> {
        let t = self.connection.transaction().context("begin")?;
        let docs = Documents::wrap(t);
        // Dropping an uncommitted transaction rolls it back.
        body(&docs)?;
        docs.connection.commit().context("commit")?;
        Ok(())
    }
}

pub struct DocumentConnectionManager(PostgresConnectionManager);

impl DocumentConnectionManager {
    pub fn new(inner: PostgresConnectionManager) -> Self {
        DocumentConnectionManager(inner)
    }
}

impl std::fmt::Debug for DocumentConnectionManager {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("DocumentConnectionManager").finish()
    }
}

impl ManageConnection for DocumentConnectionManager {
    type Connection = Documents<postgres::Connection>;
    type Error = postgres::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.0.connect().map(Documents::wrap)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        self.0.is_valid(&mut conn.connection)
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        self.0.has_broken(&mut conn.connection)
    }
}
