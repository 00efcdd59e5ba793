use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use chrono::{TimeZone, Utc};
use log::*;
use r2d2::{ManageConnection, Pool};
use r2d2_postgres::{PostgresConnectionManager, TlsMode};
use serde_json::Value;

use infra::documents::Version;
use infra::ids::{Entity, Id};
use infra::memory::{MemoryConnectionManager, MemoryDocuments, MemoryError, MemoryStore};
use infra::persistence::{ConcurrencyError, DocumentConnectionManager, Documents, Storage};

use crate::access::{Actor, Role};
use crate::clock::ManualClock;
use crate::config::Settings;
use crate::recipes::{AddMeal, Meal, MealIngredient};
use crate::services::Commandable;
use crate::stock::{AddIngredient, Ingredient};
use crate::users::{AddUser, User};
use crate::{Context, Kitchen};

pub(crate) fn kitchen() -> Kitchen<MemoryConnectionManager> {
    kitchen_with(Settings::default()).0
}

/// A memory-backed kitchen on a clock that stands still at 09:00 UTC on
/// 2025-05-20, reporting in UTC unless told otherwise.
pub(crate) fn kitchen_with(mut settings: Settings) -> (Kitchen<MemoryConnectionManager>, ManualClock) {
    settings.utc_offset_seconds = settings.utc_offset_seconds.or(Some(0));
    let clock = ManualClock::starting_at(Utc.with_ymd_and_hms(2025, 5, 20, 9, 0, 0).unwrap());
    let ctx = Context::new(settings, Arc::new(clock.clone()));
    let pool = r2d2::Pool::builder()
        .max_size(2)
        .build(MemoryConnectionManager::new(MemoryStore::new()))
        .expect("memory pool");
    (Kitchen::new(pool, ctx).expect("kitchen"), clock)
}

pub(crate) fn user<M, D>(kitchen: &Kitchen<M>, name: &str, role: Role) -> Actor
where
    M: r2d2::ManageConnection<Connection = D>,
    D: Storage + Send + 'static,
{
    let email = format!("{}@kitchen.test", name.to_lowercase().replace(' ', "."));
    let id: Id<User> = kitchen
        .users()
        .execute(AddUser {
            full_name: name.into(),
            email,
            role,
        })
        .expect("add user");
    Actor { user: id, role }
}

pub(crate) fn admin<M, D>(kitchen: &Kitchen<M>) -> Actor
where
    M: r2d2::ManageConnection<Connection = D>,
    D: Storage + Send + 'static,
{
    let role = Role::Admin;
    let name = format!("Admin {}", kitchen.context().idgen.generate::<User>());
    user(kitchen, &name, role)
}

pub(crate) fn ingredient<M, D>(
    kitchen: &Kitchen<M>,
    name: &str,
    quantity: f64,
    minimum: f64,
) -> Id<Ingredient>
where
    M: r2d2::ManageConnection<Connection = D>,
    D: Storage + Send + 'static,
{
    let actor = admin(kitchen);
    kitchen
        .stock()
        .execute(AddIngredient {
            name: name.into(),
            quantity,
            minimum: Some(minimum),
            delivered_at: None,
            actor,
        })
        .expect("add ingredient")
}

pub(crate) fn meal<M, D>(kitchen: &Kitchen<M>, name: &str, lines: &[(Id<Ingredient>, f64)]) -> Id<Meal>
where
    M: r2d2::ManageConnection<Connection = D>,
    D: Storage + Send + 'static,
{
    kitchen
        .recipes()
        .execute(AddMeal {
            name: name.into(),
            ingredients: lines
                .iter()
                .map(|&(ingredient, grams)| MealIngredient { ingredient, grams })
                .collect(),
        })
        .expect("add meal")
}

/// Fails the next N updates to existing ingredients as though another
/// writer got there first.
#[derive(Debug, Clone)]
pub(crate) struct FlakyManager {
    inner: MemoryConnectionManager,
    failures: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub(crate) struct Flaky {
    inner: MemoryDocuments,
    failures: Arc<AtomicUsize>,
}

struct FlakyTx<'a> {
    inner: &'a dyn Storage,
    failures: &'a AtomicUsize,
}

pub(crate) fn flaky_kitchen() -> (Kitchen<FlakyManager>, Arc<AtomicUsize>) {
    let failures = Arc::new(AtomicUsize::new(0));
    let manager = FlakyManager {
        inner: MemoryConnectionManager::new(MemoryStore::new()),
        failures: failures.clone(),
    };
    let mut settings = Settings::default();
    settings.utc_offset_seconds = Some(0);
    let clock = ManualClock::starting_at(Utc.with_ymd_and_hms(2025, 5, 20, 9, 0, 0).unwrap());
    let ctx = Context::new(settings, Arc::new(clock));
    let pool = r2d2::Pool::builder()
        .max_size(2)
        .build(manager)
        .expect("flaky pool");
    (Kitchen::new(pool, ctx).expect("kitchen"), failures)
}

fn should_fail(failures: &AtomicUsize, kind: &str, expected: &Version) -> bool {
    if kind != Ingredient::PREFIX || expected.is_new() {
        return false;
    }
    failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl ManageConnection for FlakyManager {
    type Connection = Flaky;
    type Error = MemoryError;

    fn connect(&self) -> Result<Flaky, MemoryError> {
        Ok(Flaky {
            inner: self.inner.connect()?,
            failures: self.failures.clone(),
        })
    }

    fn is_valid(&self, _conn: &mut Flaky) -> Result<(), MemoryError> {
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Flaky) -> bool {
        false
    }
}

impl Storage for Flaky {
    fn setup(&self) -> Result<()> {
        self.inner.setup()
    }
    fn load_document(&self, id: &str) -> Result<Option<Value>> {
        self.inner.load_document(id)
    }
    fn load_kind(&self, kind: &str) -> Result<Vec<Value>> {
        self.inner.load_kind(kind)
    }
    fn save_document(&self, id: &str, kind: &str, expected: &Version, body: Value) -> Result<Version> {
        if should_fail(&self.failures, kind, expected) {
            warn!("Failing save of {} on purpose", id);
            return Err(ConcurrencyError.into());
        }
        self.inner.save_document(id, kind, expected, body)
    }
    fn delete_document(&self, id: &str, expected: &Version) -> Result<()> {
        self.inner.delete_document(id, expected)
    }
    fn transaction(&self, body: &mut dyn FnMut(&dyn Storage) -> Result<()>) -> Result<()> {
        let failures = &*self.failures;
        self.inner.transaction(&mut |tx: &dyn Storage| {
            body(&FlakyTx {
                inner: tx,
                failures,
            })
        })
    }
}

impl<'a> Storage for FlakyTx<'a> {
    fn setup(&self) -> Result<()> {
        self.inner.setup()
    }
    fn load_document(&self, id: &str) -> Result<Option<Value>> {
        self.inner.load_document(id)
    }
    fn load_kind(&self, kind: &str) -> Result<Vec<Value>> {
        self.inner.load_kind(kind)
    }
    fn save_document(&self, id: &str, kind: &str, expected: &Version, body: Value) -> Result<Version> {
        if should_fail(self.failures, kind, expected) {
            warn!("Failing save of {} on purpose", id);
            return Err(ConcurrencyError.into());
        }
        self.inner.save_document(id, kind, expected, body)
    }
    fn delete_document(&self, id: &str, expected: &Version) -> Result<()> {
        self.inner.delete_document(id, expected)
    }
    fn transaction(&self, body: &mut dyn FnMut(&dyn Storage) -> Result<()>) -> Result<()> {
        let failures = self.failures;
        self.inner.transaction(&mut |tx: &dyn Storage| {
            body(&FlakyTx {
                inner: tx,
                failures,
            })
        })
    }
}

#[derive(Debug)]
struct UseTempSchema(String);

impl r2d2::CustomizeConnection<Documents<postgres::Connection>, postgres::Error> for UseTempSchema {
    fn on_acquire(&self, conn: &mut Documents<postgres::Connection>) -> Result<(), postgres::Error> {
        conn.get_ref()
            .execute(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.0), &[])?;
        conn.get_ref()
            .execute(&format!("SET search_path TO \"{}\"", self.0), &[])?;
        Ok(())
    }
}

/// A PostgreSQL pool isolated in its own schema, for the ignored tests.
pub(crate) fn pg_pool(schema: &str) -> Result<Pool<DocumentConnectionManager>> {
    let url = env::var("POSTGRES_URL").context("$POSTGRES_URL")?;
    debug!("Build pool for {} in schema {}", url, schema);
    let manager = PostgresConnectionManager::new(&*url, TlsMode::None)
        .map_err(|e| anyhow!("postgres: {}", e))?;

    let pool = r2d2::Pool::builder()
        .max_size(2)
        .connection_customizer(Box::new(UseTempSchema(schema.to_string())))
        .build(DocumentConnectionManager::new(manager))?;

    let conn = pool.get()?;
    conn.get_ref()
        .execute("DROP TABLE IF EXISTS documents", &[])?;
    Ok(pool)
}
