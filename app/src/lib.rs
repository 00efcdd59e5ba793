//! Inventory ledger for a kindergarten kitchen: ingredients on hand, the
//! recipes that consume them, the servings that debit them, and the alerts
//! and monthly reports that keep an eye on it all.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use log::*;
use r2d2::Pool;

use infra::ids::IdGen;
use infra::persistence::Storage;

pub mod access;
pub mod alerts;
pub mod clock;
pub mod config;
pub mod error;
pub mod notify;
pub mod recipes;
pub mod reports;
pub mod seed;
pub mod services;
pub mod serving;
pub mod stock;
pub mod users;

#[cfg(test)]
mod test;

use crate::clock::{Clock, SystemClock};
use crate::notify::{Notifier, Subscription};

/// Everything an operation needs besides storage.
#[derive(Debug, Clone)]
pub struct Context {
    pub idgen: IdGen,
    pub clock: Arc<dyn Clock>,
    pub notifier: Notifier,
    pub settings: config::Settings,
}

#[derive(Debug)]
pub struct Kitchen<M: r2d2::ManageConnection> {
    db: Pool<M>,
    ctx: Context,
}

impl Context {
    pub fn new(settings: config::Settings, clock: Arc<dyn Clock>) -> Self {
        let notifier = Notifier::new(settings.notification_capacity);
        Context {
            idgen: IdGen::new(),
            clock,
            notifier,
            settings,
        }
    }

    pub fn with_system_clock(settings: config::Settings) -> Self {
        Self::new(settings, Arc::new(SystemClock))
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static> Kitchen<M> {
    pub fn new(db: Pool<M>, ctx: Context) -> Result<Self> {
        debug!("Init schema");
        db.get()?.setup().context("Setup persistence")?;
        info!("Kitchen ready");
        Ok(Kitchen { db, ctx })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn pool(&self) -> &Pool<M> {
        &self.db
    }

    pub fn stock(&self) -> stock::Stock<M> {
        stock::Stock::new(self.db.clone(), self.ctx.clone())
    }

    pub fn recipes(&self) -> recipes::Recipes<M> {
        recipes::Recipes::new(self.db.clone(), self.ctx.clone())
    }

    pub fn serving(&self) -> serving::Serving<M> {
        serving::Serving::new(self.db.clone(), self.ctx.clone())
    }

    pub fn alerts(&self) -> alerts::Alerts<M> {
        alerts::Alerts::new(self.db.clone(), self.ctx.clone())
    }

    pub fn reports(&self) -> reports::Reports<M> {
        reports::Reports::new(self.db.clone(), self.ctx.clone())
    }

    pub fn users(&self) -> users::Users<M> {
        users::Users::new(self.db.clone(), self.ctx.clone())
    }

    pub fn subscribe(&self) -> Subscription {
        self.ctx.notifier.subscribe()
    }
}
