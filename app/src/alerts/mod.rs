use anyhow::Result;
use fallible_iterator::FallibleIterator;
use log::*;
use r2d2::{self, Pool};

use infra::documents::DocMeta;
use infra::ids::Id;
use infra::persistence::{Storage, StorageExt};

use crate::notify::Event;
use crate::services::{Commandable, Queryable, Request};
use crate::stock::Ingredient;
use crate::Context;

mod models;

pub use self::models::{Alert, AlertKind};

/// Raises alerts inside an open storage transaction. Publishing is left to
/// the caller, once the transaction has committed.
pub struct AlertManager<'a> {
    tx: &'a dyn Storage,
    ctx: &'a Context,
}

/// Lazily walks the ingredients, raising an alert for each one below its
/// minimum that does not already have an open alert.
pub struct LowStockScan<'a> {
    manager: AlertManager<'a>,
    pending: std::vec::IntoIter<Ingredient>,
    alerts: Vec<Alert>,
}

#[derive(Debug, Clone)]
pub struct CheckLowStock;

#[derive(Debug, Clone)]
pub struct ListAlerts;

#[derive(Debug)]
pub struct Alerts<M: r2d2::ManageConnection> {
    db: Pool<M>,
    ctx: Context,
}

impl<'a> AlertManager<'a> {
    pub fn new(tx: &'a dyn Storage, ctx: &'a Context) -> Self {
        AlertManager { tx, ctx }
    }

    pub fn record(
        &self,
        kind: AlertKind,
        ingredient: Option<Id<Ingredient>>,
        message: String,
    ) -> Result<Alert> {
        let mut alert = Alert {
            meta: DocMeta::new_with_id(self.ctx.idgen.generate()),
            ingredient,
            kind,
            message,
            created_at: self.ctx.clock.now(),
        };
        self.tx.save(&mut alert)?;
        info!("Raised {:?} alert: {}", alert.kind, alert.message);
        Ok(alert)
    }

    pub fn open_low_stock(&self, ingredient: &Ingredient) -> Result<Option<Alert>> {
        Ok(self
            .tx
            .load_all::<Alert>()?
            .into_iter()
            .find(|a| a.is_open_for(ingredient)))
    }

    /// Records a low-stock alert unless one is already open for the
    /// ingredient.
    pub fn raise_low_stock(&self, ingredient: &Ingredient, message: String) -> Result<Option<Alert>> {
        if let Some(open) = self.open_low_stock(ingredient)? {
            debug!("{} already has open alert {}", ingredient.name, open.id());
            return Ok(None);
        }
        self.record(AlertKind::LowStock, Some(ingredient.id()), message)
            .map(Some)
    }

    pub fn raise_discrepancy(&self, message: String) -> Result<Alert> {
        self.record(AlertKind::Discrepancy, None, message)
    }

    /// The alert for a serve that stock could not cover. Always fresh unless
    /// `dedupe_serve_alerts` is set.
    pub fn raise_shortfall(&self, ingredient: &Ingredient, message: String) -> Result<Option<Alert>> {
        if self.ctx.settings.dedupe_serve_alerts {
            self.raise_low_stock(ingredient, message)
        } else {
            self.record(AlertKind::LowStock, Some(ingredient.id()), message)
                .map(Some)
        }
    }

    pub fn scan_low_stock(self) -> Result<LowStockScan<'a>> {
        let ingredients = self.tx.load_all::<Ingredient>()?;
        let alerts = self.tx.load_all::<Alert>()?;
        Ok(LowStockScan {
            manager: self,
            pending: ingredients.into_iter(),
            alerts,
        })
    }
}

impl<'a> FallibleIterator for LowStockScan<'a> {
    type Item = Alert;
    type Error = anyhow::Error;

    fn next(&mut self) -> Result<Option<Alert>> {
        while let Some(ingredient) = self.pending.next() {
            if !ingredient.is_below_minimum() {
                continue;
            }
            if self.alerts.iter().any(|a| a.is_open_for(&ingredient)) {
                trace!("{} is low but already flagged", ingredient.name);
                continue;
            }
            let message = format!("{} below minimum {:.1}g", ingredient.name, ingredient.minimum);
            let alert = self
                .manager
                .record(AlertKind::LowStock, Some(ingredient.id()), message)?;
            self.alerts.push(alert.clone());
            return Ok(Some(alert));
        }
        Ok(None)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static> Alerts<M> {
    pub fn new(db: Pool<M>, ctx: Context) -> Self {
        Alerts { db, ctx }
    }
}

impl Request for CheckLowStock {
    type Resp = Vec<Alert>;
}

impl Request for ListAlerts {
    type Resp = Vec<Alert>;
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Commandable<CheckLowStock> for Alerts<M>
{
    fn execute(&self, _: CheckLowStock) -> Result<Vec<Alert>> {
        let conn = self.db.get()?;
        let raised = conn.atomically(|tx| {
            let mut scan = AlertManager::new(tx, &self.ctx).scan_low_stock()?;
            let mut raised = Vec::new();
            while let Some(alert) = scan.next()? {
                raised.push(alert);
            }
            Ok(raised)
        })?;

        info!("Low-stock scan raised {} alerts", raised.len());
        for alert in raised.iter() {
            self.ctx.notifier.publish(Event::Alert {
                message: alert.message.clone(),
            });
        }
        Ok(raised)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Queryable<ListAlerts> for Alerts<M>
{
    fn query(&self, _: ListAlerts) -> Result<Vec<Alert>> {
        self.db.get()?.load_all::<Alert>()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stock::RecordDelivery;
    use crate::test::junk_drawer;
    use chrono::Duration;

    #[test]
    fn scan_twice_raises_once() {
        env_logger::try_init().unwrap_or_default();
        let kitchen = junk_drawer::kitchen();
        junk_drawer::ingredient(&kitchen, "Salt", 400.0, 500.0);
        junk_drawer::ingredient(&kitchen, "Beef", 5000.0, 1000.0);
        let events = kitchen.subscribe();

        let first = kitchen.alerts().execute(CheckLowStock).expect("scan");
        let second = kitchen.alerts().execute(CheckLowStock).expect("rescan");

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message, "Salt below minimum 500.0g");
        assert!(second.is_empty());
        assert_eq!(kitchen.alerts().query(ListAlerts).expect("list").len(), 1);
        assert_eq!(
            events.drain(),
            vec![Event::Alert {
                message: "Salt below minimum 500.0g".into()
            }]
        );
    }

    #[test]
    fn delivery_reopens_the_scan() {
        let (kitchen, clock) = junk_drawer::kitchen_with(Default::default());
        let admin = junk_drawer::admin(&kitchen);
        let salt = junk_drawer::ingredient(&kitchen, "Salt", 100.0, 500.0);

        kitchen.alerts().execute(CheckLowStock).expect("scan");
        clock.advance(Duration::minutes(10));
        kitchen
            .stock()
            .execute(RecordDelivery {
                id: salt,
                grams: 50.0,
                actor: admin,
            })
            .expect("deliver");
        clock.advance(Duration::minutes(10));

        let again = kitchen.alerts().execute(CheckLowStock).expect("rescan");
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn shortfall_alerts_follow_the_dedupe_setting() {
        for &(dedupe, expected) in [(false, 2), (true, 1)].iter() {
            let mut settings = crate::config::Settings::default();
            settings.dedupe_serve_alerts = dedupe;
            let (kitchen, _clock) = junk_drawer::kitchen_with(settings);
            let salt = junk_drawer::ingredient(&kitchen, "Salt", 10.0, 500.0);
            let conn = kitchen.pool().get().expect("conn");

            for _ in 0..2 {
                conn.atomically(|tx| {
                    let salt = crate::stock::load_ingredient(tx, &salt)?;
                    AlertManager::new(tx, kitchen.context())
                        .raise_shortfall(&salt, "Insufficient Salt".into())
                })
                .expect("raise");
            }

            let alerts = kitchen.alerts().query(ListAlerts).expect("list");
            assert_eq!(alerts.len(), expected, "dedupe={}", dedupe);
        }
    }

    #[test]
    fn discrepancy_alerts_always_insert() {
        let kitchen = junk_drawer::kitchen();
        let conn = kitchen.pool().get().expect("conn");

        for _ in 0..2 {
            conn.atomically(|tx| {
                AlertManager::new(tx, kitchen.context())
                    .raise_discrepancy("Discrepancy rate 50.00% exceeds 15%".into())
            })
            .expect("raise");
        }

        let alerts = kitchen.alerts().query(ListAlerts).expect("list");
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.ingredient.is_none()));
    }
}
