//! The serving engine. A serve either debits every ingredient of the meal
//! and records the serving, or touches no stock at all and leaves a
//! low-stock alert behind.

use std::collections::HashMap;
use std::convert::TryFrom;

use anyhow::Result;
use log::*;
use r2d2::{self, Pool};

use infra::documents::DocMeta;
use infra::ids::Id;
use infra::persistence::{ConcurrencyError, Storage, StorageExt};

use crate::access::Actor;
use crate::alerts::{Alert, AlertManager};
use crate::error::{InsufficientStock, ValidationError};
use crate::notify::Event;
use crate::recipes::{self, Meal, Requirement};
use crate::services::{Commandable, Queryable, Request};
use crate::stock::{self, TransactionKind};
use crate::users::User;
use crate::Context;

mod models;

pub use self::models::{MealServing, ServingSummary};

#[derive(Debug, Clone)]
pub struct ServeMeal {
    pub meal: Id<Meal>,
    pub portions: i64,
    pub actor: Actor,
}

#[derive(Debug, Clone)]
pub struct ListServings;

#[derive(Debug)]
pub struct Serving<M: r2d2::ManageConnection> {
    db: Pool<M>,
    ctx: Context,
}

#[derive(Debug)]
enum Outcome {
    Served {
        serving: MealServing,
        meal: String,
    },
    Rejected {
        shortfalls: Vec<String>,
        alert: Option<Alert>,
    },
}

/// Requirements that stock cannot cover for `portions`, in recipe order.
pub fn shortfalls(requirements: &[Requirement], portions: u32) -> Vec<&Requirement> {
    requirements
        .iter()
        .filter(|r| r.is_short_for(portions))
        .collect()
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static> Serving<M> {
    pub fn new(db: Pool<M>, ctx: Context) -> Self {
        Serving { db, ctx }
    }

    fn attempt(&self, conn: &D, req: &ServeMeal, portions: u32) -> Result<Outcome> {
        conn.atomically(|tx| {
            let meal = recipes::load_meal(tx, &req.meal)?;
            let mut reqs = recipes::requirements_for(tx, &meal)?;

            let short = shortfalls(&reqs, portions);
            if let Some(last) = short.last() {
                let names: Vec<String> = short.iter().map(|r| r.ingredient.name.clone()).collect();
                let message = format!("Insufficient {}", names.join(", "));
                let alert =
                    AlertManager::new(tx, &self.ctx).raise_shortfall(&last.ingredient, message)?;
                return Ok(Outcome::Rejected {
                    shortfalls: names,
                    alert,
                });
            }

            let serving_id = self.ctx.idgen.generate();
            for r in reqs.iter_mut() {
                let required = r.required_for(portions);
                stock::post(
                    tx,
                    &self.ctx,
                    &mut r.ingredient,
                    -required,
                    TransactionKind::Consumption,
                    &req.actor,
                    Some(serving_id),
                )?;
            }

            let mut serving = MealServing {
                meta: DocMeta::new_with_id(serving_id),
                meal: meal.id(),
                user: req.actor.user,
                portions,
                served_at: self.ctx.clock.now(),
            };
            tx.save(&mut serving)?;
            Ok(Outcome::Served {
                serving,
                meal: meal.name,
            })
        })
    }
}

impl Request for ServeMeal {
    type Resp = Id<MealServing>;
}

impl Request for ListServings {
    type Resp = Vec<ServingSummary>;
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Commandable<ServeMeal> for Serving<M>
{
    fn execute(&self, req: ServeMeal) -> Result<Id<MealServing>> {
        if req.portions <= 0 {
            return Err(ValidationError::new(format!(
                "portions must be positive: {}",
                req.portions
            ))
            .into());
        }
        let portions = u32::try_from(req.portions)
            .map_err(|_| ValidationError::new(format!("too many portions: {}", req.portions)))?;

        let conn = self.db.get()?;
        let attempts = self.ctx.settings.serve_attempts.max(1);
        let mut attempt = 1;
        let outcome = loop {
            match self.attempt(&*conn, &req, portions) {
                Err(e) if attempt < attempts && e.downcast_ref::<ConcurrencyError>().is_some() => {
                    warn!(
                        "Serve of {} lost a race (attempt {} of {}); retrying",
                        req.meal, attempt, attempts
                    );
                    attempt += 1;
                }
                res => break res?,
            }
        };

        match outcome {
            Outcome::Served { serving, meal } => {
                info!("Served {} portions of {}", portions, meal);
                self.ctx
                    .notifier
                    .publish(Event::MealServed { meal, portions });
                Ok(serving.id())
            }
            Outcome::Rejected { shortfalls, alert } => {
                info!("Refused {} portions of {}: short of {:?}", portions, req.meal, shortfalls);
                if let Some(alert) = alert {
                    self.ctx.notifier.publish(Event::Alert {
                        message: alert.message,
                    });
                }
                Err(InsufficientStock { shortfalls }.into())
            }
        }
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Queryable<ListServings> for Serving<M>
{
    fn query(&self, _: ListServings) -> Result<Vec<ServingSummary>> {
        let conn = self.db.get()?;
        let meals: HashMap<Id<Meal>, String> = conn
            .load_all::<Meal>()?
            .into_iter()
            .map(|m| (m.id(), m.name))
            .collect();
        let users: HashMap<Id<User>, String> = conn
            .load_all::<User>()?
            .into_iter()
            .map(|u| (u.id(), u.full_name))
            .collect();

        let summaries = conn
            .load_all::<MealServing>()?
            .into_iter()
            .map(|s| ServingSummary {
                id: s.id(),
                meal: meals
                    .get(&s.meal)
                    .cloned()
                    .unwrap_or_else(|| "Unknown Meal".to_string()),
                user: users
                    .get(&s.user)
                    .cloned()
                    .unwrap_or_else(|| "Unknown User".to_string()),
                portions: s.portions,
                served_at: s.served_at,
            })
            .collect();
        Ok(summaries)
    }
}
