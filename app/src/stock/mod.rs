use anyhow::Result;
use chrono::{DateTime, Utc};
use log::*;
use r2d2::{self, Pool};

use infra::documents::DocMeta;
use infra::ids::{Entity, Id};
use infra::persistence::{Storage, StorageExt};

use crate::access::Actor;
use crate::error::{NotFound, ValidationError};
use crate::notify::Event;
use crate::recipes::Meal;
use crate::serving::MealServing;
use crate::services::{Commandable, Queryable, Request};
use crate::Context;

mod models;

pub use self::models::{Ingredient, InventoryTransaction, Reconciliation, TransactionKind};

#[derive(Debug, Clone)]
pub struct AddIngredient {
    pub name: String,
    pub quantity: f64,
    pub minimum: Option<f64>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub actor: Actor,
}

#[derive(Debug, Clone)]
pub struct ShowIngredient {
    pub id: Id<Ingredient>,
}

#[derive(Debug, Clone)]
pub struct ListIngredients;

#[derive(Debug, Clone)]
pub struct RecordDelivery {
    pub id: Id<Ingredient>,
    pub grams: f64,
    pub actor: Actor,
}

/// Stock-take: sets the quantity on hand to what was counted.
#[derive(Debug, Clone)]
pub struct AdjustStock {
    pub id: Id<Ingredient>,
    pub quantity: f64,
    pub actor: Actor,
}

#[derive(Debug, Clone)]
pub struct UpdateIngredient {
    pub id: Id<Ingredient>,
    pub minimum: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RemoveIngredient {
    pub id: Id<Ingredient>,
}

#[derive(Debug, Clone)]
pub struct Reconcile {
    pub id: Id<Ingredient>,
}

#[derive(Debug)]
pub struct Stock<M: r2d2::ManageConnection> {
    db: Pool<M>,
    ctx: Context,
}

/// Moves `delta` grams into or out of `ingredient` and writes the matching
/// transaction. Every change to a quantity on hand goes through here.
pub(crate) fn post(
    tx: &dyn Storage,
    ctx: &Context,
    ingredient: &mut Ingredient,
    delta: f64,
    kind: TransactionKind,
    actor: &Actor,
    serving: Option<Id<MealServing>>,
) -> Result<InventoryTransaction> {
    let at = ctx.clock.now();
    let quantity = ingredient.apply_delta(delta, at);
    if kind == TransactionKind::Delivery && delta > 0.0 {
        ingredient.delivered_at = Some(at);
    }
    tx.save(ingredient)?;

    let mut txn = InventoryTransaction {
        meta: DocMeta::new_with_id(ctx.idgen.generate()),
        ingredient: ingredient.id(),
        delta,
        user: actor.user,
        serving,
        kind,
        at,
    };
    tx.save(&mut txn)?;
    debug!(
        "{:?} of {}g {} leaves {}g",
        kind, delta, ingredient.name, quantity
    );
    Ok(txn)
}

pub(crate) fn load_ingredient(tx: &dyn Storage, id: &Id<Ingredient>) -> Result<Ingredient> {
    tx.load(id)?
        .ok_or_else(|| NotFound::new(Ingredient::PREFIX, id).into())
}

fn grams(what: &str, value: f64) -> Result<f64> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::new(format!("{} must be a non-negative amount: {}", what, value)).into());
    }
    Ok(value)
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static> Stock<M> {
    pub fn new(db: Pool<M>, ctx: Context) -> Self {
        Stock { db, ctx }
    }

    fn changed(&self, ingredient: &Ingredient) {
        self.ctx.notifier.publish(Event::StockChanged {
            ingredient: ingredient.name.clone(),
            quantity: ingredient.quantity,
        });
    }
}

impl Request for AddIngredient {
    type Resp = Id<Ingredient>;
}

impl Request for ShowIngredient {
    type Resp = Ingredient;
}

impl Request for ListIngredients {
    type Resp = Vec<Ingredient>;
}

impl Request for RecordDelivery {
    type Resp = f64;
}

impl Request for AdjustStock {
    type Resp = f64;
}

impl Request for UpdateIngredient {
    type Resp = Ingredient;
}

impl Request for RemoveIngredient {
    type Resp = ();
}

impl Request for Reconcile {
    type Resp = Reconciliation;
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Commandable<AddIngredient> for Stock<M>
{
    fn execute(&self, req: AddIngredient) -> Result<Id<Ingredient>> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::new("an ingredient needs a name").into());
        }
        let quantity = grams("quantity", req.quantity)?;
        let minimum = grams(
            "minimum",
            req.minimum
                .unwrap_or(self.ctx.settings.default_minimum_quantity),
        )?;
        if let Some(at) = req.delivered_at {
            if at > self.ctx.clock.now() {
                return Err(ValidationError::new(format!(
                    "delivery date {} is in the future",
                    at.to_rfc3339()
                ))
                .into());
            }
        }

        let conn = self.db.get()?;
        let ingredient = conn.atomically(|tx| {
            let existing = tx.load_all::<Ingredient>()?;
            if existing.iter().any(|i| i.name.eq_ignore_ascii_case(&name)) {
                return Err(ValidationError::new(format!("ingredient {} already exists", name)).into());
            }
            let mut ingredient =
                Ingredient::new(self.ctx.idgen.generate(), &name, minimum, self.ctx.clock.now());
            tx.save(&mut ingredient)?;
            if quantity > 0.0 {
                post(
                    tx,
                    &self.ctx,
                    &mut ingredient,
                    quantity,
                    TransactionKind::Delivery,
                    &req.actor,
                    None,
                )?;
            }
            if let Some(at) = req.delivered_at {
                ingredient.delivered_at = Some(at);
                tx.save(&mut ingredient)?;
            }
            Ok(ingredient)
        })?;

        info!("Added {} with {}g", ingredient.name, ingredient.quantity);
        self.changed(&ingredient);
        Ok(ingredient.id())
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Queryable<ShowIngredient> for Stock<M>
{
    fn query(&self, req: ShowIngredient) -> Result<Ingredient> {
        load_ingredient(&*self.db.get()?, &req.id)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Queryable<ListIngredients> for Stock<M>
{
    fn query(&self, _: ListIngredients) -> Result<Vec<Ingredient>> {
        let mut all = self.db.get()?.load_all::<Ingredient>()?;
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Commandable<RecordDelivery> for Stock<M>
{
    fn execute(&self, req: RecordDelivery) -> Result<f64> {
        let amount = grams("delivery", req.grams)?;
        if amount == 0.0 {
            return Err(ValidationError::new("a delivery must bring something").into());
        }

        let conn = self.db.get()?;
        let ingredient = conn.atomically(|tx| {
            let mut ingredient = load_ingredient(tx, &req.id)?;
            post(
                tx,
                &self.ctx,
                &mut ingredient,
                amount,
                TransactionKind::Delivery,
                &req.actor,
                None,
            )?;
            Ok(ingredient)
        })?;

        info!(
            "Delivered {}g of {}; now {}g",
            amount, ingredient.name, ingredient.quantity
        );
        self.changed(&ingredient);
        Ok(ingredient.quantity)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Commandable<AdjustStock> for Stock<M>
{
    fn execute(&self, req: AdjustStock) -> Result<f64> {
        let counted = grams("quantity", req.quantity)?;

        let conn = self.db.get()?;
        let (ingredient, delta) = conn.atomically(|tx| {
            let mut ingredient = load_ingredient(tx, &req.id)?;
            let delta = counted - ingredient.quantity;
            if delta != 0.0 {
                let kind = if delta > 0.0 {
                    TransactionKind::Delivery
                } else {
                    TransactionKind::Consumption
                };
                post(tx, &self.ctx, &mut ingredient, delta, kind, &req.actor, None)?;
            }
            Ok((ingredient, delta))
        })?;

        if delta != 0.0 {
            info!("Stock-take moved {} by {}g", ingredient.name, delta);
            self.changed(&ingredient);
        } else {
            debug!("Stock-take of {} matched", ingredient.name);
        }
        Ok(ingredient.quantity)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Commandable<UpdateIngredient> for Stock<M>
{
    fn execute(&self, req: UpdateIngredient) -> Result<Ingredient> {
        let minimum = req.minimum.map(|m| grams("minimum", m)).transpose()?;

        let conn = self.db.get()?;
        conn.atomically(|tx| {
            let mut ingredient = load_ingredient(tx, &req.id)?;
            if let Some(minimum) = minimum {
                ingredient.minimum = minimum;
                ingredient.updated_at = self.ctx.clock.now();
                tx.save(&mut ingredient)?;
                info!("Minimum for {} is now {}g", ingredient.name, minimum);
            }
            Ok(ingredient)
        })
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Commandable<RemoveIngredient> for Stock<M>
{
    fn execute(&self, req: RemoveIngredient) -> Result<()> {
        let conn = self.db.get()?;
        let ingredient = conn.atomically(|tx| {
            let ingredient = load_ingredient(tx, &req.id)?;
            let users: Vec<String> = tx
                .load_all::<Meal>()?
                .into_iter()
                .filter(|m| m.uses(&req.id))
                .map(|m| m.name)
                .collect();
            if !users.is_empty() {
                return Err(ValidationError::new(format!(
                    "{} is still used by {}",
                    ingredient.name,
                    users.join(", ")
                ))
                .into());
            }
            tx.delete(&ingredient)?;
            Ok(ingredient)
        })?;

        info!("Removed {}", ingredient.name);
        self.ctx.notifier.publish(Event::IngredientRemoved {
            ingredient: ingredient.name,
        });
        Ok(())
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Queryable<Reconcile> for Stock<M>
{
    fn query(&self, req: Reconcile) -> Result<Reconciliation> {
        let conn = self.db.get()?;
        let ingredient = load_ingredient(&*conn, &req.id)?;
        let txns: Vec<InventoryTransaction> = conn
            .load_all::<InventoryTransaction>()?
            .into_iter()
            .filter(|t| t.ingredient == req.id)
            .collect();
        let ledger = txns.iter().map(|t| t.delta).sum();
        let rec = Reconciliation {
            ingredient: req.id,
            on_hand: ingredient.quantity,
            ledger,
            transactions: txns.len(),
        };
        if !rec.is_balanced() {
            warn!(
                "{} holds {}g but its ledger sums to {}g",
                ingredient.name, rec.on_hand, rec.ledger
            );
        }
        Ok(rec)
    }
}
