use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use infra::documents::{DocMeta, HasMeta};
use infra::ids::{Entity, Id};

use crate::serving::MealServing;
use crate::users::User;

/// An ingredient and its running quantity on hand, in grams.
///
/// The quantity is not floored at zero; a stock-take may legitimately leave
/// it negative until the next delivery.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Ingredient {
    #[serde(flatten)]
    pub(crate) meta: DocMeta<Ingredient>,
    pub name: String,
    pub quantity: f64,
    pub minimum: f64,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Delivery,
    Consumption,
}

/// One movement of stock. Never updated once written.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct InventoryTransaction {
    #[serde(flatten)]
    pub(crate) meta: DocMeta<InventoryTransaction>,
    pub ingredient: Id<Ingredient>,
    pub delta: f64,
    pub user: Id<User>,
    pub serving: Option<Id<MealServing>>,
    pub kind: TransactionKind,
    pub at: DateTime<Utc>,
}

/// Cached quantity against what the transaction history says it should be.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub ingredient: Id<Ingredient>,
    pub on_hand: f64,
    pub ledger: f64,
    pub transactions: usize,
}

impl Ingredient {
    pub(crate) fn new(id: Id<Ingredient>, name: &str, minimum: f64, now: DateTime<Utc>) -> Self {
        Ingredient {
            meta: DocMeta::new_with_id(id),
            name: name.to_string(),
            quantity: 0.0,
            minimum,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> Id<Ingredient> {
        self.meta.id
    }

    pub fn apply_delta(&mut self, delta: f64, at: DateTime<Utc>) -> f64 {
        self.quantity += delta;
        self.updated_at = at;
        self.quantity
    }

    pub fn is_below_minimum(&self) -> bool {
        self.quantity < self.minimum
    }
}

impl InventoryTransaction {
    pub fn id(&self) -> Id<InventoryTransaction> {
        self.meta.id
    }
}

impl Reconciliation {
    pub fn is_balanced(&self) -> bool {
        (self.on_hand - self.ledger).abs() < 1e-6
    }
}

impl Entity for Ingredient {
    const PREFIX: &'static str = "ingredient";
}

impl HasMeta for Ingredient {
    fn meta(&self) -> &DocMeta<Self> {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut DocMeta<Self> {
        &mut self.meta
    }
}

impl Entity for InventoryTransaction {
    const PREFIX: &'static str = "txn";
}

impl HasMeta for InventoryTransaction {
    fn meta(&self) -> &DocMeta<Self> {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut DocMeta<Self> {
        &mut self.meta
    }
}
