use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use infra::documents::{DocMeta, HasMeta};
use infra::ids::{Entity, Id};

use crate::stock::Ingredient;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    LowStock,
    Discrepancy,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Alert {
    #[serde(flatten)]
    pub(crate) meta: DocMeta<Alert>,
    pub ingredient: Option<Id<Ingredient>>,
    pub kind: AlertKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn id(&self) -> Id<Alert> {
        self.meta.id
    }

    /// A low-stock alert stays open until the ingredient next takes a
    /// delivery.
    pub fn is_open_for(&self, ingredient: &Ingredient) -> bool {
        self.kind == AlertKind::LowStock
            && self.ingredient == Some(ingredient.id())
            && ingredient
                .delivered_at
                .map_or(true, |delivered| self.created_at >= delivered)
    }
}

impl Entity for Alert {
    const PREFIX: &'static str = "alert";
}

impl HasMeta for Alert {
    fn meta(&self) -> &DocMeta<Self> {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut DocMeta<Self> {
        &mut self.meta
    }
}
