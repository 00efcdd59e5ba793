use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use infra::documents::{DocMeta, HasMeta};
use infra::ids::{Entity, Id};

use crate::recipes::Meal;
use crate::users::User;

/// A recorded serve. Written once by the serving engine, never updated.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MealServing {
    #[serde(flatten)]
    pub(crate) meta: DocMeta<MealServing>,
    pub meal: Id<Meal>,
    pub user: Id<User>,
    pub portions: u32,
    pub served_at: DateTime<Utc>,
}

/// A serving as shown to people, with names resolved.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ServingSummary {
    pub id: Id<MealServing>,
    pub meal: String,
    pub user: String,
    pub portions: u32,
    pub served_at: DateTime<Utc>,
}

impl MealServing {
    pub fn id(&self) -> Id<MealServing> {
        self.meta.id
    }
}

impl Entity for MealServing {
    const PREFIX: &'static str = "serving";
}

impl HasMeta for MealServing {
    fn meta(&self) -> &DocMeta<Self> {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut DocMeta<Self> {
        &mut self.meta
    }
}
