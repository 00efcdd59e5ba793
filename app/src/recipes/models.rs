use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use infra::documents::{DocMeta, HasMeta};
use infra::ids::{Entity, Id};

use crate::stock::Ingredient;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Meal {
    #[serde(flatten)]
    pub(crate) meta: DocMeta<Meal>,
    pub name: String,
    pub ingredients: Vec<MealIngredient>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How much of one ingredient a single portion takes.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct MealIngredient {
    pub ingredient: Id<Ingredient>,
    pub grams: f64,
}

/// A recipe line resolved against the current stock.
#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    pub ingredient: Ingredient,
    pub per_portion: f64,
}

impl Meal {
    pub fn id(&self) -> Id<Meal> {
        self.meta.id
    }

    pub fn uses(&self, ingredient: &Id<Ingredient>) -> bool {
        self.ingredients.iter().any(|l| l.ingredient == *ingredient)
    }
}

impl Requirement {
    pub fn required_for(&self, portions: u32) -> f64 {
        self.per_portion * f64::from(portions)
    }

    pub fn is_short_for(&self, portions: u32) -> bool {
        self.ingredient.quantity < self.required_for(portions)
    }

    /// Whole portions this ingredient alone could cover.
    pub fn portions_available(&self) -> u64 {
        let n = (self.ingredient.quantity / self.per_portion).floor();
        if n > 0.0 {
            n as u64
        } else {
            0
        }
    }
}

/// The most whole portions that current stock allows. A meal with no
/// ingredients cannot be estimated, so it counts as zero.
pub fn max_portions(requirements: &[Requirement]) -> u64 {
    requirements
        .iter()
        .map(Requirement::portions_available)
        .min()
        .unwrap_or(0)
}

impl Entity for Meal {
    const PREFIX: &'static str = "meal";
}

impl HasMeta for Meal {
    fn meta(&self) -> &DocMeta<Self> {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut DocMeta<Self> {
        &mut self.meta
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn stocked(name: &str, quantity: f64, per_portion: f64) -> Requirement {
        let now = Utc.with_ymd_and_hms(2025, 1, 6, 7, 0, 0).unwrap();
        let mut ingredient = Ingredient::new(Id::hashed(name), name, 0.0, now);
        ingredient.quantity = quantity;
        Requirement {
            ingredient,
            per_portion,
        }
    }

    #[test]
    fn portions_round_down() {
        assert_eq!(max_portions(&[stocked("Beef", 950.0, 200.0)]), 4);
    }

    #[test]
    fn no_requirements_means_no_portions() {
        assert_eq!(max_portions(&[]), 0);
    }

    #[test]
    fn scarcest_ingredient_wins() {
        let reqs = [
            stocked("Potato", 10_000.0, 300.0),
            stocked("Salt", 20.0, 3.0),
        ];
        assert_eq!(max_portions(&reqs), 6);
    }

    #[test]
    fn overdrawn_stock_yields_zero() {
        assert_eq!(max_portions(&[stocked("Milk", -40.0, 10.0)]), 0);
    }

    #[test]
    fn shortfall_compares_against_the_whole_order() {
        let req = stocked("Beef", 950.0, 200.0);
        assert!(!req.is_short_for(4));
        assert!(req.is_short_for(5));
        assert_eq!(req.required_for(5), 1000.0);
    }
}
