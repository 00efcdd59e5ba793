use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use log::*;
use r2d2::{self, Pool};

use infra::documents::DocMeta;
use infra::ids::{Entity, Id};
use infra::persistence::{Storage, StorageExt};

use crate::error::{NotFound, ValidationError};
use crate::services::{Commandable, Queryable, Request};
use crate::serving::MealServing;
use crate::stock;
use crate::Context;

mod models;

pub use self::models::{max_portions, Meal, MealIngredient, Requirement};

#[derive(Debug, Clone)]
pub struct AddMeal {
    pub name: String,
    pub ingredients: Vec<MealIngredient>,
}

/// Renames a meal and/or replaces its whole ingredient list.
#[derive(Debug, Clone)]
pub struct UpdateMeal {
    pub id: Id<Meal>,
    pub name: Option<String>,
    pub ingredients: Option<Vec<MealIngredient>>,
}

#[derive(Debug, Clone)]
pub struct RemoveMeal {
    pub id: Id<Meal>,
}

#[derive(Debug, Clone)]
pub struct ShowMeal {
    pub id: Id<Meal>,
}

#[derive(Debug, Clone)]
pub struct ListMeals;

#[derive(Debug, Clone)]
pub struct Requirements {
    pub meal: Id<Meal>,
}

#[derive(Debug, Clone)]
pub struct MaxPortions {
    pub meal: Id<Meal>,
}

#[derive(Debug, Clone)]
pub struct EstimatePortions;

#[derive(Debug)]
pub struct Recipes<M: r2d2::ManageConnection> {
    db: Pool<M>,
    ctx: Context,
}

pub(crate) fn load_meal(tx: &dyn Storage, id: &Id<Meal>) -> Result<Meal> {
    tx.load(id)?
        .ok_or_else(|| NotFound::new(Meal::PREFIX, id).into())
}

/// Resolves each recipe line against current stock, in recipe order. Lines
/// naming the same ingredient are merged.
pub(crate) fn requirements_for(tx: &dyn Storage, meal: &Meal) -> Result<Vec<Requirement>> {
    let mut reqs: Vec<Requirement> = Vec::with_capacity(meal.ingredients.len());
    for line in meal.ingredients.iter() {
        if let Some(req) = reqs
            .iter_mut()
            .find(|r| r.ingredient.id() == line.ingredient)
        {
            req.per_portion += line.grams;
            continue;
        }
        let ingredient = stock::load_ingredient(tx, &line.ingredient)?;
        reqs.push(Requirement {
            ingredient,
            per_portion: line.grams,
        });
    }
    Ok(reqs)
}

fn check_lines(tx: &dyn Storage, lines: &[MealIngredient]) -> Result<()> {
    let mut seen = HashSet::new();
    for line in lines {
        if !line.grams.is_finite() || line.grams <= 0.0 {
            return Err(ValidationError::new(format!(
                "quantity per portion must be positive: {}",
                line.grams
            ))
            .into());
        }
        if !seen.insert(line.ingredient) {
            return Err(ValidationError::new(format!(
                "{} appears more than once",
                line.ingredient
            ))
            .into());
        }
        stock::load_ingredient(tx, &line.ingredient)?;
    }
    Ok(())
}

fn check_name_free(tx: &dyn Storage, name: &str, except: Option<Id<Meal>>) -> Result<()> {
    let taken = tx
        .load_all::<Meal>()?
        .into_iter()
        .any(|m| Some(m.id()) != except && m.name.eq_ignore_ascii_case(name));
    if taken {
        return Err(ValidationError::new(format!("meal {} already exists", name)).into());
    }
    Ok(())
}

fn meal_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::new("a meal needs a name").into());
    }
    Ok(name.to_string())
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static> Recipes<M> {
    pub fn new(db: Pool<M>, ctx: Context) -> Self {
        Recipes { db, ctx }
    }
}

impl Request for AddMeal {
    type Resp = Id<Meal>;
}

impl Request for UpdateMeal {
    type Resp = Meal;
}

impl Request for RemoveMeal {
    type Resp = usize;
}

impl Request for ShowMeal {
    type Resp = Meal;
}

impl Request for ListMeals {
    type Resp = Vec<Meal>;
}

impl Request for Requirements {
    type Resp = Vec<Requirement>;
}

impl Request for MaxPortions {
    type Resp = u64;
}

impl Request for EstimatePortions {
    type Resp = BTreeMap<String, u64>;
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Commandable<AddMeal> for Recipes<M>
{
    fn execute(&self, req: AddMeal) -> Result<Id<Meal>> {
        let name = meal_name(&req.name)?;

        let conn = self.db.get()?;
        let id = conn.atomically(|tx| {
            check_name_free(tx, &name, None)?;
            check_lines(tx, &req.ingredients)?;
            let now = self.ctx.clock.now();
            let mut meal = Meal {
                meta: DocMeta::new_with_id(self.ctx.idgen.generate()),
                name: name.clone(),
                ingredients: req.ingredients.clone(),
                created_at: now,
                updated_at: now,
            };
            tx.save(&mut meal)?;
            Ok(meal.id())
        })?;

        info!("Added meal {} with {} ingredients", name, req.ingredients.len());
        Ok(id)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Commandable<UpdateMeal> for Recipes<M>
{
    fn execute(&self, req: UpdateMeal) -> Result<Meal> {
        let name = req.name.as_ref().map(|n| meal_name(n)).transpose()?;

        let conn = self.db.get()?;
        let meal = conn.atomically(|tx| {
            let mut meal = load_meal(tx, &req.id)?;
            if let Some(name) = name.as_ref() {
                check_name_free(tx, name, Some(meal.id()))?;
                meal.name = name.clone();
            }
            if let Some(lines) = req.ingredients.as_ref() {
                check_lines(tx, lines)?;
                meal.ingredients = lines.clone();
            }
            meal.updated_at = self.ctx.clock.now();
            tx.save(&mut meal)?;
            Ok(meal)
        })?;

        info!("Updated meal {}", meal.name);
        Ok(meal)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Commandable<RemoveMeal> for Recipes<M>
{
    fn execute(&self, req: RemoveMeal) -> Result<usize> {
        let conn = self.db.get()?;
        let (meal, servings) = conn.atomically(|tx| {
            let meal = load_meal(tx, &req.id)?;
            let servings: Vec<MealServing> = tx
                .load_all::<MealServing>()?
                .into_iter()
                .filter(|s| s.meal == req.id)
                .collect();
            for serving in servings.iter() {
                tx.delete(serving)?;
            }
            tx.delete(&meal)?;
            Ok((meal, servings.len()))
        })?;

        info!("Removed meal {} and {} servings", meal.name, servings);
        Ok(servings)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Queryable<ShowMeal> for Recipes<M>
{
    fn query(&self, req: ShowMeal) -> Result<Meal> {
        load_meal(&*self.db.get()?, &req.id)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Queryable<ListMeals> for Recipes<M>
{
    fn query(&self, _: ListMeals) -> Result<Vec<Meal>> {
        let mut meals = self.db.get()?.load_all::<Meal>()?;
        meals.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(meals)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Queryable<Requirements> for Recipes<M>
{
    fn query(&self, req: Requirements) -> Result<Vec<Requirement>> {
        let conn = self.db.get()?;
        let meal = load_meal(&*conn, &req.meal)?;
        requirements_for(&*conn, &meal)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Queryable<MaxPortions> for Recipes<M>
{
    fn query(&self, req: MaxPortions) -> Result<u64> {
        let reqs = self.query(Requirements { meal: req.meal })?;
        Ok(max_portions(&reqs))
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Queryable<EstimatePortions> for Recipes<M>
{
    fn query(&self, _: EstimatePortions) -> Result<BTreeMap<String, u64>> {
        let conn = self.db.get()?;
        let mut estimate = BTreeMap::new();
        for meal in conn.load_all::<Meal>()? {
            let portions = max_portions(&requirements_for(&*conn, &meal)?);
            debug!("{} could make {} portions", meal.name, portions);
            estimate.insert(meal.name, portions);
        }
        Ok(estimate)
    }
}
