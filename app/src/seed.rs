//! Sample users, ingredients and meals for a fresh kitchen.

use anyhow::Result;
use log::*;

use infra::persistence::Storage;

use crate::access::Role;
use crate::recipes::{AddMeal, MealIngredient};
use crate::services::{Commandable, Queryable};
use crate::stock::AddIngredient;
use crate::users::{AddUser, FindUser};
use crate::Kitchen;

const USERS: &[(&str, &str, Role)] = &[
    ("Admin One", "admin@kitchen.local", Role::Admin),
    ("Manager One", "manager@kitchen.local", Role::Manager),
    ("Cook One", "cook@kitchen.local", Role::Cook),
];

/// Name, grams on hand, minimum.
const INGREDIENTS: &[(&str, f64, f64)] = &[
    ("Beef", 5000.0, 1000.0),
    ("Potato", 10000.0, 2000.0),
    ("Salt", 2000.0, 500.0),
];

const MEALS: &[(&str, &[(&str, f64)])] = &[
    ("Beef Stew", &[("Beef", 200.0), ("Salt", 5.0)]),
    ("Mashed Potatoes", &[("Potato", 300.0), ("Salt", 3.0)]),
];

/// Returns false, doing nothing, when the sample admin already exists.
pub fn seed<M, D>(kitchen: &Kitchen<M>) -> Result<bool>
where
    M: r2d2::ManageConnection<Connection = D>,
    D: Storage + Send + 'static,
{
    let users = kitchen.users();
    if users
        .query(FindUser {
            email: USERS[0].1.into(),
        })?
        .is_some()
    {
        info!("Kitchen already seeded");
        return Ok(false);
    }

    for &(full_name, email, role) in USERS {
        users.execute(AddUser {
            full_name: full_name.into(),
            email: email.into(),
            role,
        })?;
    }
    let admin = users
        .query(FindUser {
            email: USERS[0].1.into(),
        })?
        .map(|u| u.actor())
        .ok_or_else(|| anyhow::anyhow!("seeded admin vanished"))?;

    let stock = kitchen.stock();
    let mut ids = Vec::new();
    for &(name, quantity, minimum) in INGREDIENTS {
        let id = stock.execute(AddIngredient {
            name: name.into(),
            quantity,
            minimum: Some(minimum),
            delivered_at: None,
            actor: admin,
        })?;
        ids.push((name, id));
    }

    let recipes = kitchen.recipes();
    for &(name, lines) in MEALS {
        let ingredients = lines
            .iter()
            .map(|&(ingredient, grams)| {
                ids.iter()
                    .find(|(n, _)| *n == ingredient)
                    .map(|&(_, id)| MealIngredient { ingredient: id, grams })
                    .ok_or_else(|| anyhow::anyhow!("no sample ingredient {}", ingredient))
            })
            .collect::<Result<Vec<_>>>()?;
        recipes.execute(AddMeal {
            name: name.into(),
            ingredients,
        })?;
    }

    info!(
        "Seeded {} users, {} ingredients and {} meals",
        USERS.len(),
        INGREDIENTS.len(),
        MEALS.len()
    );
    Ok(true)
}
