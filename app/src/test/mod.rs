//! Guarded with `#[cfg(test)]` from `lib.rs`

use anyhow::Result;

use crate::access::{self, Permission, Role};
use crate::alerts::CheckLowStock;
use crate::clock::SystemClock;
use crate::config::Settings;
use crate::recipes::EstimatePortions;
use crate::reports::GenerateMonthlyReport;
use crate::services::{Commandable, Queryable};
use crate::serving::{ListServings, ServeMeal};
use crate::stock::{Reconcile, RecordDelivery};
use crate::{Context, Kitchen};

pub(crate) mod junk_drawer;

#[test]
fn a_day_in_the_kitchen() -> Result<()> {
    env_logger::try_init().unwrap_or_default();
    let kitchen = junk_drawer::kitchen();
    let manager = junk_drawer::user(&kitchen, "Manager One", Role::Manager);
    let cook = junk_drawer::user(&kitchen, "Cook One", Role::Cook);
    let beef = junk_drawer::ingredient(&kitchen, "Beef", 1000.0, 400.0);
    let salt = junk_drawer::ingredient(&kitchen, "Salt", 100.0, 20.0);
    let stew = junk_drawer::meal(&kitchen, "Beef Stew", &[(beef, 200.0), (salt, 5.0)]);

    access::require(&cook, Permission::ServeMeals)?;
    kitchen.serving().execute(ServeMeal {
        meal: stew,
        portions: 4,
        actor: cook,
    })?;

    access::require(&manager, Permission::CheckStock)?;
    let raised = kitchen.alerts().execute(CheckLowStock)?;
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].ingredient, Some(beef));

    access::require(&manager, Permission::ManageInventory)?;
    kitchen.stock().execute(RecordDelivery {
        id: beef,
        grams: 2000.0,
        actor: manager,
    })?;

    let estimate = kitchen.recipes().query(EstimatePortions)?;
    assert_eq!(estimate["Beef Stew"], 11);
    assert!(kitchen.stock().query(Reconcile { id: beef })?.is_balanced());
    assert!(kitchen.stock().query(Reconcile { id: salt })?.is_balanced());

    let servings = kitchen.serving().query(ListServings)?;
    assert_eq!(servings.len(), 1);
    assert_eq!(servings[0].user, "Cook One");
    assert!(access::require(&cook, Permission::GenerateReports).is_err());
    Ok(())
}

#[test]
#[ignore]
fn serve_and_report_against_postgres() -> Result<()> {
    env_logger::try_init().unwrap_or_default();
    let pool = junk_drawer::pg_pool("serve_and_report_against_postgres")?;
    let ctx = Context::new(Settings::default(), std::sync::Arc::new(SystemClock));
    let kitchen = Kitchen::new(pool, ctx)?;
    let cook = junk_drawer::user(&kitchen, "Cook One", Role::Cook);
    let potato = junk_drawer::ingredient(&kitchen, "Potato", 10_000.0, 2000.0);
    let mash = junk_drawer::meal(&kitchen, "Mashed Potatoes", &[(potato, 300.0)]);

    kitchen.serving().execute(ServeMeal {
        meal: mash,
        portions: 10,
        actor: cook,
    })?;
    let report = kitchen.reports().execute(GenerateMonthlyReport)?;

    assert_eq!(report.total_served, 10);
    assert_eq!(report.total_possible, 23);
    assert!(kitchen.stock().query(Reconcile { id: potato })?.is_balanced());
    Ok(())
}
