use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context as _, Result};
use chrono::{DateTime, Utc};
use log::*;
use serde::Deserialize;
use structopt::StructOpt;

use infra::ids::Id;
use infra::persistence::Storage;
use kitchen::access::{self, Actor, Permission, Role};
use kitchen::alerts::{CheckLowStock, ListAlerts};
use kitchen::config::{self, EnvLogger, EnvOverrides, StorageConfig};
use kitchen::notify::Subscription;
use kitchen::recipes::{
    AddMeal, EstimatePortions, ListMeals, Meal, MealIngredient, RemoveMeal, Requirements,
    ShowMeal, UpdateMeal,
};
use kitchen::reports::{GenerateMonthlyReport, ListReports};
use kitchen::seed;
use kitchen::services::{Commandable, Queryable};
use kitchen::serving::{ListServings, ServeMeal};
use kitchen::stock::{
    AddIngredient, AdjustStock, Ingredient, ListIngredients, Reconcile, RecordDelivery,
    RemoveIngredient, ShowIngredient, UpdateIngredient,
};
use kitchen::users::{AddUser, FindUser, ListUsers};
use kitchen::{Context, Kitchen};

#[derive(Debug, StructOpt)]
#[structopt(name = "kitchen", about = "Kindergarten kitchen ledger")]
struct Opt {
    /// Configuration file
    #[structopt(parse(from_os_str))]
    config: PathBuf,
    /// Email of the user to act as
    #[structopt(long = "as")]
    acting: Option<String>,
    /// Print published notifications as JSON lines
    #[structopt(long = "events")]
    events: bool,
    #[structopt(subcommand)]
    command: Commands,
}

#[derive(Debug, StructOpt)]
enum Commands {
    #[structopt(name = "setup", about = "Initialize storage")]
    Setup,
    #[structopt(name = "seed", about = "Load sample users, ingredients and meals")]
    Seed,
    #[structopt(name = "add-user", about = "Register a user")]
    AddUser {
        full_name: String,
        email: String,
        role: Role,
    },
    #[structopt(name = "users", about = "List users")]
    Users,
    #[structopt(name = "add-ingredient", about = "Add an ingredient")]
    AddIngredient {
        name: String,
        /// Grams on hand
        quantity: f64,
        #[structopt(long = "minimum")]
        minimum: Option<f64>,
        /// RFC 3339 time of the last delivery
        #[structopt(long = "delivered-at")]
        delivered_at: Option<DateTime<Utc>>,
    },
    #[structopt(name = "ingredients", about = "List ingredients")]
    Ingredients,
    #[structopt(name = "ingredient", about = "Show one ingredient")]
    Ingredient { id: Id<Ingredient> },
    #[structopt(name = "deliver", about = "Record a delivery")]
    Deliver { id: Id<Ingredient>, grams: f64 },
    #[structopt(name = "adjust", about = "Set the counted quantity on hand")]
    Adjust { id: Id<Ingredient>, quantity: f64 },
    #[structopt(name = "set-minimum", about = "Change an ingredient's minimum")]
    SetMinimum { id: Id<Ingredient>, minimum: f64 },
    #[structopt(name = "remove-ingredient", about = "Remove an unused ingredient")]
    RemoveIngredient { id: Id<Ingredient> },
    #[structopt(name = "reconcile", about = "Compare stock with its ledger")]
    Reconcile { id: Id<Ingredient> },
    #[structopt(name = "add-meal", about = "Add a meal")]
    AddMeal {
        name: String,
        /// Lines of the form <ingredient-id>=<grams per portion>
        lines: Vec<Line>,
    },
    #[structopt(name = "update-meal", about = "Rename a meal or replace its ingredients")]
    UpdateMeal {
        id: Id<Meal>,
        #[structopt(long = "name")]
        name: Option<String>,
        lines: Vec<Line>,
    },
    #[structopt(name = "meals", about = "List meals")]
    Meals,
    #[structopt(name = "meal", about = "Show a meal and its requirements")]
    Meal { id: Id<Meal> },
    #[structopt(name = "remove-meal", about = "Remove a meal and its servings")]
    RemoveMeal { id: Id<Meal> },
    #[structopt(name = "serve", about = "Serve portions of a meal")]
    Serve { id: Id<Meal>, portions: i64 },
    #[structopt(name = "estimate", about = "Portions each meal could make")]
    Estimate,
    #[structopt(name = "servings", about = "List servings")]
    Servings,
    #[structopt(name = "check-stock", about = "Raise alerts for low stock")]
    CheckStock,
    #[structopt(name = "alerts", about = "List alerts")]
    Alerts,
    #[structopt(name = "report", about = "Generate this month's report")]
    Report,
    #[structopt(name = "reports", about = "List reports")]
    Reports,
}

#[derive(Debug)]
struct Line(MealIngredient);

#[derive(Deserialize, Debug)]
struct ConfigFile {
    #[serde(flatten)]
    kitchen: config::Config,
    #[serde(default)]
    env_logger: EnvLogger,
}

impl FromStr for Line {
    type Err = anyhow::Error;
    fn from_str(src: &str) -> Result<Self> {
        let mut parts = src.splitn(2, '=');
        let id = parts.next().unwrap_or_default();
        let grams = parts
            .next()
            .ok_or_else(|| anyhow!("expected <ingredient>=<grams>, got {:?}", src))?;
        Ok(Line(MealIngredient {
            ingredient: id.parse()?,
            grams: grams.parse().with_context(|| format!("grams in {:?}", src))?,
        }))
    }
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let mut config_buf = String::new();
    File::open(&opt.config)
        .with_context(|| format!("open {:?}", opt.config))?
        .read_to_string(&mut config_buf)?;
    let mut config: ConfigFile = toml::from_str(&config_buf).context("parse config")?;
    EnvOverrides::from_env()?.apply(&mut config.kitchen, &mut config.env_logger);

    config.env_logger.builder().init();
    debug!("Options: {:?}", opt);

    let ctx = Context::with_system_clock(config.kitchen.kitchen.clone());
    match &config.kitchen.storage {
        StorageConfig::Postgres(pg) => run(&Kitchen::new(pg.build()?, ctx)?, opt),
        StorageConfig::Memory => {
            warn!("Using the in-memory store; nothing will be kept");
            run(&Kitchen::new(config::memory_pool(2)?, ctx)?, opt)
        }
    }
}

fn run<M, D>(kitchen: &Kitchen<M>, opt: Opt) -> Result<()>
where
    M: r2d2::ManageConnection<Connection = D>,
    D: Storage + Send + 'static,
{
    let events = if opt.events {
        Some(kitchen.subscribe())
    } else {
        None
    };

    let acting = opt.acting.clone();
    let as_actor = |permission: Permission| -> Result<Actor> {
        let email = acting
            .as_ref()
            .ok_or_else(|| anyhow!("pass --as <email> to {}", permission))?;
        let user = kitchen
            .users()
            .query(FindUser {
                email: email.clone(),
            })?
            .ok_or_else(|| anyhow!("no user with email {}", email))?;
        let actor = user.actor();
        access::require(&actor, permission)?;
        Ok(actor)
    };

    match opt.command {
        Commands::Setup => {
            info!("Storage is set up");
        }
        Commands::Seed => {
            if seed::seed(kitchen)? {
                println!("Seeded sample data");
            } else {
                println!("Already seeded");
            }
        }
        Commands::AddUser {
            full_name,
            email,
            role,
        } => {
            let existing = kitchen.users().query(ListUsers)?;
            if !existing.is_empty() {
                as_actor(Permission::ManageUsers)?;
            }
            let id = kitchen.users().execute(AddUser {
                full_name,
                email,
                role,
            })?;
            println!("{}", id);
        }
        Commands::Users => {
            as_actor(Permission::ManageUsers)?;
            for user in kitchen.users().query(ListUsers)? {
                println!("{}: {} <{}> {}", user.id(), user.full_name, user.email, user.role);
            }
        }
        Commands::AddIngredient {
            name,
            quantity,
            minimum,
            delivered_at,
        } => {
            let actor = as_actor(Permission::ManageInventory)?;
            let id = kitchen.stock().execute(AddIngredient {
                name,
                quantity,
                minimum,
                delivered_at,
                actor,
            })?;
            println!("{}", id);
        }
        Commands::Ingredients => {
            as_actor(Permission::ViewKitchen)?;
            for i in kitchen.stock().query(ListIngredients)? {
                let flag = if i.is_below_minimum() { " LOW" } else { "" };
                println!(
                    "{}: {} {:.1}g (minimum {:.1}g){}",
                    i.id(),
                    i.name,
                    i.quantity,
                    i.minimum,
                    flag
                );
            }
        }
        Commands::Ingredient { id } => {
            as_actor(Permission::ViewKitchen)?;
            let i = kitchen.stock().query(ShowIngredient { id })?;
            println!("{}", serde_json::to_string_pretty(&i)?);
        }
        Commands::Deliver { id, grams } => {
            let actor = as_actor(Permission::ManageInventory)?;
            let now = kitchen.stock().execute(RecordDelivery { id, grams, actor })?;
            println!("{:.1}g on hand", now);
        }
        Commands::Adjust { id, quantity } => {
            let actor = as_actor(Permission::ManageInventory)?;
            let now = kitchen.stock().execute(AdjustStock {
                id,
                quantity,
                actor,
            })?;
            println!("{:.1}g on hand", now);
        }
        Commands::SetMinimum { id, minimum } => {
            as_actor(Permission::ManageInventory)?;
            let i = kitchen.stock().execute(UpdateIngredient {
                id,
                minimum: Some(minimum),
            })?;
            println!("{}: minimum {:.1}g", i.name, i.minimum);
        }
        Commands::RemoveIngredient { id } => {
            as_actor(Permission::ManageInventory)?;
            kitchen.stock().execute(RemoveIngredient { id })?;
        }
        Commands::Reconcile { id } => {
            as_actor(Permission::ViewKitchen)?;
            let rec = kitchen.stock().query(Reconcile { id })?;
            let state = if rec.is_balanced() { "balanced" } else { "MISMATCH" };
            println!(
                "on hand {:.3}g; ledger {:.3}g over {} transactions: {}",
                rec.on_hand, rec.ledger, rec.transactions, state
            );
        }
        Commands::AddMeal { name, lines } => {
            as_actor(Permission::ManageMeals)?;
            let id = kitchen.recipes().execute(AddMeal {
                name,
                ingredients: lines.into_iter().map(|l| l.0).collect(),
            })?;
            println!("{}", id);
        }
        Commands::UpdateMeal { id, name, lines } => {
            as_actor(Permission::ManageMeals)?;
            let ingredients = if lines.is_empty() {
                None
            } else {
                Some(lines.into_iter().map(|l| l.0).collect())
            };
            let meal = kitchen.recipes().execute(UpdateMeal {
                id,
                name,
                ingredients,
            })?;
            println!("{}: {}", meal.id(), meal.name);
        }
        Commands::Meals => {
            as_actor(Permission::ViewKitchen)?;
            for meal in kitchen.recipes().query(ListMeals)? {
                println!("{}: {} ({} ingredients)", meal.id(), meal.name, meal.ingredients.len());
            }
        }
        Commands::Meal { id } => {
            as_actor(Permission::ViewKitchen)?;
            let meal = kitchen.recipes().query(ShowMeal { id })?;
            println!("{}: {}", meal.id(), meal.name);
            for req in kitchen.recipes().query(Requirements { meal: id })? {
                println!(
                    "  {} {:.1}g per portion ({:.1}g on hand)",
                    req.ingredient.name, req.per_portion, req.ingredient.quantity
                );
            }
        }
        Commands::RemoveMeal { id } => {
            as_actor(Permission::ManageMeals)?;
            let servings = kitchen.recipes().execute(RemoveMeal { id })?;
            println!("Removed with {} servings", servings);
        }
        Commands::Serve { id, portions } => {
            let actor = as_actor(Permission::ServeMeals)?;
            let serving = kitchen.serving().execute(ServeMeal {
                meal: id,
                portions,
                actor,
            });
            match serving {
                Ok(serving) => println!("{}", serving),
                Err(e) => {
                    print_events(&events)?;
                    return Err(e);
                }
            }
        }
        Commands::Estimate => {
            as_actor(Permission::ViewKitchen)?;
            for (meal, portions) in kitchen.recipes().query(EstimatePortions)? {
                println!("{}: {}", meal, portions);
            }
        }
        Commands::Servings => {
            as_actor(Permission::ViewKitchen)?;
            for s in kitchen.serving().query(ListServings)? {
                println!("{} {} x{} by {}", s.served_at, s.meal, s.portions, s.user);
            }
        }
        Commands::CheckStock => {
            as_actor(Permission::CheckStock)?;
            for alert in kitchen.alerts().execute(CheckLowStock)? {
                println!("{}", alert.message);
            }
        }
        Commands::Alerts => {
            as_actor(Permission::ViewKitchen)?;
            for alert in kitchen.alerts().query(ListAlerts)? {
                println!("{} {:?} {}", alert.created_at, alert.kind, alert.message);
            }
        }
        Commands::Report => {
            as_actor(Permission::GenerateReports)?;
            let report = kitchen.reports().execute(GenerateMonthlyReport)?;
            println!(
                "{}: served {} of {} possible; discrepancy {:.2}%",
                report.month, report.total_served, report.total_possible, report.discrepancy
            );
        }
        Commands::Reports => {
            as_actor(Permission::ViewKitchen)?;
            for report in kitchen.reports().query(ListReports)? {
                println!(
                    "{} {}: {:.2}%",
                    report.created_at, report.month, report.discrepancy
                );
            }
        }
    }

    print_events(&events)
}

fn print_events(events: &Option<Subscription>) -> Result<()> {
    if let Some(events) = events {
        for event in events.drain() {
            println!("{}", serde_json::to_string(&event)?);
        }
    }
    Ok(())
}
