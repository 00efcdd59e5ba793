use anyhow::Result;
use log::*;
use r2d2::{self, Pool};

use infra::documents::DocMeta;
use infra::persistence::{Storage, StorageExt};

use crate::alerts::{Alert, AlertManager};
use crate::notify::Event;
use crate::recipes::{self, max_portions, Meal};
use crate::services::{Commandable, Queryable, Request};
use crate::serving::MealServing;
use crate::Context;

mod models;

pub use self::models::{discrepancy_rate, month_start, MonthlyReport};

/// Compares this month's servings against what current stock could make.
/// Every run writes a fresh report, even for a month already reported on.
#[derive(Debug, Clone)]
pub struct GenerateMonthlyReport;

#[derive(Debug, Clone)]
pub struct ListReports;

#[derive(Debug)]
pub struct Reports<M: r2d2::ManageConnection> {
    db: Pool<M>,
    ctx: Context,
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static> Reports<M> {
    pub fn new(db: Pool<M>, ctx: Context) -> Self {
        Reports { db, ctx }
    }
}

impl Request for GenerateMonthlyReport {
    type Resp = MonthlyReport;
}

impl Request for ListReports {
    type Resp = Vec<MonthlyReport>;
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Commandable<GenerateMonthlyReport> for Reports<M>
{
    fn execute(&self, _: GenerateMonthlyReport) -> Result<MonthlyReport> {
        let now = self.ctx.clock.now();
        let start = month_start(now, self.ctx.settings.utc_offset()?)?;
        let threshold = self.ctx.settings.discrepancy_threshold;

        let conn = self.db.get()?;
        let (report, alert): (MonthlyReport, Option<Alert>) = conn.atomically(|tx| {
            let total_served: u64 = tx
                .load_all::<MealServing>()?
                .iter()
                .filter(|s| s.served_at >= start)
                .map(|s| u64::from(s.portions))
                .sum();

            let mut total_possible = 0;
            for meal in tx.load_all::<Meal>()? {
                total_possible += max_portions(&recipes::requirements_for(tx, &meal)?);
            }

            let discrepancy = discrepancy_rate(total_served, total_possible);
            debug!(
                "Since {}: served {} of {} possible ({:.2}%)",
                start, total_served, total_possible, discrepancy
            );

            let alert = if discrepancy > threshold {
                let message = format!(
                    "Discrepancy rate {:.2}% exceeds {}%",
                    discrepancy, threshold
                );
                Some(AlertManager::new(tx, &self.ctx).raise_discrepancy(message)?)
            } else {
                None
            };

            let mut report = MonthlyReport {
                meta: DocMeta::new_with_id(self.ctx.idgen.generate()),
                month: start,
                total_served,
                total_possible: total_possible.max(1),
                discrepancy,
                created_at: now,
            };
            tx.save(&mut report)?;
            Ok((report, alert))
        })?;

        info!(
            "Report {} for month from {}: {:.2}% discrepancy",
            report.id(),
            report.month,
            report.discrepancy
        );
        if let Some(alert) = alert {
            self.ctx.notifier.publish(Event::Alert {
                message: alert.message,
            });
        }
        self.ctx.notifier.publish(Event::ReportUpdate {
            discrepancy: report.discrepancy,
        });
        Ok(report)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Queryable<ListReports> for Reports<M>
{
    fn query(&self, _: ListReports) -> Result<Vec<MonthlyReport>> {
        self.db.get()?.load_all::<MonthlyReport>()
    }
}
