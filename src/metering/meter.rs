//! Per-subscription meter.

use std::collections::BTreeMap;

use chrono::{DateTime, DurationRound, Months, Utc};
use serde::{Deserialize, Serialize};

use super::event::{Plan, RenewalInterval, SubscriptionPurchased};
use crate::billing::{ResourceId, UsageRecordKey, UsageRecord};

/// Consumption of one dimension in the current period and hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionConsumption {
    pub included_remaining: f64,
    /// Overage accumulated in the current hour.
    pub overage: f64,
}

/// Metering state of one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meter {
    pub resource: ResourceId,
    pub plan: Plan,
    pub renewal: RenewalInterval,
    pub billing_period_start: DateTime<Utc>,
    pub current_hour: DateTime<Utc>,
    /// Keyed by billing dimension id.
    pub consumption: BTreeMap<String, DimensionConsumption>,
    pub usage_to_be_reported: Vec<UsageRecord>,
    pub deleted: bool,
}

pub(crate) fn hour_start(time: DateTime<Utc>) -> DateTime<Utc> {
    time.duration_trunc(chrono::Duration::hours(1)).unwrap_or(time)
}

impl Meter {
    pub fn new(purchase: &SubscriptionPurchased, now: DateTime<Utc>) -> Self {
        let mut meter = Self {
            resource: purchase.resource.clone(),
            plan: purchase.plan.clone(),
            renewal: purchase.renewal,
            billing_period_start: purchase.subscription_start,
            current_hour: hour_start(now),
            consumption: BTreeMap::new(),
            usage_to_be_reported: Vec::new(),
            deleted: false,
        };
        meter.reset_included();
        meter.roll_billing_period(now);
        meter
    }

    fn next_period_start(&self) -> Option<DateTime<Utc>> {
        let months = match self.renewal {
            RenewalInterval::Monthly => 1,
            RenewalInterval::Annually => 12,
        };
        self.billing_period_start.checked_add_months(Months::new(months))
    }

    fn reset_included(&mut self) {
        let consumption = self
            .plan
            .dimensions
            .values()
            .map(|d| {
                let overage = self
                    .consumption
                    .get(&d.dimension_id)
                    .map(|c| c.overage)
                    .unwrap_or(0.0);
                (
                    d.dimension_id.clone(),
                    DimensionConsumption {
                        included_remaining: d.included_quantity,
                        overage,
                    },
                )
            })
            .collect();
        self.consumption = consumption;
    }

    fn roll_billing_period(&mut self, now: DateTime<Utc>) {
        let mut renewed = false;
        while let Some(next) = self.next_period_start() {
            if now < next {
                break;
            }
            self.billing_period_start = next;
            renewed = true;
        }
        if renewed {
            self.reset_included();
        }
    }

    /// Turn the current hour's overage into usage records.
    pub fn close_hour(&mut self) {
        for (dimension, consumption) in self.consumption.iter_mut() {
            if consumption.overage > 0.0 {
                self.usage_to_be_reported.push(UsageRecord {
                    resource: self.resource.clone(),
                    plan_id: self.plan.plan_id.clone(),
                    dimension: dimension.clone(),
                    quantity: consumption.overage,
                    effective_start_time: self.current_hour,
                });
                consumption.overage = 0.0;
            }
        }
    }

    /// Move the meter's clock to `now`, closing hours and renewing periods.
    pub fn advance_to(&mut self, now: DateTime<Utc>) {
        let hour = hour_start(now);
        if hour > self.current_hour {
            self.close_hour();
            self.current_hour = hour;
        }
        self.roll_billing_period(now);
    }

    /// Record usage of a meter. Errors describe why the usage is unprocessable.
    pub fn consume(&mut self, meter_name: &str, quantity: f64) -> Result<(), String> {
        if !quantity.is_finite() || quantity < 0.0 {
            return Err(format!("invalid quantity {}", quantity));
        }
        let dimension = self
            .plan
            .dimensions
            .get(meter_name)
            .ok_or_else(|| format!("unknown meter '{}' for plan '{}'", meter_name, self.plan.plan_id))?;
        let consumption = self
            .consumption
            .get_mut(&dimension.dimension_id)
            .ok_or_else(|| format!("no consumption for dimension '{}'", dimension.dimension_id))?;

        let from_included = consumption.included_remaining.min(quantity);
        consumption.included_remaining -= from_included;
        consumption.overage += quantity - from_included;
        Ok(())
    }

    /// Remove a settled record. Returns whether it was pending.
    pub fn settle(&mut self, key: &UsageRecordKey) -> bool {
        let before = self.usage_to_be_reported.len();
        self.usage_to_be_reported.retain(|r| &r.key() != key);
        before != self.usage_to_be_reported.len()
    }

    /// Stop metering; overage of the running hour is reported immediately.
    pub fn delete(&mut self) {
        self.close_hour();
        self.deleted = true;
    }
}
