//! Static cost model keyed by resource class.
//!
//! Unit costs are relative weights (an `m1.small` hour is 1 unit). They are
//! used two ways:
//!
//! - **Authorization** charges every resource at its full unit cost,
//!   including spot resources.
//! - **Reporting** converts units to currency with `cost_base` and discounts
//!   spot hours by `spot_factor`.
//!
//! The asymmetry is a policy choice: spot capacity can be pre-empted, so the
//! amount billed may be lower than the reported estimate, but concurrent
//! commitment is never authorized beyond the conservative full-rate figure.
//! Revisit it together with the spend ceiling rather than in isolation.

use std::collections::BTreeMap;

use crate::config::SpendConfig;

/// Unit cost table plus reporting and bidding factors.
#[derive(Debug, Clone, PartialEq)]
pub struct CostModel {
    unit_costs: BTreeMap<String, f64>,
    cost_base: f64,
    spot_factor: f64,
    spot_bid_base: f64,
}

impl CostModel {
    /// Build a model from explicit values.
    pub fn new(
        unit_costs: BTreeMap<String, f64>,
        cost_base: f64,
        spot_factor: f64,
        spot_bid_base: f64,
    ) -> Self {
        Self {
            unit_costs,
            cost_base,
            spot_factor,
            spot_bid_base,
        }
    }

    /// Build the model described by the `[spend]` config section.
    pub fn from_config(config: &SpendConfig) -> Self {
        Self::new(
            config.unit_costs.clone(),
            config.cost_base,
            config.spot_factor,
            config.spot_bid_base,
        )
    }

    /// Unit cost per hour of one resource of `class`.
    pub fn unit_cost(&self, class: &str) -> Option<f64> {
        self.unit_costs.get(class).copied()
    }

    /// Full-rate cost of `count` resources of `class`, used when authorizing.
    pub fn authorization_cost(&self, class: &str, count: u32) -> Option<f64> {
        self.unit_cost(class).map(|unit| unit * f64::from(count))
    }

    /// Full-rate cost of an already running resource.
    ///
    /// Classes missing from the table (retired after launch) are charged at
    /// the most expensive known rate.
    pub fn committed_unit_cost(&self, class: &str) -> f64 {
        self.unit_cost(class).unwrap_or_else(|| {
            tracing::warn!(class, "resource class missing from cost table, charging maximum");
            self.max_unit_cost()
        })
    }

    /// Currency per billable hour for reporting; spot hours are discounted.
    pub fn hourly_rate(&self, class: &str, is_spot: bool) -> Option<f64> {
        self.unit_cost(class).map(|unit| {
            let rate = unit * self.cost_base;
            if is_spot {
                rate * self.spot_factor
            } else {
                rate
            }
        })
    }

    /// Reporting rate for a recorded resource; retired classes use the
    /// maximum unit cost, as in [`committed_unit_cost`](Self::committed_unit_cost).
    pub fn report_rate(&self, class: &str, is_spot: bool) -> f64 {
        self.hourly_rate(class, is_spot).unwrap_or_else(|| {
            let rate = self.committed_unit_cost(class) * self.cost_base;
            if is_spot {
                rate * self.spot_factor
            } else {
                rate
            }
        })
    }

    /// Bid price submitted with a spot request for `class`.
    pub fn spot_bid(&self, class: &str) -> Option<f64> {
        self.unit_cost(class).map(|unit| unit * self.spot_bid_base)
    }

    fn max_unit_cost(&self) -> f64 {
        self.unit_costs.values().copied().fold(0.0, f64::max)
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self::from_config(&SpendConfig::default())
    }
}
