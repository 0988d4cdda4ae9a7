//! Pricing configuration for pagecredit.
//!
//! Two static tables: credits granted per purchasable plan, and credits charged
//! per file for each operation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Operation;

/// Credits charged per file when an operation has no explicit price.
pub const DEFAULT_UNIT_COST: i64 = 1;

/// Pricing configuration for plans and operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Credits granted for each purchasable plan id.
    pub plans: HashMap<String, i64>,

    /// Credits charged per file for each operation.
    pub operation_costs: HashMap<Operation, i64>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let plans = [
            ("credits_100", 100),
            ("credits_500", 500),
            ("credits_1200", 1200),
            ("credits_3000", 3000),
        ]
        .into_iter()
        .map(|(id, credits)| (id.to_string(), credits))
        .collect();

        let operation_costs = Operation::ALL
            .into_iter()
            .map(|op| {
                let cost = match op {
                    Operation::Convert => 2,
                    Operation::Ocr => 3,
                    _ => DEFAULT_UNIT_COST,
                };
                (op, cost)
            })
            .collect();

        Self {
            plans,
            operation_costs,
        }
    }
}

impl PricingConfig {
    /// Credits granted by a plan, or `None` for an unknown plan id.
    #[must_use]
    pub fn plan_credits(&self, plan_id: &str) -> Option<i64> {
        self.plans.get(plan_id).copied().filter(|credits| *credits > 0)
    }

    /// Credits charged per file for an operation.
    #[must_use]
    pub fn unit_cost(&self, operation: Operation) -> i64 {
        self.operation_costs
            .get(&operation)
            .copied()
            .unwrap_or(DEFAULT_UNIT_COST)
    }

    /// Total cost of running `operation` over `files` inputs.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn batch_cost(&self, operation: Operation, files: usize) -> Option<i64> {
        i64::try_from(files)
            .ok()
            .and_then(|n| n.checked_mul(self.unit_cost(operation)))
    }
}
