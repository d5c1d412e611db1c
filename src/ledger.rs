use crate::models::{EvaluatedRow, Outcome};
use serde::Serialize;

/// Money spent and saved over one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostLedger {
    pub rows: usize,
    pub judged: usize,
    pub cache_hits: usize,
    pub failed: usize,
    pub total_cost: f64,
    pub total_saved: f64,
}

impl CostLedger {
    pub fn from_rows(rows: &[EvaluatedRow]) -> Self {
        let mut ledger = CostLedger {
            rows: rows.len(),
            ..Default::default()
        };

        for row in rows {
            match &row.outcome {
                Outcome::Judged(result) => {
                    ledger.judged += 1;
                    ledger.total_cost += result.cost;
                }
                Outcome::Cached(result) => {
                    ledger.cache_hits += 1;
                    ledger.total_saved += result.saved_cost;
                }
                Outcome::Failed(_) => ledger.failed += 1,
            }
        }

        ledger
    }
}
