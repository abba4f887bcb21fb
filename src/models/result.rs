//! Execution results.

use crate::models::param::QueryParam;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One fetched row, keyed by column name.
pub type Row = serde_json::Map<String, JsonValue>;

/// Result of an update-style statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "rows", rename_all = "lowercase")]
pub enum UpdateOutcome {
    /// Executed immediately; number of affected rows.
    Affected(u64),
    /// Queued by a batch executor; counts arrive with the next flush.
    Batched,
}

impl UpdateOutcome {
    /// Affected row count, if the statement has already run.
    pub fn affected(&self) -> Option<u64> {
        match self {
            Self::Affected(n) => Some(*n),
            Self::Batched => None,
        }
    }
}

/// One coalesced batch entry: a statement, its SQL and every parameter set
/// queued against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub statement_id: String,
    pub sql: String,
    pub parameters: Vec<Vec<QueryParam>>,
    /// Filled in when the batch is flushed, one count per parameter set.
    #[serde(default)]
    pub update_counts: Vec<u64>,
}

impl BatchResult {
    pub fn new(statement_id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            statement_id: statement_id.into(),
            sql: sql.into(),
            parameters: Vec::new(),
            update_counts: Vec::new(),
        }
    }

    pub fn add_parameters(&mut self, params: Vec<QueryParam>) {
        self.parameters.push(params);
    }

    /// Sum of the flushed update counts.
    pub fn total_updated(&self) -> u64 {
        self.update_counts.iter().sum()
    }
}
