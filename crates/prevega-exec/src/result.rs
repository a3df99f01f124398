//! What one data source evaluated to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use prevega_core::dag::LogicalPlan;
use prevega_core::types::Table;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub dataset_name: String,
    /// Computed rows; `None` for vendor references, which are never run here.
    pub table: Option<Table>,
    /// SQL sent to (or prepared for) the executor.
    pub generated_query: Option<String>,
    /// `prevega+query://` reference written in vendor mode.
    pub reference_url: Option<String>,
    pub source_plan: LogicalPlan,
    /// Leading transforms replaced by this result.
    pub folded: usize,
    /// Transforms after `folded` remain for the client.
    pub partial: bool,
    pub signals: BTreeMap<String, Value>,
}

impl ExecutionResult {
    pub fn row_count(&self) -> Option<usize> {
        self.table.as_ref().map(Table::num_rows)
    }

    pub fn metadata(&self) -> ResultMetadata {
        ResultMetadata {
            dataset_name: self.dataset_name.clone(),
            generated_query: self.generated_query.clone(),
            row_count: self.row_count(),
            reference_url: self.reference_url.clone(),
            folded: self.folded,
            partial: self.partial,
        }
    }
}

/// Serializable summary of an `ExecutionResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub dataset_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_url: Option<String>,
    pub folded: usize,
    pub partial: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prevega_core::schema::Schema;
    use serde_json::json;

    #[test]
    fn metadata_skips_absent_parts() {
        let result = ExecutionResult {
            dataset_name: "d".into(),
            table: None,
            generated_query: Some("SELECT 1".into()),
            reference_url: Some("prevega+query://abc".into()),
            source_plan: LogicalPlan::scan("d", Schema::default()),
            folded: 2,
            partial: false,
            signals: BTreeMap::new(),
        };
        assert_eq!(
            serde_json::to_value(result.metadata()).unwrap(),
            json!({
                "dataset_name": "d",
                "generated_query": "SELECT 1",
                "reference_url": "prevega+query://abc",
                "folded": 2,
                "partial": false
            })
        );
    }
}
