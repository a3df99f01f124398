//! What an executor can evaluate.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use prevega_core::config::SqlDialect;

use crate::transform::TransformKind;

/// Capability set advertised by an executor and consulted by the plan
/// builder: transforms outside it end the foldable prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub kinds: BTreeSet<TransformKind>,
    /// Whether the executor reports computed signal values (extent, bin).
    pub signals: bool,
    /// Set when plans are consumed as SQL text; nodes that have no SQL
    /// rendering in this dialect are then unsupported.
    pub sql: Option<SqlDialect>,
}

impl Capabilities {
    /// Every transform kind, with signal output.
    pub fn all() -> Self {
        Self {
            kinds: TransformKind::ALL.into_iter().collect(),
            signals: true,
            sql: None,
        }
    }

    pub fn only(kinds: impl IntoIterator<Item = TransformKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            signals: false,
            sql: None,
        }
    }

    /// Everything renderable as SQL in `dialect`; no signal output.
    pub fn sql(dialect: SqlDialect) -> Self {
        Self {
            kinds: TransformKind::ALL
                .into_iter()
                .filter(|k| *k != TransformKind::Extent)
                .collect(),
            signals: false,
            sql: Some(dialect),
        }
    }

    pub fn with_signals(mut self, signals: bool) -> Self {
        self.signals = signals;
        self
    }

    pub fn supports(&self, kind: TransformKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Intersection with another capability set.
    pub fn restrict(&self, other: &Capabilities) -> Capabilities {
        Capabilities {
            kinds: self.kinds.intersection(&other.kinds).copied().collect(),
            signals: self.signals && other.signals,
            sql: self.sql.or(other.sql),
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restrict_intersects() {
        let a = Capabilities::all();
        let b = Capabilities::only([TransformKind::Filter, TransformKind::Aggregate]);
        let c = a.restrict(&b);
        assert!(c.supports(TransformKind::Filter));
        assert!(!c.supports(TransformKind::Bin));
        assert!(!c.signals);
        assert!(!Capabilities::sql(SqlDialect::Spark).supports(TransformKind::Extent));
    }
}
