//! Relational plan each data source compiles to.
//!
//! A `LogicalPlan` is a unary chain rooted at a single `Scan`. Every node's
//! output schema is derived deterministically by `LogicalPlan::schema`, which
//! is what the dispatcher checks executor results against.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::schema::{DataType, Field, Schema};

pub use crate::types::SortKey;

/// Aggregate measures (Vega `aggregate` ops that have a relational meaning).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Count,
    Valid,
    Missing,
    Distinct,
    Sum,
    Mean,
    Min,
    Max,
    Variance,
    Stdev,
    Median,
}

impl AggregateOp {
    pub fn parse(s: &str) -> Option<AggregateOp> {
        Some(match s {
            "count" => AggregateOp::Count,
            "valid" => AggregateOp::Valid,
            "missing" => AggregateOp::Missing,
            "distinct" => AggregateOp::Distinct,
            "sum" => AggregateOp::Sum,
            "mean" | "average" => AggregateOp::Mean,
            "min" => AggregateOp::Min,
            "max" => AggregateOp::Max,
            "variance" => AggregateOp::Variance,
            "stdev" => AggregateOp::Stdev,
            "median" => AggregateOp::Median,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateOp::Count => "count",
            AggregateOp::Valid => "valid",
            AggregateOp::Missing => "missing",
            AggregateOp::Distinct => "distinct",
            AggregateOp::Sum => "sum",
            AggregateOp::Mean => "mean",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Variance => "variance",
            AggregateOp::Stdev => "stdev",
            AggregateOp::Median => "median",
        }
    }

    pub fn output_type(&self, input: Option<DataType>) -> DataType {
        match self {
            AggregateOp::Count
            | AggregateOp::Valid
            | AggregateOp::Missing
            | AggregateOp::Distinct => DataType::Int64,
            AggregateOp::Min | AggregateOp::Max => input.unwrap_or(DataType::Float64),
            _ => DataType::Float64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub op: AggregateOp,
    /// `None` only for `count`.
    pub field: Option<String>,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowOp {
    RowNumber,
    Rank,
    DenseRank,
    Lag,
    Lead,
    FirstValue,
    LastValue,
    Count,
    Sum,
    Mean,
    Min,
    Max,
}

impl WindowOp {
    pub fn parse(s: &str) -> Option<WindowOp> {
        Some(match s {
            "row_number" => WindowOp::RowNumber,
            "rank" => WindowOp::Rank,
            "dense_rank" => WindowOp::DenseRank,
            "lag" => WindowOp::Lag,
            "lead" => WindowOp::Lead,
            "first_value" => WindowOp::FirstValue,
            "last_value" => WindowOp::LastValue,
            "count" => WindowOp::Count,
            "sum" => WindowOp::Sum,
            "mean" | "average" => WindowOp::Mean,
            "min" => WindowOp::Min,
            "max" => WindowOp::Max,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            WindowOp::RowNumber => "row_number",
            WindowOp::Rank => "rank",
            WindowOp::DenseRank => "dense_rank",
            WindowOp::Lag => "lag",
            WindowOp::Lead => "lead",
            WindowOp::FirstValue => "first_value",
            WindowOp::LastValue => "last_value",
            WindowOp::Count => "count",
            WindowOp::Sum => "sum",
            WindowOp::Mean => "mean",
            WindowOp::Min => "min",
            WindowOp::Max => "max",
        }
    }

    /// Ops that need an input field.
    pub fn needs_field(&self) -> bool {
        !matches!(
            self,
            WindowOp::RowNumber | WindowOp::Rank | WindowOp::DenseRank | WindowOp::Count
        )
    }

    pub fn output_type(&self, input: Option<DataType>) -> DataType {
        match self {
            WindowOp::RowNumber | WindowOp::Rank | WindowOp::DenseRank | WindowOp::Count => {
                DataType::Int64
            }
            WindowOp::Sum | WindowOp::Mean => DataType::Float64,
            _ => input.unwrap_or(DataType::Float64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowFunction {
    pub op: WindowOp,
    pub field: Option<String>,
    /// Offset for `lag`/`lead` (default 1).
    pub param: Option<i64>,
    pub alias: String,
}

/// Row-based frame `[start, end]` relative to the current row; `None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowFrame {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl Default for WindowFrame {
    fn default() -> Self {
        Self {
            start: None,
            end: Some(0),
        }
    }
}

impl WindowFrame {
    /// Inclusive row range for row `i` in a partition of `len` rows, or `None`
    /// when the frame is empty.
    pub fn bounds(&self, i: usize, len: usize) -> Option<(usize, usize)> {
        if len == 0 {
            return None;
        }
        let i = i as i64;
        let last = len as i64 - 1;
        let lo = self.start.map(|s| i + s).unwrap_or(0).max(0);
        let hi = self.end.map(|e| i + e).unwrap_or(last).min(last);
        (lo <= hi).then_some((lo as usize, hi as usize))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackOffset {
    Zero,
    Center,
    Normalize,
}

impl StackOffset {
    pub fn parse(s: &str) -> Option<StackOffset> {
        Some(match s {
            "zero" => StackOffset::Zero,
            "center" => StackOffset::Center,
            "normalize" => StackOffset::Normalize,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnitPart {
    Year,
    Quarter,
    Month,
    Date,
    Week,
    Day,
    DayOfYear,
    Hours,
    Minutes,
    Seconds,
    Milliseconds,
}

impl TimeUnitPart {
    pub fn parse(s: &str) -> Option<TimeUnitPart> {
        Some(match s {
            "year" => TimeUnitPart::Year,
            "quarter" => TimeUnitPart::Quarter,
            "month" => TimeUnitPart::Month,
            "date" => TimeUnitPart::Date,
            "week" => TimeUnitPart::Week,
            "day" => TimeUnitPart::Day,
            "dayofyear" => TimeUnitPart::DayOfYear,
            "hours" => TimeUnitPart::Hours,
            "minutes" => TimeUnitPart::Minutes,
            "seconds" => TimeUnitPart::Seconds,
            "milliseconds" => TimeUnitPart::Milliseconds,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            TimeUnitPart::Year => "year",
            TimeUnitPart::Quarter => "quarter",
            TimeUnitPart::Month => "month",
            TimeUnitPart::Date => "date",
            TimeUnitPart::Week => "week",
            TimeUnitPart::Day => "day",
            TimeUnitPart::DayOfYear => "dayofyear",
            TimeUnitPart::Hours => "hours",
            TimeUnitPart::Minutes => "minutes",
            TimeUnitPart::Seconds => "seconds",
            TimeUnitPart::Milliseconds => "milliseconds",
        }
    }
}

/// Parameters of a Vega `bin` transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinParams {
    pub maxbins: f64,
    pub base: f64,
    pub step: Option<f64>,
    pub steps: Option<Vec<f64>>,
    pub minstep: f64,
    pub divide: Vec<f64>,
    pub nice: bool,
    pub span: Option<f64>,
}

impl Default for BinParams {
    fn default() -> Self {
        Self {
            maxbins: 20.0,
            base: 10.0,
            step: None,
            steps: None,
            minstep: 0.0,
            divide: vec![5.0, 2.0],
            nice: true,
            span: None,
        }
    }
}

/// Upper bound on step growth; a finite base above 1 needs far fewer.
const MAX_STEP_ROUNDS: usize = 2048;

/// Resolved bin boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinSpec {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl BinParams {
    /// Bounds on the step search: `base` must grow the step and at least
    /// one bin must be allowed.
    pub fn validate(&self) -> Result<()> {
        if !self.base.is_finite() || self.base <= 1.0 {
            return Err(Error::Plan(format!(
                "bin base must be a finite number greater than 1, got {}",
                self.base
            )));
        }
        if !self.maxbins.is_finite() || self.maxbins < 1.0 {
            return Err(Error::Plan(format!(
                "bin maxbins must be at least 1, got {}",
                self.maxbins
            )));
        }
        Ok(())
    }

    /// Compute bin boundaries for `extent` the way Vega's `bin` does.
    pub fn resolve(&self, extent: (f64, f64)) -> Result<BinSpec> {
        self.validate()?;
        let (mut min, mut max) = extent;
        if !min.is_finite() || !max.is_finite() {
            return Err(Error::Plan(format!(
                "bin extent must be finite, got [{}, {}]",
                min, max
            )));
        }
        let base = self.base;
        let logb = base.ln();
        let maxb = self.maxbins;
        let span = self
            .span
            .filter(|s| *s != 0.0)
            .unwrap_or_else(|| {
                let s = max - min;
                if s != 0.0 {
                    s
                } else if min.abs() != 0.0 {
                    min.abs()
                } else {
                    1.0
                }
            });

        let step = if let Some(step) = self.step {
            step
        } else if let Some(steps) = &self.steps {
            let v = span / maxb;
            let i = steps.iter().take_while(|s| **s < v).count();
            steps.get(i.saturating_sub(1)).copied().unwrap_or(1.0)
        } else {
            let level = (maxb.ln() / logb).ceil();
            let minstep = self.minstep;
            let mut step = minstep.max(base.powf((span.ln() / logb).round() - level));
            let mut rounds = 0;
            while (span / step).ceil() > maxb {
                if rounds == MAX_STEP_ROUNDS || !step.is_finite() {
                    return Err(Error::Plan(format!(
                        "no bin step fits {} bins over a span of {}",
                        maxb, span
                    )));
                }
                step *= base;
                rounds += 1;
            }
            for div in &self.divide {
                let v = step / div;
                if v >= minstep && span / v <= maxb {
                    step = v;
                }
            }
            step
        };
        if !(step > 0.0) || !step.is_finite() {
            return Err(Error::Plan(format!("invalid bin step {}", step)));
        }

        let v = step.ln();
        let precision = if v >= 0.0 { 0.0 } else { (-v / logb).trunc() + 1.0 };
        let eps = base.powf(-precision - 1.0);
        if self.nice {
            let v = (min / step + eps).floor() * step;
            min = if min < v { v - step } else { v };
            max = (max / step).ceil() * step;
        }
        if max == min {
            max = min + step;
        }
        Ok(BinSpec {
            start: min,
            stop: max,
            step,
        })
    }
}

impl BinSpec {
    /// Lower bin boundary for value `v` (Vega semantics: values outside
    /// `[start, stop]` map to -/+ infinity).
    pub fn bin0(&self, v: f64) -> f64 {
        const EPSILON: f64 = 1e-14;
        if v.is_nan() {
            return f64::NAN;
        }
        if v < self.start {
            return f64::NEG_INFINITY;
        }
        if v > self.stop {
            return f64::INFINITY;
        }
        let v = v.min(self.stop - self.step).max(self.start);
        self.start + self.step * (EPSILON + (v - self.start) / self.step).floor()
    }
}

/// Where a bin node gets its extent from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BinExtent {
    Literal(f64, f64),
    /// Computed by an upstream `Extent` node in the same plan.
    Signal(String),
}

/// High-level logical nodes (scan → transforms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalPlan {
    Scan {
        dataset: String,
        schema: Schema,
    },
    Filter {
        input: Box<LogicalPlan>,
        predicate: Expr,
    },
    Formula {
        input: Box<LogicalPlan>,
        expr: Expr,
        alias: String,
    },
    /// `(source, alias)` pairs, in output order.
    Project {
        input: Box<LogicalPlan>,
        columns: Vec<(String, String)>,
    },
    Aggregate {
        input: Box<LogicalPlan>,
        group_by: Vec<String>,
        aggs: Vec<AggregateExpr>,
    },
    /// Passes rows through and publishes `[min, max]` of `field` as `signal`.
    Extent {
        input: Box<LogicalPlan>,
        field: String,
        signal: String,
    },
    Bin {
        input: Box<LogicalPlan>,
        field: String,
        params: BinParams,
        extent: BinExtent,
        alias: (String, String),
        signal: Option<String>,
    },
    TimeUnit {
        input: Box<LogicalPlan>,
        field: String,
        units: Vec<TimeUnitPart>,
        timezone: String,
        alias: (String, String),
    },
    Window {
        input: Box<LogicalPlan>,
        group_by: Vec<String>,
        order_by: Vec<SortKey>,
        frame: WindowFrame,
        /// When false, frames grow to cover rows that tie on `order_by`.
        ignore_peers: bool,
        functions: Vec<WindowFunction>,
    },
    Stack {
        input: Box<LogicalPlan>,
        field: String,
        group_by: Vec<String>,
        order_by: Vec<SortKey>,
        offset: StackOffset,
        alias: (String, String),
    },
    Fold {
        input: Box<LogicalPlan>,
        fields: Vec<String>,
        alias: (String, String),
    },
    Sort {
        input: Box<LogicalPlan>,
        keys: Vec<SortKey>,
    },
}

impl LogicalPlan {
    pub fn scan(dataset: impl Into<String>, schema: Schema) -> Self {
        LogicalPlan::Scan {
            dataset: dataset.into(),
            schema,
        }
    }

    /// The single input of a non-scan node.
    pub fn input(&self) -> Option<&LogicalPlan> {
        use LogicalPlan::*;
        match self {
            Scan { .. } => None,
            Filter { input, .. }
            | Formula { input, .. }
            | Project { input, .. }
            | Aggregate { input, .. }
            | Extent { input, .. }
            | Bin { input, .. }
            | TimeUnit { input, .. }
            | Window { input, .. }
            | Stack { input, .. }
            | Fold { input, .. }
            | Sort { input, .. } => Some(input),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        use LogicalPlan::*;
        match self {
            Scan { .. } => "scan",
            Filter { .. } => "filter",
            Formula { .. } => "formula",
            Project { .. } => "project",
            Aggregate { .. } => "aggregate",
            Extent { .. } => "extent",
            Bin { .. } => "bin",
            TimeUnit { .. } => "timeunit",
            Window { .. } => "window",
            Stack { .. } => "stack",
            Fold { .. } => "fold",
            Sort { .. } => "sort",
        }
    }

    /// Number of nodes in the chain, scan included.
    pub fn node_count(&self) -> usize {
        1 + self.input().map(LogicalPlan::node_count).unwrap_or(0)
    }

    /// Name of the dataset the chain reads.
    pub fn scan_dataset(&self) -> &str {
        match self {
            LogicalPlan::Scan { dataset, .. } => dataset,
            other => other
                .input()
                .map(LogicalPlan::scan_dataset)
                .unwrap_or_default(),
        }
    }

    /// Signals published by nodes in this plan, root last.
    pub fn output_signals(&self) -> Vec<String> {
        let mut out = self
            .input()
            .map(LogicalPlan::output_signals)
            .unwrap_or_default();
        match self {
            LogicalPlan::Extent { signal, .. } => out.push(signal.clone()),
            LogicalPlan::Bin {
                signal: Some(signal),
                ..
            } => out.push(signal.clone()),
            _ => {}
        }
        out
    }

    /// Output schema of this node.
    pub fn schema(&self) -> Result<Schema> {
        use LogicalPlan::*;
        let input_schema = match self.input() {
            Some(input) => input.schema()?,
            None => Schema::default(),
        };
        match self {
            Scan { schema, .. } => Ok(schema.clone()),
            Filter { predicate, .. } => {
                predicate.data_type(&input_schema)?;
                Ok(input_schema)
            }
            Formula { expr, alias, .. } => {
                let dt = expr.data_type(&input_schema)?;
                Ok(input_schema.with_field(Field::new(alias.clone(), dt, true)))
            }
            Project { columns, .. } => {
                let fields = columns
                    .iter()
                    .map(|(src, alias)| {
                        let f = input_schema.require(src)?;
                        Ok(Field::new(alias.clone(), f.data_type, f.nullable))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Schema::try_new(fields)
            }
            Aggregate { group_by, aggs, .. } => {
                let mut fields = group_by
                    .iter()
                    .map(|g| input_schema.require(g).cloned())
                    .collect::<Result<Vec<_>>>()?;
                for agg in aggs {
                    let input_type = match &agg.field {
                        Some(f) => Some(input_schema.require(f)?.data_type),
                        None => None,
                    };
                    fields.push(Field::new(
                        agg.alias.clone(),
                        agg.op.output_type(input_type),
                        true,
                    ));
                }
                Schema::try_new(fields)
            }
            Extent { field, .. } => {
                input_schema.require(field)?;
                Ok(input_schema)
            }
            Bin { field, alias, .. } | Stack { field, alias, .. } => {
                input_schema.require(field)?;
                Ok(input_schema
                    .with_field(Field::new(alias.0.clone(), DataType::Float64, true))
                    .with_field(Field::new(alias.1.clone(), DataType::Float64, true)))
            }
            TimeUnit { field, alias, .. } => {
                input_schema.require(field)?;
                Ok(input_schema
                    .with_field(Field::new(alias.0.clone(), DataType::Timestamp, true))
                    .with_field(Field::new(alias.1.clone(), DataType::Timestamp, true)))
            }
            Window {
                group_by,
                order_by,
                functions,
                ..
            } => {
                for g in group_by {
                    input_schema.require(g)?;
                }
                for k in order_by {
                    input_schema.require(&k.field)?;
                }
                let mut out = input_schema.clone();
                for func in functions {
                    let input_type = match &func.field {
                        Some(f) => Some(input_schema.require(f)?.data_type),
                        None => None,
                    };
                    out = out.with_field(Field::new(
                        func.alias.clone(),
                        func.op.output_type(input_type),
                        true,
                    ));
                }
                Ok(out)
            }
            Fold { fields, alias, .. } => {
                let mut value_type: Option<DataType> = None;
                for f in fields {
                    let dt = input_schema.require(f)?.data_type;
                    value_type = Some(value_type.map(|v| v.unify(dt)).unwrap_or(dt));
                }
                Ok(input_schema
                    .with_field(Field::new(alias.0.clone(), DataType::Utf8, false))
                    .with_field(Field::new(
                        alias.1.clone(),
                        value_type.unwrap_or(DataType::Utf8),
                        true,
                    )))
            }
            Sort { keys, .. } => {
                for k in keys {
                    input_schema.require(&k.field)?;
                }
                Ok(input_schema)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> LogicalPlan {
        LogicalPlan::scan(
            "cars",
            Schema::new(vec![
                Field::new("origin", DataType::Utf8, false),
                Field::new("hp", DataType::Int64, true),
            ]),
        )
    }

    #[test]
    fn aggregate_schema_puts_groups_first() {
        let plan = LogicalPlan::Aggregate {
            input: Box::new(base()),
            group_by: vec!["origin".into()],
            aggs: vec![
                AggregateExpr {
                    op: AggregateOp::Count,
                    field: None,
                    alias: "count".into(),
                },
                AggregateExpr {
                    op: AggregateOp::Max,
                    field: Some("hp".into()),
                    alias: "max_hp".into(),
                },
            ],
        };
        let schema = plan.schema().unwrap();
        assert_eq!(schema.names(), vec!["origin", "count", "max_hp"]);
        assert_eq!(schema.fields[2].data_type, DataType::Int64);
        assert_eq!(plan.node_count(), 2);
        assert_eq!(plan.scan_dataset(), "cars");
    }

    #[test]
    fn missing_column_is_schema_error() {
        let plan = LogicalPlan::Sort {
            input: Box::new(base()),
            keys: vec![SortKey::asc("nope")],
        };
        assert!(matches!(plan.schema(), Err(Error::Schema(_))));
    }

    #[test]
    fn bin_resolves_like_vega() {
        let spec = BinParams::default().resolve((0.0, 9.0)).unwrap();
        assert_eq!(spec.step, 0.5);
        assert_eq!(spec.start, 0.0);
        assert_eq!(spec.stop, 9.0);
        assert_eq!(spec.bin0(9.0), 8.5);
        assert_eq!(spec.bin0(3.2), 3.0);

        let params = BinParams {
            maxbins: 10.0,
            ..BinParams::default()
        };
        let spec = params.resolve((1.3, 97.0)).unwrap();
        assert_eq!(spec.step, 10.0);
        assert_eq!(spec.start, 0.0);
        assert_eq!(spec.stop, 100.0);
    }

    #[test]
    fn bin_rejects_degenerate_parameters() {
        for base in [1.0, 0.5, -2.0, f64::INFINITY, f64::NAN] {
            let params = BinParams {
                base,
                ..BinParams::default()
            };
            assert!(matches!(params.resolve((0.0, 100.0)), Err(Error::Plan(_))));
        }
        let params = BinParams {
            maxbins: 0.0,
            ..BinParams::default()
        };
        assert!(matches!(params.resolve((0.0, 100.0)), Err(Error::Plan(_))));
        assert!(BinParams::default().validate().is_ok());
    }

    #[test]
    fn window_frame_bounds_clamp() {
        let frame = WindowFrame {
            start: Some(-1),
            end: Some(1),
        };
        assert_eq!(frame.bounds(0, 3), Some((0, 1)));
        assert_eq!(frame.bounds(2, 3), Some((1, 2)));
        assert_eq!(WindowFrame::default().bounds(2, 3), Some((0, 2)));
        let empty = WindowFrame {
            start: Some(2),
            end: Some(3),
        };
        assert_eq!(empty.bounds(2, 3), None);
    }

    #[test]
    fn output_signals_follow_plan_order() {
        let plan = LogicalPlan::Bin {
            input: Box::new(LogicalPlan::Extent {
                input: Box::new(base()),
                field: "hp".into(),
                signal: "hp_extent".into(),
            }),
            field: "hp".into(),
            params: BinParams::default(),
            extent: BinExtent::Signal("hp_extent".into()),
            alias: ("bin0".into(), "bin1".into()),
            signal: Some("hp_bins".into()),
        };
        assert_eq!(plan.output_signals(), vec!["hp_extent", "hp_bins"]);
        let names = plan.schema().unwrap();
        assert_eq!(names.names(), vec!["origin", "hp", "bin0", "bin1"]);
    }
}
