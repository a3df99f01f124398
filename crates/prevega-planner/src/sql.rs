//! SQL rendering of logical plans.
//!
//! Each plan node becomes one `SELECT` over the previous node as a derived
//! table, so the text mirrors the plan chain one-to-one. Two dialects are
//! supported: a generic ANSI-style one and Spark SQL (backtick identifiers,
//! `percentile`, explicit ordering for ranking functions).

use std::collections::HashMap;

use chrono::DateTime;

use prevega_core::config::SqlDialect;
use prevega_core::dag::{
    AggregateOp, BinExtent, LogicalPlan, SortKey, StackOffset, TimeUnitPart, WindowFrame,
    WindowFunction, WindowOp,
};
use prevega_core::error::{Error, Result};
use prevega_core::expr::{BinaryOp, Expr, Function, UnaryOp};
use prevega_core::schema::{DataType, Schema};
use prevega_core::types::{Scalar, Table, MS_PER_DAY};

/// Column used to carry the running stack total between two selects.
const STACK_TMP: &str = "__prevega_stack";

/// How a scan's dataset is spelled in SQL.
#[derive(Debug, Clone, Copy)]
pub enum ScanSource<'a> {
    /// A table the SQL engine already knows (possibly `schema.table`).
    Table(&'a str),
    /// Rows shipped with the query as a `VALUES` list.
    Inline(&'a Table),
}

pub struct SqlRenderer<'a> {
    dialect: SqlDialect,
    scans: HashMap<String, ScanSource<'a>>,
}

/// Check whether a single node (not its input) has a SQL rendering.
///
/// Both dialects currently accept the same node shapes; the dialect is part
/// of the signature because function spellings differ.
pub fn can_render(node: &LogicalPlan, _dialect: SqlDialect) -> std::result::Result<(), String> {
    match node {
        LogicalPlan::Extent { .. } => Err("extent publishes a signal, which SQL cannot".into()),
        LogicalPlan::Bin {
            extent: BinExtent::Signal(name),
            ..
        } => Err(format!("bin extent comes from signal '{}'", name)),
        LogicalPlan::Bin {
            signal: Some(name), ..
        } => Err(format!("bin publishes signal '{}'", name)),
        LogicalPlan::Stack { offset, .. } if *offset != StackOffset::Zero => {
            Err(format!("stack offset {:?} has no SQL rendering", offset))
        }
        LogicalPlan::TimeUnit {
            units, timezone, ..
        } => {
            if timezone != "UTC" {
                return Err(format!("timeunit in timezone '{}'", timezone));
            }
            trunc_unit(units)
                .map(|_| ())
                .ok_or_else(|| "timeunit units are not a contiguous truncation".to_string())
        }
        LogicalPlan::Window {
            order_by,
            frame,
            ignore_peers,
            ..
        } => {
            if !*ignore_peers && !order_by.is_empty() && peer_frame(frame).is_none() {
                Err("window frame with peers and row offsets".into())
            } else {
                Ok(())
            }
        }
        LogicalPlan::Fold { fields, .. } if fields.is_empty() => {
            Err("fold without fields".into())
        }
        _ => Ok(()),
    }
}

/// Check every node of a plan.
pub fn can_render_plan(plan: &LogicalPlan, dialect: SqlDialect) -> std::result::Result<(), String> {
    can_render(plan, dialect)?;
    match plan.input() {
        Some(input) => can_render_plan(input, dialect),
        None => Ok(()),
    }
}

impl<'a> SqlRenderer<'a> {
    pub fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            scans: HashMap::new(),
        }
    }

    pub fn with_table(mut self, dataset: impl Into<String>, table: &'a str) -> Self {
        self.scans.insert(dataset.into(), ScanSource::Table(table));
        self
    }

    pub fn with_inline(mut self, dataset: impl Into<String>, table: &'a Table) -> Self {
        self.scans.insert(dataset.into(), ScanSource::Inline(table));
        self
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Render the plan as one SQL statement.
    pub fn render(&self, plan: &LogicalPlan) -> Result<String> {
        can_render_plan(plan, self.dialect).map_err(Error::Plan)?;
        let mut counter = 0;
        self.node(plan, &mut counter)
    }

    fn node(&self, plan: &LogicalPlan, counter: &mut usize) -> Result<String> {
        let d = self.dialect;
        let input = match plan.input() {
            Some(input) => Some((input.schema()?, self.node(input, counter)?)),
            None => None,
        };
        let from = |sql: &str, counter: &mut usize| {
            let alias = format!("_t{}", *counter);
            *counter += 1;
            format!("({}) AS {}", sql, alias)
        };

        match (plan, input) {
            (LogicalPlan::Scan { dataset, schema }, _) => self.scan(dataset, schema, counter),
            (LogicalPlan::Filter { predicate, .. }, Some((schema, sql))) => Ok(format!(
                "SELECT * FROM {} WHERE {}",
                from(&sql, counter),
                predicate_sql(d, predicate, &schema)?
            )),
            (LogicalPlan::Formula { expr, alias, .. }, Some((schema, sql))) => {
                let out = plan.schema()?;
                let value = expr_sql(d, expr, &schema)?;
                let cols = select_list(d, &out, |name| (name == alias).then(|| value.clone()));
                Ok(format!("SELECT {} FROM {}", cols, from(&sql, counter)))
            }
            (LogicalPlan::Project { columns, .. }, Some((_, sql))) => {
                let cols = columns
                    .iter()
                    .map(|(src, alias)| {
                        if src == alias {
                            quote_ident(d, src)
                        } else {
                            format!("{} AS {}", quote_ident(d, src), quote_ident(d, alias))
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                Ok(format!("SELECT {} FROM {}", cols, from(&sql, counter)))
            }
            (LogicalPlan::Aggregate { group_by, aggs, .. }, Some((schema, sql))) => {
                let mut cols: Vec<String> = group_by.iter().map(|g| quote_ident(d, g)).collect();
                for agg in aggs {
                    let field_type = agg
                        .field
                        .as_ref()
                        .and_then(|f| schema.field_by_name(f))
                        .map(|f| f.data_type);
                    let f = agg.field.as_deref().map(|f| quote_ident(d, f));
                    cols.push(format!(
                        "{} AS {}",
                        aggregate_sql(d, agg.op, f.as_deref(), field_type)?,
                        quote_ident(d, &agg.alias)
                    ));
                }
                let mut out = format!("SELECT {} FROM {}", cols.join(", "), from(&sql, counter));
                if !group_by.is_empty() {
                    out.push_str(" GROUP BY ");
                    out.push_str(
                        &group_by
                            .iter()
                            .map(|g| quote_ident(d, g))
                            .collect::<Vec<_>>()
                            .join(", "),
                    );
                }
                Ok(out)
            }
            (
                LogicalPlan::Bin {
                    field,
                    params,
                    extent: BinExtent::Literal(lo, hi),
                    alias,
                    ..
                },
                Some((_, sql)),
            ) => {
                let spec = params.resolve((*lo, *hi))?;
                let f = format!("CAST({} AS DOUBLE)", quote_ident(d, field));
                let bin0 = format!(
                    "CASE WHEN {f} IS NULL THEN NULL WHEN {f} < {start} THEN {ninf} WHEN {f} > {stop} THEN {inf} \
                     ELSE {start} + {step} * FLOOR(1e-14 + (LEAST(GREATEST({f}, {start}), {last}) - {start}) / {step}) END",
                    f = f,
                    start = float_sql(spec.start),
                    stop = float_sql(spec.stop),
                    step = float_sql(spec.step),
                    last = float_sql(spec.stop - spec.step),
                    ninf = float_sql(f64::NEG_INFINITY),
                    inf = float_sql(f64::INFINITY),
                );
                let bin1 = format!("({}) + {}", bin0, float_sql(spec.step));
                let out = plan.schema()?;
                let cols = select_list(d, &out, |name| {
                    if name == alias.0 {
                        Some(bin0.clone())
                    } else if name == alias.1 {
                        Some(bin1.clone())
                    } else {
                        None
                    }
                });
                Ok(format!("SELECT {} FROM {}", cols, from(&sql, counter)))
            }
            (
                LogicalPlan::TimeUnit {
                    field,
                    units,
                    alias,
                    ..
                },
                Some((schema, sql)),
            ) => {
                let (unit, amount, interval_unit) = trunc_unit(units)
                    .ok_or_else(|| Error::Plan("timeunit has no SQL truncation".into()))?;
                let source = schema.require(field)?.data_type;
                let ts = if source.is_numeric() {
                    match d {
                        SqlDialect::Generic => format!("to_timestamp_millis({})", quote_ident(d, field)),
                        SqlDialect::Spark => format!("timestamp_millis({})", quote_ident(d, field)),
                    }
                } else {
                    format!("CAST({} AS TIMESTAMP)", quote_ident(d, field))
                };
                let unit0 = format!("DATE_TRUNC('{}', {})", unit, ts);
                let unit1 = match d {
                    SqlDialect::Generic => {
                        format!("{} + INTERVAL '{} {}'", unit0, amount, interval_unit)
                    }
                    SqlDialect::Spark => format!(
                        "{} + INTERVAL {} {}",
                        unit0,
                        amount,
                        interval_unit.to_ascii_uppercase()
                    ),
                };
                let out = plan.schema()?;
                let cols = select_list(d, &out, |name| {
                    if name == alias.0 {
                        Some(unit0.clone())
                    } else if name == alias.1 {
                        Some(unit1.clone())
                    } else {
                        None
                    }
                });
                Ok(format!("SELECT {} FROM {}", cols, from(&sql, counter)))
            }
            (
                LogicalPlan::Window {
                    group_by,
                    order_by,
                    frame,
                    ignore_peers,
                    functions,
                    ..
                },
                Some((schema, sql)),
            ) => {
                let out = plan.schema()?;
                let rendered = functions
                    .iter()
                    .map(|func| {
                        window_sql(d, func, group_by, order_by, frame, *ignore_peers, &schema)
                            .map(|s| (func.alias.clone(), s))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let cols = select_list(d, &out, |name| {
                    rendered
                        .iter()
                        .rev()
                        .find(|(alias, _)| alias == name)
                        .map(|(_, s)| s.clone())
                });
                Ok(format!("SELECT {} FROM {}", cols, from(&sql, counter)))
            }
            (
                LogicalPlan::Stack {
                    field,
                    group_by,
                    order_by,
                    alias,
                    ..
                },
                Some((_, sql)),
            ) => {
                let value = format!("COALESCE(CAST({} AS DOUBLE), 0)", quote_ident(d, field));
                let mut partition: Vec<String> =
                    group_by.iter().map(|g| quote_ident(d, g)).collect();
                partition.push(format!(
                    "CASE WHEN {} < 0 THEN 1 ELSE 0 END",
                    quote_ident(d, field)
                ));
                let mut over = vec![format!("PARTITION BY {}", partition.join(", "))];
                let order = order_clause(d, order_by, true);
                if !order.is_empty() {
                    over.push(order);
                }
                over.push("ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW".to_string());
                let running = format!("SUM({}) OVER ({})", value, over.join(" "));
                let inner = format!(
                    "SELECT *, {} AS {} FROM {}",
                    running,
                    quote_ident(d, STACK_TMP),
                    from(&sql, counter)
                );
                let tmp = quote_ident(d, STACK_TMP);
                let out = plan.schema()?;
                let cols = select_list(d, &out, |name| {
                    if name == alias.0 {
                        Some(format!("{} - {}", tmp, value))
                    } else if name == alias.1 {
                        Some(tmp.clone())
                    } else {
                        None
                    }
                });
                Ok(format!("SELECT {} FROM {}", cols, from(&inner, counter)))
            }
            (LogicalPlan::Fold { fields, alias, .. }, Some((_, sql))) => {
                let out = plan.schema()?;
                let value_type = out.require(&alias.1)?.data_type;
                let source = from(&sql, counter);
                let branches = fields
                    .iter()
                    .map(|f| {
                        let key = string_literal(d, f);
                        let value = format!("CAST({} AS {})", quote_ident(d, f), sql_type(d, value_type));
                        let cols = select_list(d, &out, |name| {
                            if name == alias.0 {
                                Some(key.clone())
                            } else if name == alias.1 {
                                Some(value.clone())
                            } else {
                                None
                            }
                        });
                        format!("SELECT {} FROM {}", cols, source)
                    })
                    .collect::<Vec<_>>();
                if branches.is_empty() {
                    return Err(Error::Plan("fold without fields".into()));
                }
                Ok(branches.join(" UNION ALL "))
            }
            (LogicalPlan::Sort { keys, .. }, Some((_, sql))) => {
                let source = from(&sql, counter);
                if keys.is_empty() {
                    return Ok(format!("SELECT * FROM {}", source));
                }
                Ok(format!("SELECT * FROM {} {}", source, order_clause(d, keys, false)))
            }
            (node, _) => Err(Error::Plan(format!(
                "no SQL rendering for {} node",
                node.kind_name()
            ))),
        }
    }

    fn scan(&self, dataset: &str, schema: &Schema, counter: &mut usize) -> Result<String> {
        let d = self.dialect;
        let cols = schema
            .fields
            .iter()
            .map(|f| quote_ident(d, &f.name))
            .collect::<Vec<_>>()
            .join(", ");
        match self.scans.get(dataset) {
            Some(ScanSource::Inline(table)) => {
                if table.num_rows() == 0 {
                    let nulls = schema
                        .fields
                        .iter()
                        .map(|f| {
                            format!(
                                "CAST(NULL AS {}) AS {}",
                                sql_type(d, f.data_type),
                                quote_ident(d, &f.name)
                            )
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    return Ok(format!("SELECT {} WHERE 1 = 0", nulls));
                }
                let rows = (0..table.num_rows())
                    .map(|i| {
                        let values = schema
                            .fields
                            .iter()
                            .map(|f| {
                                let v = table
                                    .column(&f.name)
                                    .map(|c| c.values[i].clone())
                                    .unwrap_or(Scalar::Null);
                                if v.is_null() {
                                    format!("CAST(NULL AS {})", sql_type(d, f.data_type))
                                } else {
                                    scalar_sql(d, &v)
                                }
                            })
                            .collect::<Vec<_>>();
                        format!("({})", values.join(", "))
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let alias = format!("_t{}", *counter);
                *counter += 1;
                Ok(format!(
                    "SELECT {} FROM (VALUES {}) AS {}({})",
                    cols, rows, alias, cols
                ))
            }
            Some(ScanSource::Table(name)) => {
                Ok(format!("SELECT {} FROM {}", cols, quote_table(d, name)))
            }
            None => Ok(format!("SELECT {} FROM {}", cols, quote_ident(d, dataset))),
        }
    }
}

/// Select every output column, substituting computed expressions.
fn select_list(d: SqlDialect, out: &Schema, computed: impl Fn(&str) -> Option<String>) -> String {
    out.fields
        .iter()
        .map(|f| match computed(&f.name) {
            Some(expr) => format!("{} AS {}", expr, quote_ident(d, &f.name)),
            None => quote_ident(d, &f.name),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn quote_ident(d: SqlDialect, name: &str) -> String {
    match d {
        SqlDialect::Generic => format!("\"{}\"", name.replace('"', "\"\"")),
        SqlDialect::Spark => format!("`{}`", name.replace('`', "``")),
    }
}

fn quote_table(d: SqlDialect, name: &str) -> String {
    name.split('.')
        .map(|part| quote_ident(d, part))
        .collect::<Vec<_>>()
        .join(".")
}

fn string_literal(d: SqlDialect, s: &str) -> String {
    match d {
        SqlDialect::Generic => format!("'{}'", s.replace('\'', "''")),
        SqlDialect::Spark => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
    }
}

pub fn sql_type(d: SqlDialect, dt: DataType) -> &'static str {
    match dt {
        DataType::Boolean => "BOOLEAN",
        DataType::Int8 => "TINYINT",
        DataType::Int16 => "SMALLINT",
        DataType::Int32 => "INT",
        DataType::Int64 => "BIGINT",
        DataType::Float32 => "FLOAT",
        DataType::Float64 => "DOUBLE",
        DataType::Utf8 => match d {
            SqlDialect::Generic => "VARCHAR",
            SqlDialect::Spark => "STRING",
        },
        DataType::Date32 => "DATE",
        DataType::Timestamp => "TIMESTAMP",
    }
}

fn float_sql(f: f64) -> String {
    if f.is_nan() {
        "CAST('NaN' AS DOUBLE)".to_string()
    } else if f.is_infinite() {
        if f > 0.0 {
            "CAST('Infinity' AS DOUBLE)".to_string()
        } else {
            "CAST('-Infinity' AS DOUBLE)".to_string()
        }
    } else {
        format!("{:?}", f)
    }
}

fn scalar_sql(d: SqlDialect, v: &Scalar) -> String {
    match v {
        Scalar::Null => "NULL".to_string(),
        Scalar::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Scalar::I64(i) => i.to_string(),
        Scalar::F64(f) => float_sql(*f),
        Scalar::Str(s) => string_literal(d, s),
        Scalar::Date32(days) => {
            match DateTime::from_timestamp(*days as i64 * (MS_PER_DAY / 1000), 0) {
                Some(dt) => format!("DATE '{}'", dt.format("%Y-%m-%d")),
                None => "NULL".to_string(),
            }
        }
        Scalar::Timestamp(ms) => match DateTime::from_timestamp_millis(*ms) {
            Some(dt) => format!("TIMESTAMP '{}'", dt.format("%Y-%m-%d %H:%M:%S%.3f")),
            None => "NULL".to_string(),
        },
    }
}

fn order_clause(d: SqlDialect, keys: &[SortKey], window: bool) -> String {
    if keys.is_empty() {
        return match (d, window) {
            (SqlDialect::Spark, true) => "ORDER BY monotonically_increasing_id()".to_string(),
            _ => String::new(),
        };
    }
    let keys = keys
        .iter()
        .map(|k| {
            format!(
                "{} {}",
                quote_ident(d, &k.field),
                if k.descending {
                    "DESC NULLS LAST"
                } else {
                    "ASC NULLS FIRST"
                }
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("ORDER BY {}", keys)
}

/// `(sql unit, interval amount, interval unit)` for a contiguous truncation.
fn trunc_unit(units: &[TimeUnitPart]) -> Option<(&'static str, u32, &'static str)> {
    use TimeUnitPart::*;
    const CHAIN: [TimeUnitPart; 7] = [Year, Month, Date, Hours, Minutes, Seconds, Milliseconds];
    if units == [Year, Quarter] {
        return Some(("quarter", 3, "month"));
    }
    if units.is_empty() || units.len() > CHAIN.len() || units != &CHAIN[..units.len()] {
        return None;
    }
    Some(match units.last()? {
        Year => ("year", 1, "year"),
        Month => ("month", 1, "month"),
        Date => ("day", 1, "day"),
        Hours => ("hour", 1, "hour"),
        Minutes => ("minute", 1, "minute"),
        Seconds => ("second", 1, "second"),
        _ => ("millisecond", 1, "millisecond"),
    })
}

/// Frame bounds when peers must be honored; only unbounded/current-row
/// bounds map onto a `RANGE` frame.
fn peer_frame(frame: &WindowFrame) -> Option<(&'static str, &'static str)> {
    let start = match frame.start {
        None => "UNBOUNDED PRECEDING",
        Some(0) => "CURRENT ROW",
        Some(_) => return None,
    };
    let end = match frame.end {
        None => "UNBOUNDED FOLLOWING",
        Some(0) => "CURRENT ROW",
        Some(_) => return None,
    };
    Some((start, end))
}

fn row_bound(b: Option<i64>, unbounded: &str) -> String {
    match b {
        None => unbounded.to_string(),
        Some(0) => "CURRENT ROW".to_string(),
        Some(n) if n < 0 => format!("{} PRECEDING", -n),
        Some(n) => format!("{} FOLLOWING", n),
    }
}

fn window_sql(
    d: SqlDialect,
    func: &WindowFunction,
    group_by: &[String],
    order_by: &[SortKey],
    frame: &WindowFrame,
    ignore_peers: bool,
    schema: &Schema,
) -> Result<String> {
    let mut over = Vec::new();
    if !group_by.is_empty() {
        over.push(format!(
            "PARTITION BY {}",
            group_by
                .iter()
                .map(|g| quote_ident(d, g))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    let order = order_clause(d, order_by, true);
    if !order.is_empty() {
        over.push(order);
    }
    let plain_over = format!("OVER ({})", over.join(" "));
    let frame_sql = if !ignore_peers && !order_by.is_empty() {
        let (start, end) = peer_frame(frame)
            .ok_or_else(|| Error::Plan("window frame with peers has no SQL rendering".into()))?;
        format!("RANGE BETWEEN {} AND {}", start, end)
    } else {
        format!(
            "ROWS BETWEEN {} AND {}",
            row_bound(frame.start, "UNBOUNDED PRECEDING"),
            row_bound(frame.end, "UNBOUNDED FOLLOWING")
        )
    };
    over.push(frame_sql);
    let framed_over = format!("OVER ({})", over.join(" "));
    let field = || -> Result<String> {
        let f = func
            .field
            .as_ref()
            .ok_or_else(|| Error::Plan(format!("window op {} needs a field", func.op.name())))?;
        schema.require(f)?;
        Ok(quote_ident(d, f))
    };
    Ok(match func.op {
        WindowOp::RowNumber => format!("ROW_NUMBER() {}", plain_over),
        // Without an order every row is its own peer group.
        WindowOp::Rank | WindowOp::DenseRank if order_by.is_empty() => {
            format!("ROW_NUMBER() {}", plain_over)
        }
        WindowOp::Rank => format!("RANK() {}", plain_over),
        WindowOp::DenseRank => format!("DENSE_RANK() {}", plain_over),
        WindowOp::Lag => {
            let offset = func.param.unwrap_or(1);
            format!("LAG({}, {}) {}", field()?, offset, plain_over)
        }
        WindowOp::Lead => {
            let offset = func.param.unwrap_or(1);
            format!("LEAD({}, {}) {}", field()?, offset, plain_over)
        }
        WindowOp::FirstValue => format!("FIRST_VALUE({}) {}", field()?, framed_over),
        WindowOp::LastValue => format!("LAST_VALUE({}) {}", field()?, framed_over),
        WindowOp::Count => format!("COUNT(*) {}", framed_over),
        WindowOp::Sum => format!("COALESCE(SUM({}) {}, 0)", field()?, framed_over),
        WindowOp::Mean => format!("AVG({}) {}", field()?, framed_over),
        WindowOp::Min => format!("MIN({}) {}", field()?, framed_over),
        WindowOp::Max => format!("MAX({}) {}", field()?, framed_over),
    })
}

fn aggregate_sql(
    d: SqlDialect,
    op: AggregateOp,
    field: Option<&str>,
    field_type: Option<DataType>,
) -> Result<String> {
    let f = match (op, field) {
        (AggregateOp::Count, _) => return Ok("COUNT(*)".to_string()),
        (_, Some(f)) => f,
        (_, None) => {
            return Err(Error::Plan(format!(
                "aggregate op {} needs a field",
                op.name()
            )))
        }
    };
    let is_float = matches!(field_type, Some(DataType::Float32 | DataType::Float64));
    Ok(match op {
        AggregateOp::Count => "COUNT(*)".to_string(),
        AggregateOp::Valid if is_float => {
            format!("SUM(CASE WHEN {f} IS NOT NULL AND NOT isnan({f}) THEN 1 ELSE 0 END)")
        }
        AggregateOp::Valid => format!("COUNT({})", f),
        AggregateOp::Missing => format!("SUM(CASE WHEN {} IS NULL THEN 1 ELSE 0 END)", f),
        AggregateOp::Distinct => format!(
            "COUNT(DISTINCT {f}) + MAX(CASE WHEN {f} IS NULL THEN 1 ELSE 0 END)"
        ),
        AggregateOp::Sum => format!("COALESCE(SUM({}), 0)", f),
        AggregateOp::Mean => format!("AVG({})", f),
        AggregateOp::Min => format!("MIN({})", f),
        AggregateOp::Max => format!("MAX({})", f),
        AggregateOp::Variance => format!("VAR_SAMP({})", f),
        AggregateOp::Stdev => format!("STDDEV_SAMP({})", f),
        AggregateOp::Median => match d {
            SqlDialect::Generic => format!("PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY {})", f),
            SqlDialect::Spark => format!("percentile({}, 0.5)", f),
        },
    })
}

/// Render an expression used as a condition, applying truthiness to
/// non-boolean values.
pub fn predicate_sql(d: SqlDialect, expr: &Expr, schema: &Schema) -> Result<String> {
    let rendered = expr_sql(d, expr, schema)?;
    Ok(match expr.data_type(schema)? {
        DataType::Boolean => format!("COALESCE({}, FALSE)", rendered),
        DataType::Utf8 => format!("({r} IS NOT NULL AND {r} <> '')", r = rendered),
        dt if dt.is_numeric() => format!("({r} IS NOT NULL AND {r} <> 0)", r = rendered),
        _ => format!("({} IS NOT NULL)", rendered),
    })
}

/// Render a bound expression as SQL.
pub fn expr_sql(d: SqlDialect, expr: &Expr, schema: &Schema) -> Result<String> {
    Ok(match expr {
        Expr::Literal(s) => scalar_sql(d, s),
        Expr::Field(f) => {
            schema.require(f)?;
            quote_ident(d, f)
        }
        Expr::Signal { name, .. } => {
            return Err(Error::Expression(format!(
                "signal '{}' must be bound before rendering SQL",
                name
            )))
        }
        Expr::Unary { op, expr: inner } => match op {
            UnaryOp::Not => format!("(NOT {})", predicate_sql(d, inner, schema)?),
            UnaryOp::Neg => format!("(-CAST({} AS DOUBLE))", expr_sql(d, inner, schema)?),
            UnaryOp::Plus => format!("CAST({} AS DOUBLE)", expr_sql(d, inner, schema)?),
        },
        Expr::Binary {
            op: op @ (BinaryOp::And | BinaryOp::Or),
            left,
            right,
        } => format!(
            "({} {} {})",
            predicate_sql(d, left, schema)?,
            if *op == BinaryOp::And { "AND" } else { "OR" },
            predicate_sql(d, right, schema)?
        ),
        Expr::Binary { op, left, right } => {
            let l = expr_sql(d, left, schema)?;
            let r = expr_sql(d, right, schema)?;
            match op {
                BinaryOp::Add
                    if left.data_type(schema)? == DataType::Utf8
                        || right.data_type(schema)? == DataType::Utf8 =>
                {
                    let string = sql_type(d, DataType::Utf8);
                    format!("CONCAT(CAST({} AS {s}), CAST({} AS {s}))", l, r, s = string)
                }
                BinaryOp::Add => format!("({} + {})", l, r),
                BinaryOp::Sub => format!("({} - {})", l, r),
                BinaryOp::Mul => format!("({} * {})", l, r),
                BinaryOp::Div => format!("(CAST({} AS DOUBLE) / {})", l, r),
                BinaryOp::Mod => format!("({} % {})", l, r),
                BinaryOp::Eq | BinaryOp::StrictEq => format!("({} = {})", l, r),
                BinaryOp::NotEq | BinaryOp::StrictNotEq => format!("({} <> {})", l, r),
                BinaryOp::Lt => format!("({} < {})", l, r),
                BinaryOp::LtEq => format!("({} <= {})", l, r),
                BinaryOp::Gt => format!("({} > {})", l, r),
                BinaryOp::GtEq => format!("({} >= {})", l, r),
                BinaryOp::And => format!("({} AND {})", l, r),
                BinaryOp::Or => format!("({} OR {})", l, r),
            }
        }
        Expr::Conditional {
            test,
            then,
            otherwise,
        } => format!(
            "CASE WHEN {} THEN {} ELSE {} END",
            predicate_sql(d, test, schema)?,
            expr_sql(d, then, schema)?,
            expr_sql(d, otherwise, schema)?
        ),
        Expr::Call { func, args } => {
            let a = args
                .iter()
                .map(|e| expr_sql(d, e, schema))
                .collect::<Result<Vec<_>>>()?;
            let arg_type = |i: usize| args[i].data_type(schema);
            match func {
                Function::If => format!(
                    "CASE WHEN {} THEN {} ELSE {} END",
                    predicate_sql(d, &args[0], schema)?,
                    a[1],
                    a[2]
                ),
                Function::IsValid => {
                    if matches!(arg_type(0)?, DataType::Float32 | DataType::Float64) {
                        format!("({x} IS NOT NULL AND NOT isnan({x}))", x = a[0])
                    } else {
                        format!("({} IS NOT NULL)", a[0])
                    }
                }
                Function::IsNaN => format!("COALESCE(isnan(CAST({} AS DOUBLE)), FALSE)", a[0]),
                Function::IsFinite => format!(
                    "({x} IS NOT NULL AND NOT isnan(CAST({x} AS DOUBLE)) AND abs(CAST({x} AS DOUBLE)) <> {inf})",
                    x = a[0],
                    inf = float_sql(f64::INFINITY)
                ),
                Function::Abs => format!("abs({})", a[0]),
                Function::Ceil => format!("ceil({})", a[0]),
                Function::Floor => format!("floor({})", a[0]),
                Function::Round => format!("floor({} + 0.5)", a[0]),
                Function::Sqrt => format!("sqrt({})", a[0]),
                Function::Log => format!("ln({})", a[0]),
                Function::Exp => format!("exp({})", a[0]),
                Function::Pow => format!("power({}, {})", a[0], a[1]),
                Function::Min => format!("least({})", a.join(", ")),
                Function::Max => format!("greatest({})", a.join(", ")),
                Function::Lower => format!("lower({})", a[0]),
                Function::Upper => format!("upper({})", a[0]),
                Function::Length => format!(
                    "char_length(CAST({} AS {}))",
                    a[0],
                    sql_type(d, DataType::Utf8)
                ),
                Function::ToNumber => format!("CAST({} AS DOUBLE)", a[0]),
                Function::ToString => format!("CAST({} AS {})", a[0], sql_type(d, DataType::Utf8)),
                Function::ToBoolean => format!("CAST({} AS BOOLEAN)", a[0]),
            }
        }
    })
}
