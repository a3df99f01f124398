//! Transform list → `LogicalPlan`.
//!
//! The builder folds transforms onto a plan one at a time, threading the
//! evolving schema. Folding stops at the first transform it cannot lower;
//! that transform and everything after it stay with the client.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::debug;

use prevega_core::dag::{
    AggregateExpr, AggregateOp, BinExtent, BinParams, LogicalPlan, SortKey, StackOffset,
    TimeUnitPart, WindowFrame, WindowFunction, WindowOp,
};
use prevega_core::expr::Expr;
use prevega_core::schema::Schema;
use prevega_core::warning::WarningKind;

use crate::capabilities::Capabilities;
use crate::signals::{SignalScope, SignalValue};
use crate::sql;
use crate::transform::{
    field_name, AggregateTransform, BinTransform, Compare, Param, StackTransform, TimeUnitTransform,
    Transform, TransformSpec, WindowTransform,
};

/// Why folding stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct StopReason {
    /// Index of the first transform left unevaluated.
    pub index: usize,
    /// Its `type` string.
    pub kind: String,
    pub warning_kind: WarningKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltPlan {
    pub plan: LogicalPlan,
    /// Number of transforms folded into `plan`.
    pub folded: usize,
    pub stop: Option<StopReason>,
}

impl BuiltPlan {
    pub fn is_complete(&self) -> bool {
        self.stop.is_none()
    }
}

struct Refusal {
    kind: WarningKind,
    message: String,
}

impl Refusal {
    fn unsupported(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::UnsupportedTransform,
            message: message.into(),
        }
    }

    fn missing_column(name: &str) -> Self {
        Self {
            kind: WarningKind::SchemaMismatch,
            message: format!("column '{}' is not in the input schema", name),
        }
    }
}

type Lowered = std::result::Result<LogicalPlan, Refusal>;

pub struct PlanBuilder<'a> {
    capabilities: &'a Capabilities,
    signals: &'a SignalScope,
    local_timezone: String,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(capabilities: &'a Capabilities, signals: &'a SignalScope) -> Self {
        Self {
            capabilities,
            signals,
            local_timezone: "UTC".to_string(),
        }
    }

    /// Timezone used for `timeunit` transforms without an explicit `utc` zone.
    pub fn with_local_timezone(mut self, tz: impl Into<String>) -> Self {
        self.local_timezone = tz.into();
        self
    }

    /// Fold `transforms` onto `input`.
    pub fn build(&self, transforms: &[TransformSpec], input: LogicalPlan) -> BuiltPlan {
        let mut published: BTreeSet<String> = input.output_signals().into_iter().collect();
        let mut plan = input;
        let mut schema = match plan.schema() {
            Ok(s) => s,
            Err(e) => {
                return BuiltPlan {
                    plan,
                    folded: 0,
                    stop: transforms.first().map(|t| StopReason {
                        index: 0,
                        kind: t.kind_name().to_string(),
                        warning_kind: WarningKind::SchemaMismatch,
                        message: e.to_string(),
                    }),
                }
            }
        };

        for (index, t) in transforms.iter().enumerate() {
            let next = self
                .lower(&t.parsed, &plan, &schema, &published)
                .and_then(|node| self.check_node(node));
            match next {
                Ok(node) => {
                    published.extend(node.output_signals());
                    schema = match node.schema() {
                        Ok(s) => s,
                        Err(e) => {
                            return self.stopped(plan, index, t, Refusal::unsupported(e.to_string()))
                        }
                    };
                    plan = node;
                }
                Err(refusal) => return self.stopped(plan, index, t, refusal),
            }
        }
        debug!(
            dataset = plan.scan_dataset(),
            folded = transforms.len(),
            nodes = plan.node_count(),
            "built complete plan"
        );
        BuiltPlan {
            plan,
            folded: transforms.len(),
            stop: None,
        }
    }

    fn stopped(
        &self,
        plan: LogicalPlan,
        index: usize,
        t: &TransformSpec,
        refusal: Refusal,
    ) -> BuiltPlan {
        debug!(
            dataset = plan.scan_dataset(),
            folded = index,
            kind = t.kind_name(),
            reason = %refusal.message,
            "stopped folding"
        );
        BuiltPlan {
            plan,
            folded: index,
            stop: Some(StopReason {
                index,
                kind: t.kind_name().to_string(),
                warning_kind: refusal.kind,
                message: refusal.message,
            }),
        }
    }

    /// Capability checks that only make sense on the finished node.
    fn check_node(&self, node: LogicalPlan) -> Lowered {
        let inherited = node.input().map(|i| i.output_signals().len()).unwrap_or(0);
        let own_signals = node.output_signals().len() > inherited;
        if own_signals && !self.capabilities.signals {
            return Err(Refusal::unsupported(format!(
                "{} publishes a signal and the executor does not report signals",
                node.kind_name()
            )));
        }
        if let Some(dialect) = self.capabilities.sql {
            sql::can_render(&node, dialect).map_err(Refusal::unsupported)?;
        }
        Ok(node)
    }

    fn lower(
        &self,
        t: &Transform,
        plan: &LogicalPlan,
        schema: &Schema,
        published: &BTreeSet<String>,
    ) -> Lowered {
        if let Transform::Unsupported { kind, reason } = t {
            return Err(Refusal::unsupported(format!("{}: {}", kind, reason)));
        }
        if let Some(kind) = t.kind() {
            if !self.capabilities.supports(kind) {
                return Err(Refusal::unsupported(format!(
                    "{} is outside the executor's capabilities",
                    kind
                )));
            }
        }
        let input = Box::new(plan.clone());

        match t {
            Transform::Filter(f) => {
                let predicate = self.bind_expr(&f.expr, schema)?;
                Ok(LogicalPlan::Filter { input, predicate })
            }
            Transform::Formula(f) => {
                let expr = self.bind_expr(&f.expr, schema)?;
                Ok(LogicalPlan::Formula {
                    input,
                    expr,
                    alias: f.alias.clone(),
                })
            }
            Transform::Project(p) => {
                let columns = p
                    .fields
                    .iter()
                    .enumerate()
                    .map(|(i, f)| {
                        let src = column(f, schema)?;
                        let alias = p
                            .alias
                            .get(i)
                            .cloned()
                            .flatten()
                            .unwrap_or_else(|| src.clone());
                        Ok((src, alias))
                    })
                    .collect::<std::result::Result<Vec<_>, Refusal>>()?;
                Ok(LogicalPlan::Project { input, columns })
            }
            Transform::Aggregate(a) => self.aggregate(a, input, schema),
            Transform::Extent(e) => {
                let field = column(&e.field, schema)?;
                match &e.signal {
                    Some(signal) => Ok(LogicalPlan::Extent {
                        input,
                        field,
                        signal: signal.clone(),
                    }),
                    None => Ok(*input),
                }
            }
            Transform::Bin(b) => self.bin(b, input, schema, published),
            Transform::TimeUnit(tu) => self.timeunit(tu, input, schema),
            Transform::Window(w) => self.window(w, input, schema),
            Transform::Stack(s) => self.stack(s, input, schema),
            Transform::Fold(f) => {
                let fields = f
                    .fields
                    .iter()
                    .map(|name| column(name, schema))
                    .collect::<std::result::Result<Vec<_>, Refusal>>()?;
                if fields.is_empty() {
                    return Err(Refusal::unsupported("fold without fields"));
                }
                Ok(LogicalPlan::Fold {
                    input,
                    fields,
                    alias: pair(&f.alias, ("key", "value"))?,
                })
            }
            Transform::Collect(c) => match &c.sort {
                Some(cmp) => Ok(LogicalPlan::Sort {
                    input,
                    keys: sort_keys(cmp, schema)?,
                }),
                None => Ok(*input),
            },
            Transform::Unsupported { kind, reason } => {
                Err(Refusal::unsupported(format!("{}: {}", kind, reason)))
            }
        }
    }

    fn aggregate(
        &self,
        a: &AggregateTransform,
        input: Box<LogicalPlan>,
        schema: &Schema,
    ) -> Lowered {
        if a.cross == Some(true) {
            return Err(Refusal::unsupported("aggregate with cross: true"));
        }
        if a.drop == Some(false) {
            return Err(Refusal::unsupported("aggregate with drop: false"));
        }
        let group_by = a
            .groupby
            .iter()
            .map(|g| column(g, schema))
            .collect::<std::result::Result<Vec<_>, Refusal>>()?;

        let n = a.ops.len().max(a.fields.len()).max(1);
        let mut aggs = Vec::with_capacity(n);
        for i in 0..n {
            let op_name = a.ops.get(i).map(String::as_str).unwrap_or("count");
            let op = AggregateOp::parse(op_name).ok_or_else(|| {
                Refusal::unsupported(format!("aggregate op '{}' has no relational form", op_name))
            })?;
            let field = match a.fields.get(i).cloned().flatten() {
                Some(f) => Some(column(&f, schema)?),
                None => None,
            };
            if field.is_none() && op != AggregateOp::Count {
                return Err(Refusal::unsupported(format!(
                    "aggregate op '{}' needs a field",
                    op_name
                )));
            }
            let alias = match a.alias.get(i).cloned().flatten() {
                Some(alias) => alias,
                None => match &field {
                    Some(f) => format!("{}_{}", op.name(), f),
                    None => op.name().to_string(),
                },
            };
            aggs.push(AggregateExpr { op, field, alias });
        }
        Ok(LogicalPlan::Aggregate {
            input,
            group_by,
            aggs,
        })
    }

    fn bin(
        &self,
        b: &BinTransform,
        input: Box<LogicalPlan>,
        schema: &Schema,
        published: &BTreeSet<String>,
    ) -> Lowered {
        if b.interval == Some(false) {
            return Err(Refusal::unsupported("bin with interval: false"));
        }
        let field = column(&b.field, schema)?;
        let numeric = schema
            .field_by_name(&field)
            .map(|f| f.data_type.is_numeric())
            .unwrap_or(false);
        if !numeric {
            return Err(Refusal::unsupported(format!("bin field '{}' is not numeric", field)));
        }
        let defaults = BinParams::default();
        let params = BinParams {
            maxbins: self.number(&b.maxbins, defaults.maxbins)?,
            base: self.number(&b.base, defaults.base)?,
            step: self.optional_number(&b.step)?,
            steps: b.steps.clone(),
            minstep: self.number(&b.minstep, defaults.minstep)?,
            divide: b.divide.clone().unwrap_or(defaults.divide),
            nice: match &b.nice {
                None => defaults.nice,
                Some(Param::Value(v)) => *v,
                Some(Param::Signal { signal }) => match self.signal_json(signal)? {
                    Value::Bool(v) => v,
                    other => {
                        return Err(Refusal::unsupported(format!(
                            "bin nice signal resolved to {}",
                            other
                        )))
                    }
                },
            },
            span: self.optional_number(&b.span)?,
        };

        params
            .validate()
            .map_err(|e| Refusal::unsupported(e.to_string()))?;

        let extent = match &b.extent {
            Param::Value(v) => literal_extent(v)?,
            Param::Signal { signal } if published.contains(signal.trim()) => {
                BinExtent::Signal(signal.trim().to_string())
            }
            Param::Signal { signal } => match self.signal_json(signal)? {
                Value::Array(items) => {
                    let nums = items.iter().filter_map(Value::as_f64).collect::<Vec<_>>();
                    if nums.len() != items.len() {
                        return Err(Refusal::unsupported("bin extent signal is not numeric"));
                    }
                    literal_extent(&nums)?
                }
                other => {
                    return Err(Refusal::unsupported(format!(
                        "bin extent signal resolved to {}",
                        other
                    )))
                }
            },
        };
        if let BinExtent::Literal(lo, hi) = extent {
            params
                .resolve((lo, hi))
                .map_err(|e| Refusal::unsupported(e.to_string()))?;
        }

        let alias = match &b.alias {
            None => ("bin0".to_string(), "bin1".to_string()),
            Some(names) => match names.as_slice() {
                [a, b] => (a.clone(), b.clone()),
                _ => return Err(Refusal::unsupported("bin 'as' must name two columns")),
            },
        };
        Ok(LogicalPlan::Bin {
            input,
            field,
            params,
            extent,
            alias,
            signal: b.signal.clone(),
        })
    }

    fn timeunit(
        &self,
        tu: &TimeUnitTransform,
        input: Box<LogicalPlan>,
        schema: &Schema,
    ) -> Lowered {
        let field = column(&tu.field, schema)?;
        let names = tu
            .units
            .as_ref()
            .ok_or_else(|| Refusal::unsupported("timeunit without explicit units"))?;
        let mut units = names
            .iter()
            .map(|u| {
                TimeUnitPart::parse(u)
                    .ok_or_else(|| Refusal::unsupported(format!("unknown time unit '{}'", u)))
            })
            .collect::<std::result::Result<Vec<_>, Refusal>>()?;
        units.sort();
        units.dedup();
        if units.is_empty() {
            return Err(Refusal::unsupported("timeunit with empty units"));
        }
        if tu.step.map(|s| s != 1.0).unwrap_or(false) {
            return Err(Refusal::unsupported("timeunit step other than 1"));
        }
        if tu.interval == Some(false) {
            return Err(Refusal::unsupported("timeunit with interval: false"));
        }
        let timezone = match tu.timezone.as_deref() {
            Some("utc") => "UTC".to_string(),
            None | Some("local") => self.local_timezone.clone(),
            Some(other) => {
                return Err(Refusal::unsupported(format!("unknown timezone '{}'", other)))
            }
        };
        Ok(LogicalPlan::TimeUnit {
            input,
            field,
            units,
            timezone,
            alias: pair(&tu.alias, ("unit0", "unit1"))?,
        })
    }

    fn window(&self, w: &WindowTransform, input: Box<LogicalPlan>, schema: &Schema) -> Lowered {
        let group_by = w
            .groupby
            .iter()
            .map(|g| column(g, schema))
            .collect::<std::result::Result<Vec<_>, Refusal>>()?;
        let order_by = match &w.sort {
            Some(cmp) => sort_keys(cmp, schema)?,
            None => Vec::new(),
        };
        let mut functions = Vec::with_capacity(w.ops.len());
        for (i, op_name) in w.ops.iter().enumerate() {
            let op = WindowOp::parse(op_name).ok_or_else(|| {
                Refusal::unsupported(format!("window op '{}' has no relational form", op_name))
            })?;
            let field = match w.fields.get(i).cloned().flatten() {
                Some(f) => Some(column(&f, schema)?),
                None => None,
            };
            if op.needs_field() && field.is_none() {
                return Err(Refusal::unsupported(format!(
                    "window op '{}' needs a field",
                    op_name
                )));
            }
            let alias = match w.alias.get(i).cloned().flatten() {
                Some(alias) => alias,
                None => match &field {
                    Some(f) => format!("{}_{}", op.name(), f),
                    None => op.name().to_string(),
                },
            };
            functions.push(WindowFunction {
                op,
                field,
                param: w.params.get(i).copied().flatten().map(|p| p as i64),
                alias,
            });
        }
        if functions.is_empty() {
            return Err(Refusal::unsupported("window without ops"));
        }
        let frame = match w.frame {
            Some([start, end]) => WindowFrame { start, end },
            None => WindowFrame::default(),
        };
        Ok(LogicalPlan::Window {
            input,
            group_by,
            order_by,
            frame,
            ignore_peers: w.ignore_peers.unwrap_or(false),
            functions,
        })
    }

    fn stack(&self, s: &StackTransform, input: Box<LogicalPlan>, schema: &Schema) -> Lowered {
        let field = column(&s.field, schema)?;
        let group_by = s
            .groupby
            .iter()
            .map(|g| column(g, schema))
            .collect::<std::result::Result<Vec<_>, Refusal>>()?;
        let order_by = match &s.sort {
            Some(cmp) => sort_keys(cmp, schema)?,
            None => Vec::new(),
        };
        let offset = match s.offset.as_deref() {
            None => StackOffset::Zero,
            Some(o) => StackOffset::parse(o)
                .ok_or_else(|| Refusal::unsupported(format!("unknown stack offset '{}'", o)))?,
        };
        Ok(LogicalPlan::Stack {
            input,
            field,
            group_by,
            order_by,
            offset,
            alias: pair(&s.alias, ("y0", "y1"))?,
        })
    }

    /// Parse an expression, check its columns, and freeze its signals.
    fn bind_expr(&self, src: &str, schema: &Schema) -> std::result::Result<Expr, Refusal> {
        let expr = Expr::parse(src).map_err(|e| Refusal::unsupported(e.to_string()))?;
        for f in expr.referenced_fields() {
            if !schema.contains(&f) {
                return Err(Refusal::missing_column(&f));
            }
        }
        for name in expr.referenced_signals() {
            self.require_static(&name)?;
        }
        let bound = expr
            .bind_signals(&|name| self.signals.static_value(name))
            .map_err(|e| Refusal::unsupported(e.to_string()))?;
        bound
            .data_type(schema)
            .map_err(|e| Refusal::unsupported(e.to_string()))?;
        Ok(bound)
    }

    fn require_static(&self, name: &str) -> std::result::Result<(), Refusal> {
        match self.signals.lookup(name) {
            SignalValue::Static(_) => Ok(()),
            SignalValue::Interactive => Err(Refusal::unsupported(format!(
                "depends on interactive signal '{}'",
                name
            ))),
            SignalValue::Unknown => Err(Refusal::unsupported(format!(
                "depends on unresolved signal '{}'",
                name
            ))),
        }
    }

    fn signal_json(&self, src: &str) -> std::result::Result<Value, Refusal> {
        if let Ok(expr) = Expr::parse(src) {
            for name in expr.referenced_signals() {
                self.require_static(&name)?;
            }
        }
        self.signals.evaluate(src).map_err(Refusal::unsupported)
    }

    fn optional_number(&self, p: &Option<Param<f64>>) -> std::result::Result<Option<f64>, Refusal> {
        match p {
            None => Ok(None),
            Some(Param::Value(v)) => Ok(Some(*v)),
            Some(Param::Signal { signal }) => match self.signal_json(signal)? {
                Value::Null => Ok(None),
                v => v.as_f64().map(Some).ok_or_else(|| {
                    Refusal::unsupported(format!("signal '{}' resolved to {}", signal, v))
                }),
            },
        }
    }

    fn number(&self, p: &Option<Param<f64>>, default: f64) -> std::result::Result<f64, Refusal> {
        Ok(self.optional_number(p)?.unwrap_or(default))
    }
}

fn column(name: &str, schema: &Schema) -> std::result::Result<String, Refusal> {
    let name = field_name(name).map_err(Refusal::unsupported)?;
    if !schema.contains(&name) {
        return Err(Refusal::missing_column(&name));
    }
    Ok(name)
}

fn sort_keys(cmp: &Compare, schema: &Schema) -> std::result::Result<Vec<SortKey>, Refusal> {
    let keys = cmp.sort_keys().map_err(Refusal::unsupported)?;
    for k in &keys {
        if !schema.contains(&k.field) {
            return Err(Refusal::missing_column(&k.field));
        }
    }
    Ok(keys)
}

fn pair(
    alias: &Option<Vec<String>>,
    defaults: (&str, &str),
) -> std::result::Result<(String, String), Refusal> {
    match alias.as_deref() {
        None => Ok((defaults.0.to_string(), defaults.1.to_string())),
        Some([a, b]) => Ok((a.clone(), b.clone())),
        Some(_) => Err(Refusal::unsupported("'as' must name two columns")),
    }
}

fn literal_extent(v: &[f64]) -> std::result::Result<BinExtent, Refusal> {
    match v {
        [lo, hi] if lo.is_finite() && hi.is_finite() => {
            Ok(BinExtent::Literal(lo.min(*hi), lo.max(*hi)))
        }
        _ => Err(Refusal::unsupported(format!("invalid bin extent {:?}", v))),
    }
}
