//! Runtime: one pre-transform request from specification to rewritten
//! specification.
//!
//! Steps:
//! - validate configuration and extract the data-source DAG (structural
//!   errors abort here, before any executor runs),
//! - freeze statically known signals,
//! - walk the DAG with `DagScheduler`; each node resolves its input, folds
//!   its transforms into a plan and evaluates it (or, in vendor mode,
//!   renders it as a query reference),
//! - merge results in topological order and return them with the warnings.
//!
//! All state lives in a per-request `RequestState`; nothing is cached across
//! requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info_span, Instrument, Span};
use uuid::Uuid;

use prevega_core::config::{ExecutorErrorPolicy, OutputMode, PreTransformConfig};
use prevega_core::dag::LogicalPlan;
use prevega_core::error::Error;
use prevega_core::hash::hash_str;
use prevega_core::prelude::Schema;
use prevega_core::registry::{Payload, SchemaRegistry};
use prevega_core::types::Table;
use prevega_core::warning::{Diagnostics, Warning, WarningKind};
use prevega_planner::{
    BuiltPlan, Capabilities, DataSource, PlanBuilder, SignalScope, SourceGraph, Specification,
    Upstream,
};

use crate::dispatch::{dispatch, prepare, render_sql, DispatchError};
use crate::error::ExecError;
use crate::executor::{Executor, ExecutorError, LocalExecutor, PlanFormat, ScanInput};
use crate::merge::merge;
use crate::metrics::{emit_request_summary, record_warning};
use crate::result::{ExecutionResult, ResultMetadata};
use crate::scheduler::DagScheduler;

/// URL scheme of vendor-mode references.
pub const QUERY_URL_SCHEME: &str = "prevega+query://";

#[derive(Debug, Clone)]
pub struct PreTransformOutput {
    pub spec: Specification,
    /// Topological order.
    pub results: Vec<ExecutionResult>,
    pub warnings: Vec<Warning>,
}

impl PreTransformOutput {
    pub fn metadata(&self) -> Vec<ResultMetadata> {
        self.results.iter().map(ExecutionResult::metadata).collect()
    }
}

pub struct PreTransformRuntime {
    config: PreTransformConfig,
    executor: Arc<dyn Executor>,
}

impl PreTransformRuntime {
    /// Runtime backed by the embedded engine.
    pub fn new(config: PreTransformConfig) -> Self {
        Self {
            config,
            executor: Arc::new(LocalExecutor::new()),
        }
    }

    pub fn with_executor<E: Executor + 'static>(self, executor: E) -> Self {
        self.with_shared_executor(Arc::new(executor))
    }

    pub fn with_shared_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn config(&self) -> &PreTransformConfig {
        &self.config
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    /// Pre-evaluate every eligible data source of `spec`.
    ///
    /// Fails only on invalid configuration, a structurally malformed
    /// specification, or an executor failure under `fail_request`.
    pub async fn pre_transform(
        &self,
        spec: &Specification,
        registry: Arc<SchemaRegistry>,
    ) -> Result<PreTransformOutput, ExecError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("pre_transform", %request_id, executor = self.executor.name());
        self.run(spec, registry).instrument(span).await
    }

    async fn run(
        &self,
        spec: &Specification,
        registry: Arc<SchemaRegistry>,
    ) -> Result<PreTransformOutput, ExecError> {
        self.config.validate()?;
        let graph = SourceGraph::extract(spec)?;
        let signals = SignalScope::from_spec(spec, self.config.preserve_client_interactivity);
        debug!(sources = graph.len(), "extracted data sources");

        let state = Arc::new(RequestState {
            outcomes: Mutex::new(vec![NodeOutcome::default(); graph.len()]),
            graph,
            signals,
            registry,
            executor: self.executor.clone(),
            config: self.config.clone(),
            diagnostics: Diagnostics::new(),
        });

        let worker = state.clone();
        let span = Span::current();
        DagScheduler::new(self.config.max_parallel_tasks)
            .run(&state.graph, move |idx| {
                let _entered = span.enter();
                worker.evaluate(idx)
            })
            .await?;

        let outcomes = state.take_outcomes()?;
        let mut outcomes: Vec<Option<ExecutionResult>> =
            outcomes.into_iter().map(|o| o.result).collect();
        let results: Vec<ExecutionResult> = state
            .graph
            .topo_order()
            .iter()
            .filter_map(|&i| outcomes[i].take())
            .collect();

        let merged = merge(spec, &results, &state.diagnostics)?;
        let warnings = state.diagnostics.drain();
        emit_request_summary(state.graph.len(), results.len(), warnings.len());
        Ok(PreTransformOutput {
            spec: merged,
            results,
            warnings,
        })
    }
}

/// What a finished node hands to its children.
#[derive(Debug, Clone)]
struct NodeOutput {
    plan: LogicalPlan,
    inputs: HashMap<String, ScanInput>,
    /// Rows of `plan`, when they were computed (or given inline).
    table: Option<Table>,
}

#[derive(Debug, Clone, Default)]
struct NodeOutcome {
    result: Option<ExecutionResult>,
    /// Present only when the node's whole pipeline was evaluated.
    output: Option<NodeOutput>,
}

struct RequestState {
    graph: SourceGraph,
    signals: SignalScope,
    registry: Arc<SchemaRegistry>,
    executor: Arc<dyn Executor>,
    config: PreTransformConfig,
    diagnostics: Diagnostics,
    outcomes: Mutex<Vec<NodeOutcome>>,
}

impl RequestState {
    fn evaluate(&self, idx: usize) -> Result<(), ExecError> {
        let source = self.graph.source(idx);
        let Some(input) = self.resolve_input(source)? else {
            return Ok(());
        };

        let external = matches!(source.upstream, Upstream::Dataset(_));
        if source.transforms.is_empty() && !external {
            // Already-inline rows or a plain alias of the parent.
            return self.store(
                idx,
                NodeOutcome {
                    result: None,
                    output: Some(input),
                },
            );
        }

        let capabilities = match self.config.output_mode {
            OutputMode::Inline => self.executor.capabilities(),
            OutputMode::VendorReference => Capabilities::sql(self.config.sql_dialect),
        };
        let built = PlanBuilder::new(&capabilities, &self.signals)
            .with_local_timezone(self.config.local_timezone.clone())
            .build(&source.transforms, input.plan.clone());
        if let Some(stop) = &built.stop {
            self.warn(
                stop.warning_kind,
                &source.name,
                format!(
                    "transform {} ('{}') left for the client: {}",
                    stop.index, stop.kind, stop.message
                ),
            );
        }

        // Reserved dataset URLs mean nothing to the client, so those rows
        // are materialized even when no transform folds.
        if built.folded == 0 && !external {
            return Ok(());
        }

        match self.config.output_mode {
            OutputMode::Inline => self.execute(idx, source, built, input.inputs),
            OutputMode::VendorReference => self.reference(idx, source, built, input.inputs),
        }
    }

    /// Input plan for `source`, or `None` when it cannot be pre-evaluated.
    fn resolve_input(&self, source: &DataSource) -> Result<Option<NodeOutput>, ExecError> {
        let client_side = |what: String| -> Result<Option<NodeOutput>, ExecError> {
            if !source.transforms.is_empty() {
                self.warn(WarningKind::PartialEvaluation, &source.name, what);
            }
            Ok(None)
        };
        match &source.upstream {
            Upstream::Source(parent) => {
                let parent_idx = self.graph.index_of(parent).ok_or_else(|| {
                    Error::Invariant(format!("parent '{}' missing from graph", parent))
                })?;
                match self.output_of(parent_idx)? {
                    Some(out) => Ok(Some(child_view(parent, out)?)),
                    None => client_side(format!("upstream '{}' was not pre-evaluated", parent)),
                }
            }
            Upstream::Dataset(name) => match self.registry.resolve(name) {
                Ok(binding) => {
                    let input = match &binding.payload {
                        Payload::Inline(table) => ScanInput::Inline(table.clone()),
                        Payload::External(handle) => ScanInput::External(handle.clone()),
                    };
                    Ok(Some(NodeOutput {
                        plan: LogicalPlan::scan(name.clone(), binding.schema.clone()),
                        inputs: HashMap::from([(name.clone(), input)]),
                        table: None,
                    }))
                }
                Err(Error::NotFound(_)) => {
                    self.warn(
                        WarningKind::SchemaMismatch,
                        &source.name,
                        format!("dataset '{}' is not bound", name),
                    );
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            },
            Upstream::Values(table) => Ok(Some(NodeOutput {
                plan: LogicalPlan::scan(source.name.clone(), table.schema()),
                inputs: HashMap::from([(source.name.clone(), ScanInput::Inline(table.clone()))]),
                table: Some(table.clone()),
            })),
            Upstream::Url(url) => client_side(format!("rows are loaded by the client from '{}'", url)),
            Upstream::Sources(names) => {
                client_side(format!("union of {:?} is evaluated by the client", names))
            }
            Upstream::Opaque(reason) => {
                client_side(format!("inline values are parsed by the client: {}", reason))
            }
            Upstream::None => client_side("entry has no rows to evaluate".into()),
        }
    }

    fn execute(
        &self,
        idx: usize,
        source: &DataSource,
        built: BuiltPlan,
        inputs: HashMap<String, ScanInput>,
    ) -> Result<(), ExecError> {
        let expected: Schema = built.plan.schema()?;
        let request = match prepare(
            self.executor.as_ref(),
            &source.name,
            built.plan.clone(),
            inputs.clone(),
        ) {
            Ok(request) => request,
            Err(e) => return self.executor_failed(source, e),
        };
        let output = match dispatch(self.executor.as_ref(), &request, &expected) {
            Ok(output) => output,
            Err(DispatchError::SchemaMismatch(message)) => {
                self.warn(WarningKind::SchemaMismatch, &source.name, message);
                return Ok(());
            }
            Err(DispatchError::Executor(e)) => return self.executor_failed(source, e),
        };

        let full = output.table;
        let mut table = full.clone();
        if let Some(limit) = self.config.row_limit {
            if table.num_rows() > limit {
                self.warn(
                    WarningKind::RowLimitExceeded,
                    &source.name,
                    format!("{} rows truncated to {}", table.num_rows(), limit),
                );
                table.truncate(limit);
            }
        }

        let complete = built.is_complete();
        let result = ExecutionResult {
            dataset_name: source.name.clone(),
            table: Some(table),
            generated_query: match request.format {
                PlanFormat::Sql(_) => request.rendered.clone(),
                _ => None,
            },
            reference_url: None,
            source_plan: built.plan.clone(),
            folded: built.folded,
            partial: !complete,
            signals: output.signals,
        };
        let output = complete.then(|| NodeOutput {
            plan: built.plan,
            inputs,
            table: Some(full),
        });
        self.store(
            idx,
            NodeOutcome {
                result: Some(result),
                output,
            },
        )
    }

    /// Vendor mode: render the plan as a query and reference it by
    /// fingerprint instead of running it.
    fn reference(
        &self,
        idx: usize,
        source: &DataSource,
        built: BuiltPlan,
        inputs: HashMap<String, ScanInput>,
    ) -> Result<(), ExecError> {
        let sql = match render_sql(self.config.sql_dialect, &built.plan, &inputs) {
            Ok(sql) => sql,
            Err(e) => return self.executor_failed(source, e),
        };
        let url = format!("{}{}", QUERY_URL_SCHEME, hash_str(&sql).short());
        debug!(dataset = %source.name, %url, "rendered vendor reference");

        let complete = built.is_complete();
        let result = ExecutionResult {
            dataset_name: source.name.clone(),
            table: None,
            generated_query: Some(sql),
            reference_url: Some(url),
            source_plan: built.plan.clone(),
            folded: built.folded,
            partial: !complete,
            signals: Default::default(),
        };
        let output = complete.then(|| NodeOutput {
            plan: built.plan,
            inputs,
            table: None,
        });
        self.store(
            idx,
            NodeOutcome {
                result: Some(result),
                output,
            },
        )
    }

    fn executor_failed(&self, source: &DataSource, error: ExecutorError) -> Result<(), ExecError> {
        match self.config.on_executor_error {
            ExecutorErrorPolicy::FailRequest => Err(ExecError::ExecutorFailure {
                dataset: source.name.clone(),
                source: error,
            }),
            ExecutorErrorPolicy::SkipDataset => {
                self.warn(
                    WarningKind::ExecutorFailure,
                    &source.name,
                    error.to_string(),
                );
                Ok(())
            }
        }
    }

    fn warn(&self, kind: WarningKind, dataset: &str, message: String) {
        record_warning(&self.diagnostics, Warning::new(kind, dataset, message));
    }

    fn store(&self, idx: usize, outcome: NodeOutcome) -> Result<(), ExecError> {
        let mut guard = self
            .outcomes
            .lock()
            .map_err(|_| ExecError::Scheduler("outcome lock poisoned".into()))?;
        guard[idx] = outcome;
        Ok(())
    }

    fn output_of(&self, idx: usize) -> Result<Option<NodeOutput>, ExecError> {
        let guard = self
            .outcomes
            .lock()
            .map_err(|_| ExecError::Scheduler("outcome lock poisoned".into()))?;
        Ok(guard[idx].output.clone())
    }

    fn take_outcomes(&self) -> Result<Vec<NodeOutcome>, ExecError> {
        let mut guard = self
            .outcomes
            .lock()
            .map_err(|_| ExecError::Scheduler("outcome lock poisoned".into()))?;
        Ok(std::mem::take(&mut *guard))
    }
}

/// How a child sees its parent's output: a scan of the parent's rows when
/// they were computed, otherwise the parent's plan to build on.
fn child_view(parent: &str, out: NodeOutput) -> Result<NodeOutput, ExecError> {
    match out.table {
        Some(table) => {
            let schema = out.plan.schema()?;
            Ok(NodeOutput {
                plan: LogicalPlan::scan(parent, schema),
                inputs: HashMap::from([(parent.to_string(), ScanInput::Inline(table.clone()))]),
                table: Some(table),
            })
        }
        None => Ok(out),
    }
}
