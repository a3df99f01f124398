use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::{Builder, Handle};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use prevega_core::types::Table;
use prevega_planner::Capabilities;

use super::{
    Executor, ExecutorError, ExecutorOutput, LocalExecutor, PlanFormat, PlanRequest, RemotePlan,
};

/// Requests waiting for a free worker before senders block.
const QUEUE_DEPTH: usize = 64;

/// Wire form of a worker's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteReply {
    Ok {
        table: Table,
        #[serde(default)]
        signals: BTreeMap<String, Value>,
    },
    Error {
        message: String,
    },
}

impl RemoteReply {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"status":"error","message":"reply encoding failed: {}"}}"#,
                e
            )
        })
    }
}

struct Envelope {
    payload: String,
    reply: oneshot::Sender<String>,
}

/// Executor on the far side of a message-passing boundary.
///
/// Requests are serialized to a JSON `RemotePlan`, queued on a channel, and
/// answered with a JSON `RemoteReply`. Each worker is a thread running the
/// handler; a process or network proxy fits the same shape.
///
/// At most `workers` requests are handled at once. Further dispatches wait in
/// the queue, so a `max_parallel_tasks` above the worker count adds no
/// parallelism.
pub struct RemoteExecutor {
    name: String,
    capabilities: Capabilities,
    sender: mpsc::Sender<Envelope>,
    deadline: Option<Duration>,
}

impl RemoteExecutor {
    /// Start `workers` threads that answer each JSON request with `handler`.
    pub fn spawn<H>(
        name: impl Into<String>,
        capabilities: Capabilities,
        workers: usize,
        handler: H,
    ) -> Result<Self, ExecutorError>
    where
        H: Fn(&str) -> String + Send + Sync + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Envelope>(QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);
        for id in 0..workers.max(1) {
            let rx = rx.clone();
            let handler = handler.clone();
            thread::Builder::new()
                .name(format!("prevega-remote-{}-{}", name, id))
                .spawn(move || loop {
                    // The lock is held only while waiting for the next request.
                    let Some(envelope) = rx.blocking_lock().blocking_recv() else {
                        break;
                    };
                    let reply = catch_unwind(AssertUnwindSafe(|| handler(&envelope.payload)))
                        .unwrap_or_else(|_| {
                            RemoteReply::Error {
                                message: "worker panicked".into(),
                            }
                            .to_json()
                        });
                    // The caller may have given up after its deadline.
                    let _ = envelope.reply.send(reply);
                })
                .map_err(|e| ExecutorError::Transport(e.to_string()))?;
        }
        Ok(Self {
            name,
            capabilities,
            sender: tx,
            deadline: None,
        })
    }

    /// Workers that evaluate plans with the embedded engine.
    pub fn local_engine(workers: usize) -> Result<Self, ExecutorError> {
        let engine = LocalExecutor::new();
        Self::spawn("local-engine", Capabilities::all(), workers, move |payload| {
            let reply = RemotePlan::from_json(payload).and_then(|plan| {
                let request = PlanRequest {
                    dataset: plan.dataset,
                    plan: plan.plan,
                    format: PlanFormat::Structured,
                    rendered: None,
                    inputs: plan.inputs.into_iter().collect(),
                };
                engine.execute(&request)
            });
            match reply {
                Ok(out) => RemoteReply::Ok {
                    table: out.table,
                    signals: out.signals,
                },
                Err(e) => RemoteReply::Error {
                    message: e.to_string(),
                },
            }
            .to_json()
        })
    }

    /// Give up on a reply after `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Send `payload` and block the calling (non-async) thread for the reply.
    fn round_trip(&self, payload: String) -> Result<String, ExecutorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .blocking_send(Envelope {
                payload,
                reply: reply_tx,
            })
            .map_err(|_| ExecutorError::Transport(format!("worker '{}' is gone", self.name)))?;
        let hung_up = || ExecutorError::Transport(format!("worker '{}' hung up", self.name));

        let Some(deadline) = self.deadline else {
            return reply_rx.blocking_recv().map_err(|_| hung_up());
        };
        let wait = async { tokio::time::timeout(deadline, reply_rx).await };
        let waited = match Handle::try_current() {
            Ok(handle) => handle.block_on(wait),
            Err(_) => Builder::new_current_thread()
                .enable_time()
                .build()
                .map_err(|e| ExecutorError::Transport(e.to_string()))?
                .block_on(wait),
        };
        match waited {
            Ok(reply) => reply.map_err(|_| hung_up()),
            Err(_) => {
                warn!(executor = %self.name, ?deadline, "remote deadline exceeded");
                Err(ExecutorError::Transport(format!(
                    "no reply within {:?}",
                    deadline
                )))
            }
        }
    }
}

impl Executor for RemoteExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn plan_format(&self) -> PlanFormat {
        PlanFormat::Json
    }

    fn execute(&self, request: &PlanRequest) -> Result<ExecutorOutput, ExecutorError> {
        let payload = match &request.rendered {
            Some(doc) => doc.clone(),
            None => RemotePlan::from_request(request).to_json()?,
        };
        debug!(executor = %self.name, dataset = %request.dataset, bytes = payload.len(), "sending plan");
        let raw = self.round_trip(payload)?;
        let reply: RemoteReply = serde_json::from_str(&raw)
            .map_err(|e| ExecutorError::InvalidResult(format!("undecodable reply: {}", e)))?;
        match reply {
            RemoteReply::Ok { table, signals } => {
                table
                    .validate()
                    .map_err(|e| ExecutorError::InvalidResult(e.to_string()))?;
                Ok(ExecutorOutput { table, signals })
            }
            RemoteReply::Error { message } => Err(ExecutorError::Failed(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ScanInput;
    use prevega_core::dag::{BinExtent, BinParams, LogicalPlan};
    use prevega_core::schema::DataType;
    use prevega_core::types::{Column, Scalar};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request() -> PlanRequest {
        let table = Table::try_new(vec![Column::new(
            "v",
            DataType::Float64,
            (0..10).map(|i| Scalar::F64(i as f64)).collect(),
        )])
        .unwrap();
        let plan = LogicalPlan::Extent {
            input: Box::new(LogicalPlan::scan("vals", table.schema())),
            field: "v".into(),
            signal: "v_extent".into(),
        };
        let plan = LogicalPlan::Bin {
            input: Box::new(plan),
            field: "v".into(),
            params: BinParams::default(),
            extent: BinExtent::Signal("v_extent".into()),
            alias: ("bin0".into(), "bin1".into()),
            signal: None,
        };
        PlanRequest {
            dataset: "vals".into(),
            plan,
            format: PlanFormat::Json,
            rendered: None,
            inputs: HashMap::from([("vals".to_string(), ScanInput::Inline(table))]),
        }
    }

    #[test]
    fn local_engine_round_trips_tables_and_signals() {
        let exec = RemoteExecutor::local_engine(1).unwrap();
        let out = exec.execute(&request()).unwrap();
        assert_eq!(out.table.num_rows(), 10);
        assert!(out.table.column("bin1").is_some());
        assert_eq!(out.signals["v_extent"], serde_json::json!([0.0, 9.0]));
    }

    #[test]
    fn worker_errors_and_panics_surface_as_failures() {
        let exec = RemoteExecutor::spawn("boom", Capabilities::all(), 1, |payload| {
            if payload.contains("vals") {
                panic!("cannot handle this");
            }
            String::new()
        })
        .unwrap();
        let err = exec.execute(&request()).unwrap_err();
        assert!(matches!(err, ExecutorError::Failed(m) if m.contains("panicked")));
    }

    #[test]
    fn deadline_bounds_the_wait() {
        let exec = RemoteExecutor::spawn("slow", Capabilities::all(), 1, |_| {
            thread::sleep(Duration::from_millis(200));
            RemoteReply::Error {
                message: "late".into(),
            }
            .to_json()
        })
        .unwrap()
        .with_deadline(Duration::from_millis(10));
        let err = exec.execute(&request()).unwrap_err();
        assert!(matches!(err, ExecutorError::Transport(m) if m.contains("no reply")));
    }

    #[tokio::test]
    async fn deadline_runs_on_the_ambient_runtime() {
        let exec = RemoteExecutor::spawn("slow", Capabilities::all(), 1, |_| {
            thread::sleep(Duration::from_millis(200));
            String::new()
        })
        .unwrap()
        .with_deadline(Duration::from_millis(10));
        let err = tokio::task::spawn_blocking(move || exec.execute(&request()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Transport(m) if m.contains("no reply")));
    }

    #[test]
    fn workers_answer_concurrently() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let exec = Arc::new(
            RemoteExecutor::spawn("pool", Capabilities::all(), 2, move |_| {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(100));
                r.fetch_sub(1, Ordering::SeqCst);
                RemoteReply::Error {
                    message: "done".into(),
                }
                .to_json()
            })
            .unwrap(),
        );
        let callers: Vec<_> = (0..2)
            .map(|_| {
                let exec = exec.clone();
                thread::spawn(move || exec.execute(&request()))
            })
            .collect();
        for caller in callers {
            assert!(matches!(
                caller.join().unwrap(),
                Err(ExecutorError::Failed(m)) if m == "done"
            ));
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn garbage_replies_are_invalid_results() {
        let exec = RemoteExecutor::spawn("garbage", Capabilities::all(), 1, |_| {
            "not json".to_string()
        })
        .unwrap();
        assert!(matches!(
            exec.execute(&request()).unwrap_err(),
            ExecutorError::InvalidResult(_)
        ));
    }
}
