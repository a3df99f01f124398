//! DAG scheduler for data-source evaluation.
//!
//! Nodes become ready once all their parents have finished. Ready nodes run
//! on tokio's blocking pool, at most `max_parallel` at a time, picked in
//! topological rank so independent sources start in declaration order.
//! The first failing node stops further scheduling; nodes already running
//! are drained before the failure is returned.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use prevega_planner::SourceGraph;

use crate::error::ExecError;

pub struct DagScheduler {
    max_parallel: usize,
}

impl DagScheduler {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run `task` once per node of `graph`, parents strictly before children.
    ///
    /// `task` receives the node index and runs on a blocking thread; it must
    /// return `Err` only for failures that end the whole request.
    pub async fn run<F>(&self, graph: &SourceGraph, task: F) -> Result<(), ExecError>
    where
        F: Fn(usize) -> Result<(), ExecError> + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let n = graph.len();

        let mut rank = vec![0usize; n];
        for (r, &node) in graph.topo_order().iter().enumerate() {
            rank[node] = r;
        }
        let mut pending: Vec<usize> = (0..n).map(|i| graph.parents(i).len()).collect();
        let mut ready: BTreeSet<(usize, usize)> = (0..n)
            .filter(|&i| pending[i] == 0)
            .map(|i| (rank[i], i))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks: JoinSet<(usize, Result<(), ExecError>)> = JoinSet::new();
        let mut failure: Option<ExecError> = None;

        loop {
            while failure.is_none() {
                let Some(&(r, node)) = ready.iter().next() else {
                    break;
                };
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                ready.remove(&(r, node));
                trace!(node, in_flight = tasks.len() + 1, "scheduling node");
                let task = task.clone();
                tasks.spawn_blocking(move || {
                    let _permit = permit; // held for the duration of the node
                    (node, task(node))
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((node, Ok(()))) => {
                    for &child in graph.children(node) {
                        pending[child] -= 1;
                        if pending[child] == 0 {
                            ready.insert((rank[child], child));
                        }
                    }
                }
                Ok((node, Err(e))) => {
                    debug!(node, error = %e, "node failed; draining in-flight nodes");
                    failure.get_or_insert(e);
                }
                Err(join_err) => {
                    failure.get_or_insert(ExecError::Scheduler(join_err.to_string()));
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prevega_planner::Specification;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn graph(data: serde_json::Value) -> SourceGraph {
        SourceGraph::extract(&Specification::new(json!({ "data": data })).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn parents_finish_before_children() {
        let g = graph(json!([
            {"name": "c", "source": "b"},
            {"name": "b", "source": "a"},
            {"name": "a", "values": []},
            {"name": "d", "values": []}
        ]));
        let finished = Arc::new(Mutex::new(Vec::new()));
        let log = finished.clone();
        let names: Vec<String> = g.sources().iter().map(|s| s.name.clone()).collect();
        DagScheduler::new(4)
            .run(&g, move |i| {
                log.lock().unwrap().push(names[i].clone());
                Ok(())
            })
            .await
            .unwrap();
        let order = finished.lock().unwrap().clone();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert_eq!(order.len(), 4);
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[tokio::test]
    async fn parallelism_is_bounded() {
        let g = graph(json!([
            {"name": "a", "values": []},
            {"name": "b", "values": []},
            {"name": "c", "values": []},
            {"name": "d", "values": []},
            {"name": "e", "values": []}
        ]));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        DagScheduler::new(2)
            .run(&g, move |_| {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn failure_stops_scheduling_descendants() {
        let g = graph(json!([
            {"name": "a", "values": []},
            {"name": "b", "source": "a"}
        ]));
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let err = DagScheduler::new(1)
            .run(&g, move |i| {
                counter.fetch_add(1, Ordering::SeqCst);
                if i == 0 {
                    Err(ExecError::Scheduler("first node failed".into()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("first node failed"));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
