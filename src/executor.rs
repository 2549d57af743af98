mod diagnostics;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::client::Client;
use crate::engine::{NodeId, Outcome, TaskNode};
use crate::error::ExecError;
use crate::graph::{Graph, Plan};

pub use diagnostics::{Diagnostics, TaskExecution};

/// How often the coordinator wakes up to check for cancellation while no
/// task is finishing.
const POLL: Duration = Duration::from_millis(50);

/// A message from a worker back to the coordinator.
struct Report {
    index: NodeIndex,
    /// `None` if the task was cancelled before committing a result.
    outcome: Option<Outcome>,
    start: Instant,
    duration: Duration,
    executed: bool,
}

/// Computes every node reachable from `roots` that has no result yet.
///
/// Structural problems (a cycle, an undefined node, a handle from another
/// context) are reported before any task is submitted. Task failures are not
/// errors here: they are committed into the failing node and poison its
/// dependents, while unrelated branches keep running.
pub(crate) fn compute(
    graph: &Graph,
    client: &Client,
    roots: &[NodeId],
) -> Result<Diagnostics, ExecError> {
    let plan = graph.plan(roots)?;
    run_parallel(graph, client, plan)
}

/// This function executes the planned graph on the client's thread pool. It
/// performs a parallel topological sort, where tasks are submitted as soon
/// as their dependencies are met.
///
/// The algorithm works as follows:
/// 1. The calling thread becomes the coordinator; tasks are spawned on the
///    pool and report back through a channel. Tasks are detached, so a
///    cancelled coordinator returns without waiting for them and whatever
///    they produce afterwards is dropped.
/// 2. Tasks with no pending dependencies are submitted first.
/// 3. The coordinator waits for reports. When a task completes, the
///    dependency counts of all tasks depending on it are decremented.
/// 4. A task whose count reaches zero is submitted. If one of its
///    dependencies failed, it is failed right away with the upstream cause
///    instead of running.
/// 5. The loop continues until all planned tasks have reported, or until the
///    client is cancelled.
fn run_parallel(graph: &Graph, client: &Client, plan: Plan) -> Result<Diagnostics, ExecError> {
    let Plan { nodes, order } = plan;

    let total_tasks = nodes.len() as u64;
    let mut completed_tasks = 0;

    if total_tasks == 0 {
        return Ok(Diagnostics::default());
    }

    let Some(pool) = client.pool() else {
        return Err(ExecError::Lifecycle);
    };

    let mut dependency_counts: HashMap<NodeIndex, usize> = order
        .nodes()
        .map(|index| {
            let count = order
                .neighbors_directed(index, Direction::Incoming)
                .count();
            (index, count)
        })
        .collect();

    let root_span = tracing::span!(Level::INFO, "compute", tasks = total_tasks);
    root_span.pb_set_length(total_tasks);
    root_span.pb_set_style(&crate::utils::get_style_compute());
    root_span.pb_set_message("Computing tasks...");
    let _enter = root_span.enter();

    let mut execution_times = HashMap::new();
    let pb_style = crate::utils::get_style_task();
    let (result_sender, result_receiver) = channel::<Report>();

    // A helper closure to spawn a task. Everything the task needs is owned,
    // so the coordinator can walk away on cancellation without joining it.
    let spawn_task = |index: NodeIndex, node: &Arc<TaskNode>| {
        let node = Arc::clone(node);
        let sender = result_sender.clone();

        let inputs = match graph.inputs(&node.name, node.dependencies()) {
            Ok(inputs) => inputs,
            Err(cause) => {
                tracing::debug!(task = %node.name, "skipping task, {cause}");
                let outcome = node.commit(Err(cause));
                let _ = sender.send(Report {
                    index,
                    outcome: Some(outcome),
                    start: Instant::now(),
                    duration: Duration::ZERO,
                    executed: false,
                });
                return;
            }
        };

        let pb_style = pb_style.clone();
        let cancelled = client.cancelled();

        pool.spawn(move || {
            let span = tracing::span!(Level::INFO, "task", name = %node.name);
            span.pb_set_style(&pb_style);
            span.pb_set_message(&format!("Running {}", node.name));
            let _enter = span.enter();

            let start = Instant::now();
            let outcome = node.evaluate(&inputs, &cancelled);
            let duration = start.elapsed();

            if let Some(Err(err)) = &outcome {
                tracing::debug!(task = %node.name, "task failed: {err}");
            }

            // The coordinator is gone if the computation was cancelled.
            let _ = sender.send(Report {
                index,
                outcome,
                start,
                duration,
                executed: true,
            });
        });
    };

    // Seed initial tasks
    for (index, node) in &nodes {
        if dependency_counts.get(index) == Some(&0) {
            spawn_task(*index, node);
        }
    }

    // Scheduler loop
    while completed_tasks < total_tasks {
        let report = match result_receiver.recv_timeout(POLL) {
            Ok(report) => report,
            Err(RecvTimeoutError::Timeout) => {
                if client.is_cancelled() {
                    tracing::warn!("computation cancelled, leaving running tasks behind");
                    return Err(ExecError::Cancelled);
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return Err(ExecError::Cancelled),
        };

        if report.outcome.is_none() {
            tracing::warn!("computation cancelled, leaving running tasks behind");
            return Err(ExecError::Cancelled);
        }

        completed_tasks += 1;
        root_span.pb_inc(1);

        if let Some(node) = nodes.get(&report.index).filter(|_| report.executed) {
            execution_times.insert(
                node.id,
                TaskExecution {
                    name: node.name.to_string(),
                    start: report.start,
                    duration: report.duration,
                },
            );
        }

        // Unlock dependents
        for dependent in order.neighbors_directed(report.index, Direction::Outgoing) {
            if let Some(count) = dependency_counts.get_mut(&dependent) {
                *count -= 1;
                if *count == 0 {
                    if let Some(node) = nodes.get(&dependent) {
                        spawn_task(dependent, node);
                    }
                }
            }
        }
    }

    tracing::info!(tasks = total_tasks, "computation complete");
    Ok(Diagnostics { execution_times })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::core::Config;
    use crate::engine::{Body, Delayed, Value};

    fn pending<T>(id: NodeId) -> Value<T> {
        Value::Pending(Delayed::new(id))
    }

    fn result_of(graph: &Graph, id: NodeId) -> Outcome {
        graph.node(id).unwrap().result().cloned().unwrap()
    }

    #[test]
    fn test_chain() {
        fn inc(x: &i32) -> anyhow::Result<i32> {
            Ok(x + 1)
        }

        let graph = Graph::new();
        let client = Client::start(Config::deferred().with_workers(2)).unwrap();

        let a = graph.record("a".into(), Body::call(Arc::new(inc), (Value::new(0),))).unwrap();
        let b = graph.record("b".into(), Body::call(Arc::new(inc), (pending(a),))).unwrap();
        let c = graph.record("c".into(), Body::call(Arc::new(inc), (pending(b),))).unwrap();

        let diagnostics = compute(&graph, &client, &[c]).unwrap();
        assert_eq!(diagnostics.execution_times.len(), 3);

        let output = result_of(&graph, c).unwrap();
        assert_eq!(output.downcast_ref::<i32>(), Some(&3));
    }

    #[test]
    fn test_siblings_run_concurrently() {
        use std::sync::{Barrier, LazyLock};

        static BARRIER: LazyLock<Barrier> = LazyLock::new(|| Barrier::new(2));

        fn wait(x: &u8) -> anyhow::Result<u8> {
            // Deadlocks unless both siblings are running at the same time.
            BARRIER.wait();
            Ok(*x)
        }

        let graph = Graph::new();
        let client = Client::start(Config::deferred().with_workers(2)).unwrap();

        let a = graph.record("a".into(), Body::call(Arc::new(wait), (Value::new(1_u8),))).unwrap();
        let b = graph.record("b".into(), Body::call(Arc::new(wait), (Value::new(2_u8),))).unwrap();

        compute(&graph, &client, &[a, b]).unwrap();
        assert!(result_of(&graph, a).is_ok());
        assert!(result_of(&graph, b).is_ok());
    }

    #[test]
    fn test_memoized_nodes_are_not_replanned() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        fn count(x: &i32) -> anyhow::Result<i32> {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(*x)
        }

        let graph = Graph::new();
        let client = Client::start(Config::deferred().with_workers(1)).unwrap();
        let a = graph.record("a".into(), Body::call(Arc::new(count), (Value::new(5),))).unwrap();

        compute(&graph, &client, &[a]).unwrap();
        let diagnostics = compute(&graph, &client, &[a]).unwrap();

        assert!(diagnostics.execution_times.is_empty());
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_poisons_dependents_only() {
        fn fail(_: &i32) -> anyhow::Result<i32> {
            anyhow::bail!("bad input")
        }

        fn inc(x: &i32) -> anyhow::Result<i32> {
            Ok(x + 1)
        }

        let graph = Graph::new();
        let client = Client::start(Config::deferred().with_workers(2)).unwrap();

        let bad = graph
            .record("bad".into(), Body::call(Arc::new(fail), (Value::new(0),)))
            .unwrap();
        let child = graph
            .record("child".into(), Body::call(Arc::new(inc), (pending(bad),)))
            .unwrap();
        let grandchild = graph
            .record("grandchild".into(), Body::call(Arc::new(inc), (pending(child),)))
            .unwrap();
        let sibling = graph
            .record("sibling".into(), Body::call(Arc::new(inc), (Value::new(9),)))
            .unwrap();

        compute(&graph, &client, &[grandchild, sibling]).unwrap();

        for id in [child, grandchild] {
            match result_of(&graph, id).unwrap_err() {
                ExecError::UpstreamFailure { cause, .. } => match *cause {
                    ExecError::WorkerExecution { node, .. } => assert_eq!(node, "bad"),
                    other => panic!("unexpected cause {other:?}"),
                },
                other => panic!("unexpected error {other:?}"),
            }
        }

        let sibling = result_of(&graph, sibling).unwrap();
        assert_eq!(sibling.downcast_ref::<i32>(), Some(&10));
    }

    #[test]
    fn test_cancelled_before_start() {
        fn inc(x: &i32) -> anyhow::Result<i32> {
            Ok(x + 1)
        }

        let graph = Graph::new();
        let client = Client::start(Config::deferred().with_workers(1)).unwrap();
        let a = graph.record("a".into(), Body::call(Arc::new(inc), (Value::new(0),))).unwrap();

        client.cancel();
        let err = compute(&graph, &client, &[a]).unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
        assert!(graph.node(a).unwrap().result().is_none());
    }
}
