use std::any::type_name;
use std::borrow::Cow;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::core::Dynamic;
use crate::engine::{Args, Inputs, NodeId, Stage, Value};
use crate::error::ExecError;

/// What a node holds once it has been evaluated.
pub(crate) type Outcome = Result<Dynamic, ExecError>;

/// The type-erased foundation that allows the graph to hold tasks with
/// different argument and output types.
pub(crate) trait Invoke: Send + Sync {
    fn invoke(&self, inputs: &[Dynamic]) -> anyhow::Result<Dynamic>;

    fn output_type_name(&self) -> &'static str;
}

/// A wrapped function together with the arguments it was called with.
pub(crate) struct Call<F, M>
where
    F: Stage<M>,
{
    stage: Arc<F>,
    args: F::Args,
    _marker: PhantomData<fn() -> M>,
}

impl<F, M> Call<F, M>
where
    F: Stage<M>,
{
    pub(crate) fn new(stage: Arc<F>, args: F::Args) -> Self {
        Self {
            stage,
            args,
            _marker: PhantomData,
        }
    }
}

// A blanket implementation to automatically bridge the two. This is where the
// type erasure actually happens.
impl<F, M> Invoke for Call<F, M>
where
    F: Stage<M>,
    M: 'static,
{
    fn invoke(&self, inputs: &[Dynamic]) -> anyhow::Result<Dynamic> {
        let mut inputs = Inputs::new(inputs);
        let output = self.stage.invoke(&self.args, &mut inputs)?;
        Ok(Arc::new(output))
    }

    fn output_type_name(&self) -> &'static str {
        type_name::<F::Output>()
    }
}

/// Collects a list of values into one `Vec<Arc<T>>`.
pub(crate) struct Gather<T> {
    pub(crate) items: Vec<Value<T>>,
}

impl<T> Invoke for Gather<T>
where
    T: Send + Sync + 'static,
{
    fn invoke(&self, inputs: &[Dynamic]) -> anyhow::Result<Dynamic> {
        let mut inputs = Inputs::new(inputs);
        let items = self
            .items
            .iter()
            .map(|item| item.resolve_shared(&mut inputs))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(items))
    }

    fn output_type_name(&self) -> &'static str {
        type_name::<Vec<Arc<T>>>()
    }
}

/// A value placed into the graph as-is.
pub(crate) struct Constant {
    pub(crate) value: Dynamic,
    pub(crate) type_name: &'static str,
}

impl Invoke for Constant {
    fn invoke(&self, _: &[Dynamic]) -> anyhow::Result<Dynamic> {
        Ok(self.value.clone())
    }

    fn output_type_name(&self) -> &'static str {
        self.type_name
    }
}

pub(crate) struct Body {
    /// Pending arguments, in argument order. May repeat a node.
    pub(crate) dependencies: Vec<NodeId>,
    pub(crate) task: Box<dyn Invoke>,
}

impl Body {
    pub(crate) fn call<F, M>(stage: Arc<F>, args: F::Args) -> Self
    where
        F: Stage<M>,
        M: 'static,
    {
        Self {
            dependencies: args.dependencies(),
            task: Box::new(Call::new(stage, args)),
        }
    }
}

/// One recorded unit of work.
///
/// The result slot is written at most once. Evaluation first takes the
/// node's claim lock, so a node reachable from several branches, or from
/// several concurrent computations, runs exactly once while the others wait
/// for its result.
pub(crate) struct TaskNode {
    pub(crate) id: NodeId,
    pub(crate) name: Cow<'static, str>,
    body: OnceLock<Body>,
    claim: Mutex<()>,
    result: OnceLock<Outcome>,
}

impl TaskNode {
    pub(crate) fn new(id: NodeId, name: Cow<'static, str>, body: Option<Body>) -> Self {
        let slot = OnceLock::new();
        if let Some(body) = body {
            let _ = slot.set(body);
        }

        Self {
            id,
            name,
            body: slot,
            claim: Mutex::new(()),
            result: OnceLock::new(),
        }
    }

    pub(crate) fn body(&self) -> Option<&Body> {
        self.body.get()
    }

    pub(crate) fn is_defined(&self) -> bool {
        self.body.get().is_some()
    }

    /// Binds the body of a forward-declared node, failing if it was already
    /// bound.
    pub(crate) fn define(&self, body: Body) -> Result<(), ExecError> {
        self.body
            .set(body)
            .map_err(|_| ExecError::AlreadyDefined {
                node: self.name.to_string(),
            })
    }

    pub(crate) fn dependencies(&self) -> &[NodeId] {
        self.body()
            .map(|body| body.dependencies.as_slice())
            .unwrap_or_default()
    }

    pub(crate) fn output_type_name(&self) -> &'static str {
        self.body()
            .map(|body| body.task.output_type_name())
            .unwrap_or("?")
    }

    pub(crate) fn result(&self) -> Option<&Outcome> {
        self.result.get()
    }

    /// Stores `outcome` unless the slot is already filled and returns what
    /// the slot holds afterwards.
    pub(crate) fn commit(&self, outcome: Outcome) -> Outcome {
        let _claim = self.claim.lock().unwrap_or_else(PoisonError::into_inner);
        self.result.get_or_init(|| outcome).clone()
    }

    /// Runs the task against the resolved `inputs`.
    ///
    /// Returns `None` when `cancelled` is raised before the task starts or
    /// while it runs; the slot is then left empty so a later computation can
    /// pick the node up again.
    pub(crate) fn evaluate(&self, inputs: &[Dynamic], cancelled: &AtomicBool) -> Option<Outcome> {
        let _claim = self.claim.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(done) = self.result.get() {
            return Some(done.clone());
        }

        if cancelled.load(Ordering::Acquire) {
            return None;
        }

        let outcome = match self.body() {
            Some(body) => guarded(&self.name, || body.task.invoke(inputs)),
            None => Err(ExecError::UndefinedNode {
                node: self.name.to_string(),
            }),
        };

        if cancelled.load(Ordering::Acquire) {
            return None;
        }

        Some(self.result.get_or_init(|| outcome).clone())
    }
}

/// Runs user code, turning both returned errors and panics into
/// [`ExecError::WorkerExecution`].
pub(crate) fn guarded<T>(
    name: &str,
    func: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, ExecError> {
    match catch_unwind(AssertUnwindSafe(func)) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(ExecError::worker(name, err)),
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Err(ExecError::worker(name, anyhow::anyhow!(msg)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use petgraph::graph::NodeIndex;

    use super::*;
    use crate::core::GraphId;

    fn node_with<F, M>(stage: F, args: F::Args) -> TaskNode
    where
        F: Stage<M>,
        M: 'static,
    {
        let id = NodeId::new(GraphId::next(), NodeIndex::new(0));
        TaskNode::new(id, "test".into(), Some(Body::call(Arc::new(stage), args)))
    }

    #[test]
    fn test_evaluate_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        fn count(x: &u32) -> anyhow::Result<u32> {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(x * 2)
        }

        let node = node_with(count, (Value::new(21_u32),));
        let flag = AtomicBool::new(false);

        let first = node.evaluate(&[], &flag).unwrap().unwrap();
        let second = node.evaluate(&[], &flag).unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.downcast_ref::<u32>(), Some(&42));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_leaves_slot_empty() {
        fn one() -> anyhow::Result<u8> {
            Ok(1)
        }

        let node = node_with(one, ());
        let flag = AtomicBool::new(true);

        assert!(node.evaluate(&[], &flag).is_none());
        assert!(node.result().is_none());

        flag.store(false, Ordering::Release);
        assert!(node.evaluate(&[], &flag).unwrap().is_ok());
    }

    #[test]
    fn test_panic_becomes_worker_error() {
        fn explode() -> anyhow::Result<u8> {
            panic!("kaboom")
        }

        let node = node_with(explode, ());
        let err = node.evaluate(&[], &AtomicBool::new(false)).unwrap().unwrap_err();

        match err {
            ExecError::WorkerExecution { node, source } => {
                assert_eq!(node, "test");
                assert!(source.to_string().contains("kaboom"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_define_twice() {
        let id = NodeId::new(GraphId::next(), NodeIndex::new(0));
        let node = TaskNode::new(id, "later".into(), None);
        assert!(!node.is_defined());

        fn one() -> anyhow::Result<u8> {
            Ok(1)
        }

        node.define(Body::call(Arc::new(one), ())).unwrap();
        let err = node.define(Body::call(Arc::new(one), ())).unwrap_err();
        assert!(matches!(err, ExecError::AlreadyDefined { .. }));
    }

    #[test]
    fn test_gather_mixes_ready_and_pending() {
        let pending: Value<u8> = Value::Pending(crate::engine::Delayed::new(NodeId::new(
            GraphId::next(),
            NodeIndex::new(2),
        )));
        let gather = Gather {
            items: vec![Value::new(1_u8), pending, Value::new(3_u8)],
        };

        let output = gather.invoke(&[Arc::new(2_u8) as Dynamic]).unwrap();
        let items = output.downcast_ref::<Vec<Arc<u8>>>().unwrap();
        assert_eq!(items.iter().map(|x| **x).collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
