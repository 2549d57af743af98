use std::any::type_name;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use petgraph::graph::NodeIndex;

use crate::core::{Dynamic, GraphId};
use crate::error::ExecError;

/// Identity of a task node inside one execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub(crate) graph: GraphId,
    pub(crate) index: NodeIndex,
}

impl NodeId {
    pub(crate) fn new(graph: GraphId, index: NodeIndex) -> Self {
        Self { graph, index }
    }

    /// Position of the node in the graph arena.
    pub fn index(&self) -> usize {
        self.index.index()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index.index())
    }
}

/// A type-safe reference to a deferred task in the graph.
///
/// A `Delayed<T>` is a lightweight, copyable token standing for the future
/// result of type `T`. It carries no data; the result lives in the node's
/// slot inside the graph and is reached through the context that recorded
/// it.
pub struct Delayed<T> {
    pub(crate) id: NodeId,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Delayed<T> {
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl<T> Clone for Delayed<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Delayed<T> {}

impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Delayed<T> {}

impl<T> Hash for Delayed<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Delayed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Delayed<{}>({})", type_name::<T>(), self.id)
    }
}

/// An argument to, or the result of, a dispatched call.
///
/// In sync mode every call returns `Ready`; in deferred mode calls return
/// `Pending` handles which can be passed straight into further calls. Both
/// variants are accepted anywhere a `Value` is expected, so pipeline code
/// reads the same in either mode.
pub enum Value<T> {
    /// A concrete value.
    Ready(Arc<T>),
    /// The future output of a recorded task.
    Pending(Delayed<T>),
}

impl<T> Value<T> {
    pub fn new(value: T) -> Self {
        Value::Ready(Arc::new(value))
    }

    pub fn shared(value: Arc<T>) -> Self {
        Value::Ready(value)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Value::Ready(_))
    }

    pub fn as_ready(&self) -> Option<&Arc<T>> {
        match self {
            Value::Ready(value) => Some(value),
            Value::Pending(_) => None,
        }
    }

    pub fn delayed(&self) -> Option<Delayed<T>> {
        match self {
            Value::Ready(_) => None,
            Value::Pending(delayed) => Some(*delayed),
        }
    }

    pub(crate) fn node_id(&self) -> Option<NodeId> {
        self.delayed().map(|delayed| delayed.id)
    }
}

impl<T: Send + Sync + 'static> Value<T> {
    /// Borrows the concrete value, taking the next resolved dependency from
    /// `inputs` when this is a pending handle.
    pub(crate) fn resolve<'a>(&'a self, inputs: &mut Inputs<'a>) -> Result<&'a T, ExecError> {
        match self {
            Value::Ready(value) => Ok(&**value),
            Value::Pending(_) => inputs.take::<T>(),
        }
    }

    pub(crate) fn resolve_shared(&self, inputs: &mut Inputs<'_>) -> Result<Arc<T>, ExecError> {
        match self {
            Value::Ready(value) => Ok(value.clone()),
            Value::Pending(_) => inputs.take_shared::<T>(),
        }
    }
}

impl<T> Clone for Value<T> {
    fn clone(&self) -> Self {
        match self {
            Value::Ready(value) => Value::Ready(value.clone()),
            Value::Pending(delayed) => Value::Pending(*delayed),
        }
    }
}

impl<T> From<T> for Value<T> {
    fn from(value: T) -> Self {
        Value::new(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Value::Pending(delayed) => f.debug_tuple("Pending").field(delayed).finish(),
        }
    }
}

/// Resolved outputs of a task's dependencies, handed out in argument order.
pub struct Inputs<'a> {
    iter: std::slice::Iter<'a, Dynamic>,
}

impl<'a> Inputs<'a> {
    pub(crate) fn new(outputs: &'a [Dynamic]) -> Self {
        Self {
            iter: outputs.iter(),
        }
    }

    fn next(&mut self) -> Result<&'a Dynamic, ExecError> {
        self.iter.next().ok_or(ExecError::TypeMismatch {
            expected: "more resolved dependencies",
        })
    }

    pub(crate) fn take<T: Send + Sync + 'static>(&mut self) -> Result<&'a T, ExecError> {
        self.next()?
            .downcast_ref::<T>()
            .ok_or(ExecError::TypeMismatch {
                expected: type_name::<T>(),
            })
    }

    pub(crate) fn take_shared<T: Send + Sync + 'static>(&mut self) -> Result<Arc<T>, ExecError> {
        self.next()?
            .clone()
            .downcast::<T>()
            .map_err(|_| ExecError::TypeMismatch {
                expected: type_name::<T>(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: usize) -> NodeId {
        NodeId::new(GraphId::next(), NodeIndex::new(index))
    }

    #[test]
    fn test_ready_resolves_without_inputs() {
        let value = Value::new(7_i64);
        let mut inputs = Inputs::new(&[]);
        assert_eq!(*value.resolve(&mut inputs).unwrap(), 7);
    }

    #[test]
    fn test_pending_takes_next_input() {
        let value: Value<String> = Value::Pending(Delayed::new(id(3)));
        let outputs: Vec<Dynamic> = vec![Arc::new("hello".to_string()) as Dynamic];
        let mut inputs = Inputs::new(&outputs);
        assert_eq!(value.resolve(&mut inputs).unwrap(), "hello");
    }

    #[test]
    fn test_pending_type_mismatch() {
        let value: Value<u8> = Value::Pending(Delayed::new(id(0)));
        let outputs: Vec<Dynamic> = vec![Arc::new(1.5_f64) as Dynamic];
        let mut inputs = Inputs::new(&outputs);
        let err = value.resolve(&mut inputs).unwrap_err();
        assert!(matches!(err, ExecError::TypeMismatch { expected: "u8" }));
    }

    #[test]
    fn test_shared_keeps_allocation() {
        let outputs: Vec<Dynamic> = vec![Arc::new(vec![1, 2, 3]) as Dynamic];
        let value: Value<Vec<i32>> = Value::Pending(Delayed::new(id(1)));
        let mut inputs = Inputs::new(&outputs);
        let shared = value.resolve_shared(&mut inputs).unwrap();
        assert_eq!(Arc::strong_count(&shared), 2);
    }
}
