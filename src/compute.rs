use std::sync::Arc;
use std::thread::JoinHandle;

use crate::engine::{Delayed, NodeId, Value};
use crate::error::ExecError;
use crate::graph::Graph;

/// Anything that can be handed to [`ArlExecute::compute`](crate::ArlExecute::compute).
///
/// The output keeps the shape of the input: a single value yields a single
/// result, a `Vec` yields a `Vec`, a tuple yields a tuple. Every leaf reports
/// its own outcome, so one failed branch does not hide the results of the
/// others.
pub trait Computable {
    type Output;

    /// Pushes the nodes that have to be computed before [`collect`] can
    /// succeed.
    ///
    /// [`collect`]: Computable::collect
    fn roots(&self, roots: &mut Vec<NodeId>);

    /// Reads the results back out of the graph.
    fn collect(&self, graph: &Graph) -> Self::Output;
}

impl<T> Computable for Value<T>
where
    T: Send + Sync + 'static,
{
    type Output = Result<Arc<T>, ExecError>;

    fn roots(&self, roots: &mut Vec<NodeId>) {
        roots.extend(self.node_id());
    }

    fn collect(&self, graph: &Graph) -> Self::Output {
        match self {
            Value::Ready(value) => Ok(value.clone()),
            Value::Pending(delayed) => graph.output(delayed.id),
        }
    }
}

impl<T> Computable for Delayed<T>
where
    T: Send + Sync + 'static,
{
    type Output = Result<Arc<T>, ExecError>;

    fn roots(&self, roots: &mut Vec<NodeId>) {
        roots.push(self.id);
    }

    fn collect(&self, graph: &Graph) -> Self::Output {
        graph.output(self.id)
    }
}

impl<C> Computable for Vec<C>
where
    C: Computable,
{
    type Output = Vec<C::Output>;

    fn roots(&self, roots: &mut Vec<NodeId>) {
        for item in self {
            item.roots(roots);
        }
    }

    fn collect(&self, graph: &Graph) -> Self::Output {
        self.iter().map(|item| item.collect(graph)).collect()
    }
}

macro_rules! impl_computable {
    ($($C:ident),+) => {
        #[allow(non_snake_case)]
        impl<$($C),+> Computable for ($($C,)+)
        where
            $($C: Computable),+
        {
            type Output = ($($C::Output,)+);

            fn roots(&self, roots: &mut Vec<NodeId>) {
                let ($($C,)+) = self;
                $($C.roots(roots);)+
            }

            fn collect(&self, graph: &Graph) -> Self::Output {
                let ($($C,)+) = self;
                ($($C.collect(graph),)+)
            }
        }
    };
}

impl_computable!(A);
impl_computable!(A, B);
impl_computable!(A, B, C);
impl_computable!(A, B, C, D);
impl_computable!(A, B, C, D, E);
impl_computable!(A, B, C, D, E, F);

/// A computation running in the background, returned by
/// [`ArlExecute::compute_async`](crate::ArlExecute::compute_async).
///
/// Dropping the handle detaches the computation; its results still land in
/// the graph and are picked up by later computations.
#[must_use = "dropping the handle detaches the computation"]
pub struct InFlight<O> {
    handle: JoinHandle<Result<O, ExecError>>,
}

impl<O> InFlight<O> {
    pub(crate) fn new(handle: JoinHandle<Result<O, ExecError>>) -> Self {
        Self { handle }
    }

    /// Returns `true` once the computation has finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until the computation finishes and returns its results.
    pub fn wait(self) -> Result<O, ExecError> {
        self.handle
            .join()
            .map_err(|_| ExecError::Spawn("the coordinator panicked".into()))?
    }
}

impl<O> std::fmt::Debug for InFlight<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("finished", &self.is_finished())
            .finish()
    }
}
