use crate::engine::{Inputs, NodeId, Value};

/// A tuple of [`Value`]s used as the positional arguments of a call.
///
/// This trait is implemented for tuples of up to eight values. It lets the
/// dispatcher find the task nodes a call depends on without looking at any
/// concrete data.
pub trait Args: Send + Sync + 'static {
    /// Returns the [`NodeId`] of every pending argument, in argument order.
    fn dependencies(&self) -> Vec<NodeId>;
}

/// A pipeline function that can be wrapped by
/// [`ArlExecute::execute`](crate::ArlExecute::execute).
///
/// Implemented for every `Fn(&A, &B, ...) -> anyhow::Result<R>` of up to
/// eight arguments. The `M` parameter only tells the arities apart and is
/// always inferred.
pub trait Stage<M>: Send + Sync + 'static {
    /// The argument tuple accepted by the wrapped call.
    type Args: Args;
    /// The concrete output type of this stage.
    type Output: Send + Sync + 'static;

    /// Resolves the arguments against the outputs of the pending ones and
    /// calls the function.
    fn invoke<'a>(&self, args: &'a Self::Args, inputs: &mut Inputs<'a>)
    -> anyhow::Result<Self::Output>;
}

macro_rules! impl_stage {
    ($($A:ident),*) => {
        #[allow(non_snake_case, unused_mut)]
        impl<$($A),*> Args for ($(Value<$A>,)*)
        where
            $($A: Send + Sync + 'static),*
        {
            fn dependencies(&self) -> Vec<NodeId> {
                let ($($A,)*) = self;
                let mut dependencies = Vec::new();
                $(dependencies.extend($A.node_id());)*
                dependencies
            }
        }

        #[allow(non_snake_case, unused_variables)]
        impl<Func, R, $($A),*> Stage<fn($($A,)*) -> R> for Func
        where
            Func: Fn($(&$A),*) -> anyhow::Result<R> + Send + Sync + 'static,
            R: Send + Sync + 'static,
            $($A: Send + Sync + 'static),*
        {
            type Args = ($(Value<$A>,)*);
            type Output = R;

            fn invoke<'a>(
                &self,
                args: &'a Self::Args,
                inputs: &mut Inputs<'a>,
            ) -> anyhow::Result<R> {
                let ($($A,)*) = args;
                $(let $A = $A.resolve(inputs)?;)*
                (self)($($A),*)
            }
        }
    };
}

impl_stage!();
impl_stage!(A);
impl_stage!(A, B);
impl_stage!(A, B, C);
impl_stage!(A, B, C, D);
impl_stage!(A, B, C, D, E);
impl_stage!(A, B, C, D, E, F);
impl_stage!(A, B, C, D, E, F, G);
impl_stage!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use petgraph::graph::NodeIndex;

    use super::*;
    use crate::core::{Dynamic, GraphId};
    use crate::engine::Delayed;

    fn add(a: &i64, b: &i64) -> anyhow::Result<i64> {
        Ok(a + b)
    }

    fn invoke<M, S: Stage<M>>(stage: &S, args: &S::Args, outputs: &[Dynamic]) -> S::Output {
        let mut inputs = Inputs::new(outputs);
        stage.invoke(args, &mut inputs).unwrap()
    }

    #[test]
    fn test_dependencies_in_argument_order() {
        let graph = GraphId::next();
        let a: Value<i64> = Value::Pending(Delayed::new(NodeId::new(graph, NodeIndex::new(4))));
        let b: Value<String> = Value::new("b".into());
        let c: Value<u8> = Value::Pending(Delayed::new(NodeId::new(graph, NodeIndex::new(1))));

        let deps = (a, b, c).dependencies();
        assert_eq!(deps.iter().map(NodeId::index).collect::<Vec<_>>(), vec![4, 1]);
    }

    #[test]
    fn test_invoke_mixed_arguments() {
        let graph = GraphId::next();
        let pending: Value<i64> =
            Value::Pending(Delayed::new(NodeId::new(graph, NodeIndex::new(0))));
        let args = (Value::new(40_i64), pending);
        let outputs = [Arc::new(2_i64) as Dynamic];

        assert_eq!(invoke(&add, &args, &outputs), 42);
    }

    #[test]
    fn test_invoke_nullary() {
        let answer = || -> anyhow::Result<u32> { Ok(42) };
        assert_eq!(invoke(&answer, &(), &[]), 42);
    }
}
