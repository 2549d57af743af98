//! Task nodes and the typed handles used to wire them together.
//!
//! Under the hood the graph is entirely type-erased: every output is stored as
//! `Arc<dyn Any + Send + Sync>`. The [`Value<T>`] and [`Delayed<T>`] handles
//! carry the output type in `PhantomData`, so the compiler checks that a
//! stage receives exactly the type its upstream stage produces, and the
//! [`Stage`] implementations perform the downcasts when the task finally runs.

mod node;
mod stage;
mod value;

pub use crate::engine::stage::{Args, Stage};
pub use crate::engine::value::{Delayed, Inputs, NodeId, Value};

pub(crate) use crate::engine::node::{Body, Constant, Gather, Outcome, TaskNode, guarded};
