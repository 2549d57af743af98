#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod client;
mod compute;
mod context;
mod core;
mod engine;
mod error;
mod executor;
mod graph;
mod utils;
#[cfg(feature = "workflows")]
pub mod workflows;

pub use crate::client::Client;
pub use crate::compute::{Computable, InFlight};
pub use crate::context::{ArlExecute, Wrapped, arlexecute};
pub use crate::core::{Config, Mode};
pub use crate::engine::{Args, Delayed, Inputs, NodeId, Stage, Value};
pub use crate::error::{ExecError, TaskError};
pub use crate::executor::{Diagnostics, TaskExecution};
pub use crate::graph::Graph;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
