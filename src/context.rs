use std::any::type_name;
use std::borrow::Cow;
use std::sync::{Arc, LazyLock, Mutex, PoisonError, RwLock};

use crate::client::Client;
use crate::compute::{Computable, InFlight};
use crate::core::{Config, Dynamic, Mode};
use crate::engine::{Args, Body, Delayed, Gather, Inputs, Stage, Value, guarded};
use crate::error::ExecError;
use crate::executor::{self, Diagnostics};
use crate::graph::Graph;

/// The execution context pipelines are written against.
///
/// A context owns a task graph and, between [`set_client`] and [`close`], an
/// execution client. Pipeline functions are wrapped with [`execute`]; what a
/// call does then depends on the client's mode:
///
/// - in sync mode the function runs right away and the call returns a
///   [`Value::Ready`];
/// - in deferred mode the call is recorded as a task node and returns a
///   [`Value::Pending`], which runs when it is passed to [`compute`].
///
/// ```rust
/// use arlexecute::{ArlExecute, Config, Value};
///
/// fn add(a: &i32, b: &i32) -> anyhow::Result<i32> {
///     Ok(a + b)
/// }
///
/// let arl = ArlExecute::new();
/// arl.set_client(Config::deferred().with_workers(2)).unwrap();
///
/// let x = arl.execute(add).call((Value::new(1), Value::new(2))).unwrap();
/// let y = arl.execute(add).call((x.clone(), x)).unwrap();
/// assert!(!y.is_ready());
///
/// let y = arl.compute(&y).unwrap().unwrap();
/// assert_eq!(*y, 6);
/// arl.close();
/// ```
///
/// [`set_client`]: ArlExecute::set_client
/// [`close`]: ArlExecute::close
/// [`execute`]: ArlExecute::execute
/// [`compute`]: ArlExecute::compute
pub struct ArlExecute {
    graph: Arc<Graph>,
    client: RwLock<Option<Arc<Client>>>,
    diagnostics: Arc<Mutex<Diagnostics>>,
}

impl ArlExecute {
    /// Creates an unconfigured context with an empty graph.
    pub fn new() -> Self {
        Self {
            graph: Arc::new(Graph::new()),
            client: RwLock::new(None),
            diagnostics: Arc::new(Mutex::new(Diagnostics::default())),
        }
    }

    /// Brings up an execution client for `config`.
    ///
    /// Fails with [`ExecError::AlreadyInitialized`] if a client is already
    /// running; it has to be closed first.
    pub fn set_client(&self, config: Config) -> Result<(), ExecError> {
        let mut slot = self.client.write().unwrap_or_else(PoisonError::into_inner);

        if slot.is_some() {
            return Err(ExecError::AlreadyInitialized);
        }

        let client = Client::start(config)?;

        tracing::info!(
            mode = %client.mode(),
            n_workers = client.n_workers(),
            "execution client started"
        );

        *slot = Some(Arc::new(client));
        Ok(())
    }

    /// Shuts the client down and cancels any computation still using it.
    /// Results committed so far are kept. Closing an unconfigured context
    /// does nothing.
    pub fn close(&self) {
        let client = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(client) = client {
            client.cancel();
            tracing::info!(
                mode = %client.mode(),
                uptime = ?client.uptime(),
                "execution client closed"
            );
        }
    }

    /// The live client.
    pub fn client(&self) -> Result<Arc<Client>, ExecError> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ExecError::Lifecycle)
    }

    pub fn is_configured(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn mode(&self) -> Result<Mode, ExecError> {
        Ok(self.client()?.mode())
    }

    /// Number of workers of the live client, zero in sync mode.
    pub fn n_workers(&self) -> Result<usize, ExecError> {
        Ok(self.client()?.n_workers())
    }

    pub fn config(&self) -> Result<Config, ExecError> {
        Ok(self.client()?.config().clone())
    }

    /// The task graph of this context. Its `Display` implementation renders
    /// a Mermaid flowchart.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Wraps a pipeline function so that calling it respects the configured
    /// mode.
    pub fn execute<F>(&self, stage: F) -> Wrapped<'_, F> {
        Wrapped {
            arl: self,
            stage: Arc::new(stage),
            name: Cow::Borrowed(short_name(type_name::<F>())),
        }
    }

    /// Declares a node whose task is bound later with [`Wrapped::define`].
    /// Computing it before that fails with [`ExecError::UndefinedNode`].
    pub fn placeholder<T>(&self, name: impl Into<Cow<'static, str>>) -> Delayed<T> {
        Delayed::new(self.graph.placeholder(name.into()))
    }

    /// Places a concrete value into the graph, so that many tasks can share
    /// it without each of them capturing a copy.
    pub fn scatter<T>(&self, value: T) -> Result<Value<T>, ExecError>
    where
        T: Send + Sync + 'static,
    {
        match self.mode()? {
            Mode::Sync => Ok(Value::new(value)),
            Mode::Deferred => {
                let id = self.graph.record_ready("scatter".into(), Arc::new(value));
                Ok(Value::Pending(Delayed::new(id)))
            }
        }
    }

    /// Combines a list of values into a single value holding all of them.
    pub fn gather<T>(&self, values: Vec<Value<T>>) -> Result<Value<Vec<Arc<T>>>, ExecError>
    where
        T: Send + Sync + 'static,
    {
        match self.mode()? {
            Mode::Sync => {
                let items = values
                    .iter()
                    .map(|value| value.collect(&self.graph))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::new(items))
            }
            Mode::Deferred => {
                let body = Body {
                    dependencies: values.iter().filter_map(Value::node_id).collect(),
                    task: Box::new(Gather { items: values }),
                };
                let id = self.graph.record("gather".into(), body)?;
                Ok(Value::Pending(Delayed::new(id)))
            }
        }
    }

    /// Computes `roots` and blocks until every one of them has a result.
    ///
    /// The outer `Result` reports problems with the computation as a whole:
    /// no client, a cycle, an undefined placeholder or cancellation. Each
    /// root then carries its own outcome, so a failed task only fails the
    /// roots that depend on it.
    pub fn compute<C>(&self, roots: &C) -> Result<C::Output, ExecError>
    where
        C: Computable,
    {
        let client = self.client()?;
        run(&self.graph, &client, &self.diagnostics, roots)
    }

    /// Starts computing `roots` on a separate coordinator thread and returns
    /// right away.
    pub fn compute_async<C>(&self, roots: C) -> Result<InFlight<C::Output>, ExecError>
    where
        C: Computable + Send + 'static,
        C::Output: Send + 'static,
    {
        let client = self.client()?;
        let graph = self.graph.clone();
        let diagnostics = self.diagnostics.clone();

        let handle = std::thread::Builder::new()
            .name(format!("{}-compute", client.config().thread_name))
            .spawn(move || run(&graph, &client, &diagnostics, &roots))
            .map_err(|e| ExecError::Spawn(e.to_string()))?;

        Ok(InFlight::new(handle))
    }

    /// Starts computing `roots` in the background and hands them back, so
    /// that later computations find the results already committed.
    pub fn persist<C>(&self, roots: C) -> Result<C, ExecError>
    where
        C: Computable + Clone + Send + 'static,
        C::Output: Send + 'static,
    {
        // Detached, the results are read back through the graph.
        drop(self.compute_async(roots.clone())?);
        Ok(roots)
    }

    /// Runs `func` once on every worker of the pool, passing the worker
    /// index. In sync mode it runs once on the calling thread.
    pub fn run_on_workers<R, F>(&self, func: F) -> Result<Vec<R>, ExecError>
    where
        F: Fn(usize) -> R + Sync,
        R: Send,
    {
        Ok(self.client()?.broadcast(func))
    }

    /// Task timings of the most recently finished computation.
    pub fn last_diagnostics(&self) -> Diagnostics {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for ArlExecute {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ArlExecute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArlExecute")
            .field("nodes", &self.graph.len())
            .field("client", &self.client().ok())
            .finish()
    }
}

fn run<C>(
    graph: &Graph,
    client: &Client,
    diagnostics: &Mutex<Diagnostics>,
    roots: &C,
) -> Result<C::Output, ExecError>
where
    C: Computable,
{
    if client.mode() == Mode::Deferred {
        let mut ids = Vec::new();
        roots.roots(&mut ids);

        let report = executor::compute(graph, client, &ids)?;
        *diagnostics.lock().unwrap_or_else(PoisonError::into_inner) = report;
    }

    Ok(roots.collect(graph))
}

/// `my_crate::stages::predict<f64>` becomes `predict`.
fn short_name(full: &'static str) -> &'static str {
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::")
        .find(|segment| !segment.starts_with('{'))
        .unwrap_or(path)
}

/// The process-wide context, created on first use.
pub fn arlexecute() -> &'static ArlExecute {
    static ARL: LazyLock<ArlExecute> = LazyLock::new(ArlExecute::new);
    &ARL
}

/// A pipeline function bound to a context by [`ArlExecute::execute`].
pub struct Wrapped<'a, F> {
    arl: &'a ArlExecute,
    stage: Arc<F>,
    name: Cow<'static, str>,
}

impl<F> Wrapped<'_, F> {
    /// Labels the nodes recorded by this wrapper.
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Calls the function, or records the call, depending on the mode.
    ///
    /// In sync mode pending arguments must already hold a result: they fail
    /// with [`ExecError::UnresolvedDependency`] otherwise, and with
    /// [`ExecError::UpstreamFailure`] if they hold an error.
    pub fn call<M>(&self, args: F::Args) -> Result<Value<F::Output>, ExecError>
    where
        F: Stage<M>,
        M: 'static,
    {
        match self.arl.mode()? {
            Mode::Sync => self.run::<M>(&args).map(Value::new),
            Mode::Deferred => {
                let body = Body::call::<F, M>(self.stage.clone(), args);
                let id = self.arl.graph.record(self.name.clone(), body)?;
                Ok(Value::Pending(Delayed::new(id)))
            }
        }
    }

    /// Binds this call as the task of a node created by
    /// [`ArlExecute::placeholder`]. A node listing itself among its own
    /// arguments is rejected with [`ExecError::GraphCycle`].
    ///
    /// In sync mode the function runs right away and its outcome is stored
    /// in the node.
    pub fn define<M>(&self, target: Delayed<F::Output>, args: F::Args) -> Result<(), ExecError>
    where
        F: Stage<M>,
        M: 'static,
    {
        let graph = &self.arl.graph;

        match self.arl.mode()? {
            Mode::Deferred => graph.define(target.id, Body::call::<F, M>(self.stage.clone(), args)),
            Mode::Sync => {
                let node = graph.node(target.id)?;

                if args.dependencies().contains(&target.id) {
                    return Err(ExecError::GraphCycle {
                        node: node.name.to_string(),
                    });
                }
                if node.is_defined() {
                    return Err(ExecError::AlreadyDefined {
                        node: node.name.to_string(),
                    });
                }

                let outcome = self
                    .run::<M>(&args)
                    .map(|output| Arc::new(output) as Dynamic);

                graph.define(target.id, Body::call::<F, M>(self.stage.clone(), args))?;
                node.commit(outcome).map(|_| ())
            }
        }
    }

    fn run<M>(&self, args: &F::Args) -> Result<F::Output, ExecError>
    where
        F: Stage<M>,
    {
        let inputs = self
            .arl
            .graph
            .inputs(&self.name, &args.dependencies())?;

        guarded(&self.name, || {
            self.stage.invoke(args, &mut Inputs::new(&inputs))
        })
    }
}
