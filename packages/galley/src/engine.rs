//! Executing workflows against a store.
//!
//! [`Job`] is the workflow-backed instance of the scheduler's task
//! domain; [`Engine`] is the high-level entry point wiring a store, an
//! allocator and a logger together behind `build`/`eval`.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{
    Result,
    eyre::{Context, Report, bail},
};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::{
    alloc::{Allocator, Grant, LocalAlloc, Requirement},
    dag::Dag,
    fs,
    logger::{Logger, NullLogger},
    scheduler::{self, Trace},
    store::Store,
    task::{Task, TaskError, TaskId},
    workflow::{AnyWorkflow, Arg, Artifact, Env, Expr, Workflow, WorkflowKind},
};

/// A workflow scheduled as a task.
///
/// The shared config of the domain is the [`Store`] the run executes
/// against.
#[derive(Clone)]
pub struct Job {
    w: AnyWorkflow,
}

impl Job {
    /// The workflow behind this task.
    pub fn workflow(&self) -> &AnyWorkflow {
        &self.w
    }

    fn failed(&self, err: Report) -> TaskError {
        TaskError::Failed {
            id: TaskId::from(self.w.id()),
            message: format!("{err:#}"),
        }
    }

    /// Produce the artifact for a value or path workflow.
    ///
    /// Scrubs leftovers of earlier failed attempts, evaluates the
    /// expression in a fresh [`Env`], then requires the build location
    /// to be populated and promotes it into the cache atomically.
    async fn produce(
        &self,
        expr: &Expr,
        is_path: bool,
        grant: &Grant,
        store: &Store,
    ) -> Result<(), TaskError> {
        let id = self.w.id();
        let build = store.build_path(id);
        let tmp = store.tmp_path(id);

        let scrub = async {
            fs::remove_file(store.stdout_path(id)).await?;
            fs::remove_file(store.stderr_path(id)).await?;
            fs::remove_any(&build).await?;
            fs::remove_dir_all(&tmp).await?;
            fs::create_dir_all(&tmp).await
        };
        scrub.await.map_err(|err| self.failed(err))?;

        let env = Env::new(
            id.clone(),
            grant.np(),
            grant.mem(),
            is_path.then(|| build.clone()),
            store,
        );

        // A panicking primitive is an error trace, not a crashed run.
        let evaluated = AssertUnwindSafe(evaluate(store.clone(), expr.clone(), env))
            .catch_unwind()
            .await;
        let value = match evaluated {
            Err(_panic) => {
                return Err(TaskError::Exception {
                    id: TaskId::from(id),
                });
            }
            Ok(Err(err)) => return Err(self.failed(err)),
            Ok(Ok(value)) => value,
        };

        if !is_path {
            let encoded =
                serde_json::to_vec(&value).map_err(|err| self.failed(Report::new(err)))?;
            fs::write(&build, encoded)
                .await
                .map_err(|err| self.failed(err))?;
        }

        if !fs::exists(&build).await {
            return Err(TaskError::MissingArtifact {
                id: TaskId::from(id),
            });
        }

        fs::remove_dir_all(&tmp).await.map_err(|err| self.failed(err))?;
        store.promote(id).await.map_err(|err| self.failed(err))?;
        store
            .record_created(&self.w)
            .await
            .map_err(|err| self.failed(err))?;
        Ok(())
    }
}

impl Task for Job {
    type Config = Store;

    fn id(&self) -> TaskId {
        TaskId::from(self.w.id())
    }

    fn requirement(&self) -> Requirement {
        self.w.requirement()
    }

    async fn is_done(&self, store: &Store) -> bool {
        let cached = fs::exists(store.cache_path(&self.w)).await;
        if cached {
            if let Err(err) = store.record_used(&self.w).await {
                warn!(error = ?err, workflow = %self.w, "unable to record reuse");
            }
        }
        cached
    }

    async fn perform(&self, grant: &Grant, store: &Store) -> Result<(), TaskError> {
        match self.w.kind() {
            WorkflowKind::Value(expr) => self.produce(expr, false, grant, store).await,
            WorkflowKind::Path(expr) => self.produce(expr, true, grant, store).await,
            WorkflowKind::Extract { dir, path } => {
                // The parent was built by our dependency; all that can go
                // wrong is the projected path not existing inside it.
                if !fs::exists(store.cache_path(&self.w)).await {
                    return Err(TaskError::InvalidSelect {
                        dir: TaskId::from(dir.id()),
                        path: path.clone(),
                    });
                }
                if let Err(err) = store.record_used(&self.w).await {
                    warn!(error = ?err, workflow = %self.w, "unable to record reuse");
                }
                Ok(())
            }
        }
    }
}

/// Evaluate a workflow argument expression to a JSON value.
///
/// Applications unwind to the primitive at the head of the spine, whose
/// arguments are the evaluated operands in application order.
/// Dependencies render as their cached value (value workflows) or their
/// absolute cache path (path workflows and extracts).
fn evaluate(
    store: Store,
    expr: Expr,
    env: Env,
) -> futures::future::BoxFuture<'static, Result<serde_json::Value>> {
    Box::pin(async move {
        match expr {
            Expr::String(s) => Ok(serde_json::Value::String(s)),
            Expr::Int(i) => Ok(serde_json::Value::from(i)),
            Expr::Bool(b) => Ok(serde_json::Value::Bool(b)),
            Expr::Option(None) => Ok(serde_json::Value::Null),
            Expr::Option(Some(inner)) => evaluate(store, *inner, env).await,
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(evaluate(store.clone(), item, env.clone()).await?);
                }
                Ok(serde_json::Value::Array(values))
            }
            Expr::Workflow(w) => render_dep(&store, &w).await,
            Expr::Prim(_, implementation) => implementation.run(Vec::new(), env).await,
            Expr::App { f, x, label } => {
                let mut rev = vec![(label, *x)];
                let mut head = *f;
                while let Expr::App { f, x, label } = head {
                    rev.push((label, *x));
                    head = *f;
                }
                let Expr::Prim(_, implementation) = head else {
                    bail!("only primitives can be applied to arguments");
                };

                let mut args = Vec::with_capacity(rev.len());
                for (label, x) in rev.into_iter().rev() {
                    let value = evaluate(store.clone(), x, env.clone()).await?;
                    args.push(Arg { label, value });
                }
                implementation.run(args, env).await
            }
        }
    })
}

async fn render_dep(store: &Store, w: &AnyWorkflow) -> Result<serde_json::Value> {
    match w.kind() {
        WorkflowKind::Value(_) => {
            let cached = fs::must_read_buffered(store.cache_path(w))
                .await
                .context("read cached dependency value")?;
            serde_json::from_slice(&cached).context("decode cached dependency value")
        }
        WorkflowKind::Path(_) | WorkflowKind::Extract { .. } => Ok(serde_json::Value::String(
            store.cache_path(w).to_string_lossy().into_owned(),
        )),
    }
}

/// Materialise the DAG of a workflow's transitive dependencies.
pub fn materialize(root: &AnyWorkflow) -> Result<Dag<Job>> {
    let mut nodes = Vec::new();
    let mut seen = BTreeSet::new();
    let mut stack = vec![root.clone()];
    while let Some(w) = stack.pop() {
        if !seen.insert(TaskId::from(w.id())) {
            continue;
        }
        stack.extend(w.deps());
        nodes.push(w);
    }

    let mut dag = Dag::new();
    for w in &nodes {
        dag.add_task(Job { w: w.clone() });
    }
    for w in &nodes {
        let task = TaskId::from(w.id());
        for dep in w.deps() {
            dag.add_dep(&task, &TaskId::from(dep.id()))
                .context("link dependency")?;
        }
    }
    Ok(dag)
}

/// Executes workflows: a store, an allocator and a logger.
#[derive(Clone)]
pub struct Engine<A: Allocator = LocalAlloc> {
    store: Store,
    alloc: A,
    logger: Arc<dyn Logger>,
}

impl Engine {
    /// An engine over the store with a machine-sized allocator and no
    /// logging.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            alloc: LocalAlloc::detect(),
            logger: Arc::new(NullLogger),
        }
    }
}

impl<A: Allocator> Engine<A> {
    /// Replace the allocator.
    pub fn with_allocator<B: Allocator>(self, alloc: B) -> Engine<B> {
        Engine {
            store: self.store,
            alloc,
            logger: self.logger,
        }
    }

    /// Replace the logger.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// The store this engine executes against.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Build the workflow and everything it depends on.
    ///
    /// Fails if the target's trace is not successful; failures of the
    /// target task surface as the typed [`TaskError`].
    #[instrument(name = "Engine::build", skip_all)]
    pub async fn build(&self, w: impl Into<AnyWorkflow>) -> Result<()> {
        let w = w.into();
        debug!(workflow = %w, "building workflow");

        let dag = materialize(&w)?;
        let traces =
            scheduler::run(&self.store, &self.alloc, Arc::clone(&self.logger), &dag).await?;

        match traces.get(&TaskId::from(w.id())) {
            Some(trace) if trace.is_success() => Ok(()),
            Some(Trace::Run {
                outcome: Err(err), ..
            }) => Err(Report::new(err.clone())),
            Some(Trace::Skipped(reason)) => bail!("workflow {w} was skipped: {reason}"),
            Some(Trace::Run { .. }) => Ok(()),
            None => bail!("workflow {w} produced no trace"),
        }
    }

    /// Build a value workflow and return its deserialised result.
    #[instrument(name = "Engine::eval", skip_all)]
    pub async fn eval<T: DeserializeOwned>(&self, w: &Workflow<T>) -> Result<T> {
        self.build(w).await?;
        let cached = fs::must_read_buffered(self.store.cache_path(w.erased()))
            .await
            .context("read cached value")?;
        serde_json::from_slice(&cached).context("deserialize cached value")
    }

    /// Build a path workflow and return the location of its artifact.
    #[instrument(name = "Engine::eval_path", skip_all)]
    pub async fn eval_path<P: Artifact>(&self, w: &Workflow<P>) -> Result<PathBuf> {
        self.build(w).await?;
        Ok(self.store.cache_path(w.erased()))
    }
}
