//! Concurrent, memoized traversal of a task DAG.
//!
//! The traversal is depth-first from every vertex: a task first asks
//! whether it is already done, then resolves its dependencies
//! concurrently, then requests resources and performs. Every resolution
//! goes through a per-run memoization table of in-flight completion
//! handles, so at most one execution exists per identity within a run:
//! two references to the same task share one handle.
//!
//! Task failures never abort the run: they are recorded in the returned
//! trace map and unrelated branches continue. The only fatal condition
//! is a cyclic graph, rejected before execution begins.

use std::collections::BTreeMap;
use std::sync::Arc;

use color_eyre::{Result, eyre::Report};
use dashmap::DashMap;
use derive_more::Display;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use jiff::Timestamp;
use tracing::instrument;

use crate::{
    alloc::Allocator,
    dag::Dag,
    logger::{Event, Logger},
    task::{Task, TaskError, TaskId},
};

/// Why a task was not performed.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
pub enum SkipReason {
    /// The artifact was already in the store.
    #[display("already done")]
    DoneAlready,

    /// At least one dependency did not succeed.
    #[display("a dependency did not succeed")]
    MissingDep,

    /// The allocator refused the task's resource request.
    #[display("allocation error: {_0}")]
    AllocationError(String),
}

/// The per-task outcome record of a run.
#[derive(Clone, PartialEq, Debug)]
pub enum Trace {
    /// The task was performed.
    Run {
        /// When all dependencies had succeeded.
        ready: Timestamp,
        /// When resources were granted and `perform` began.
        start: Timestamp,
        /// When `perform` returned.
        end: Timestamp,
        /// How `perform` ended.
        outcome: Result<(), TaskError>,
    },

    /// The task was not performed.
    Skipped(SkipReason),
}

impl Trace {
    /// Whether the task's artifact can be relied on: it either ran
    /// successfully or was already done.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Trace::Run { outcome: Ok(()), .. } | Trace::Skipped(SkipReason::DoneAlready)
        )
    }
}

type TraceFuture = Shared<BoxFuture<'static, Trace>>;

struct RunCtx<T: Task, A: Allocator> {
    dag: Dag<T>,
    config: T::Config,
    alloc: A,
    logger: Arc<dyn Logger>,
    memo: DashMap<TaskId, TraceFuture>,
}

impl<T: Task, A: Allocator> RunCtx<T, A> {
    fn emit(&self, event: Event) {
        self.logger.event(Timestamp::now(), event);
    }
}

/// Run every task in the graph, dependencies first, and return a trace
/// per task.
///
/// Rejects cyclic graphs before executing anything (the report
/// downcasts to [`CyclicDag`](crate::dag::CyclicDag)).
#[instrument(skip_all, fields(tasks = dag.len()))]
pub async fn run<T, A>(
    config: &T::Config,
    alloc: &A,
    logger: Arc<dyn Logger>,
    dag: &Dag<T>,
) -> Result<BTreeMap<TaskId, Trace>>
where
    T: Task,
    A: Allocator,
{
    dag.toposort().map_err(Report::new)?;

    let ctx = Arc::new(RunCtx {
        dag: dag.clone(),
        config: config.clone(),
        alloc: alloc.clone(),
        logger,
        memo: DashMap::new(),
    });

    ctx.emit(Event::Init {
        tasks: ctx.dag.ids().cloned().collect(),
        deps: ctx.dag.edges(),
    });

    let ids = ctx.dag.ids().cloned().collect::<Vec<_>>();
    let traces = join_all(ids.iter().map(|id| resolve(&ctx, id))).await;
    Ok(ids.into_iter().zip(traces).collect())
}

/// Look up or create the completion handle for a task.
///
/// The handle is shared: every caller for the same identity observes
/// the same execution.
fn resolve<T: Task, A: Allocator>(ctx: &Arc<RunCtx<T, A>>, id: &TaskId) -> TraceFuture {
    if let Some(found) = ctx.memo.get(id) {
        return found.value().clone();
    }
    let fut = execute(Arc::clone(ctx), id.clone()).boxed().shared();
    ctx.memo.entry(id.clone()).or_insert(fut).value().clone()
}

async fn execute<T: Task, A: Allocator>(ctx: Arc<RunCtx<T, A>>, id: TaskId) -> Trace {
    let task = ctx
        .dag
        .task(&id)
        .expect("resolved task is in the dag")
        .clone();

    if task.is_done(&ctx.config).await {
        ctx.emit(Event::Skipped {
            task: id,
            reason: SkipReason::DoneAlready,
        });
        return Trace::Skipped(SkipReason::DoneAlready);
    }

    let deps = ctx.dag.deps_of(&id);
    let dep_traces = join_all(deps.iter().map(|dep| resolve(&ctx, dep))).await;
    if dep_traces.iter().any(|trace| !trace.is_success()) {
        ctx.emit(Event::Skipped {
            task: id,
            reason: SkipReason::MissingDep,
        });
        return Trace::Skipped(SkipReason::MissingDep);
    }

    let ready = Timestamp::now();
    ctx.emit(Event::Ready(id.clone()));

    let grant = match ctx.alloc.request(task.requirement()).await {
        Ok(grant) => grant,
        Err(err) => {
            let reason = SkipReason::AllocationError(err.message);
            ctx.emit(Event::Skipped {
                task: id,
                reason: reason.clone(),
            });
            return Trace::Skipped(reason);
        }
    };

    let start = Timestamp::now();
    ctx.emit(Event::Started(id.clone()));

    let outcome = task.perform(&grant, &ctx.config).await;
    drop(grant);

    let end = Timestamp::now();
    ctx.emit(Event::Ended {
        task: id,
        outcome: outcome.clone(),
    });

    Trace::Run {
        ready,
        start,
        end,
        outcome,
    }
}
