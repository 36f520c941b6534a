use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use color_eyre::Result;
use galley::{
    alloc::LocalAlloc,
    engine,
    logger::NullLogger,
    scheduler::{self, SkipReason, Trace},
    task::TaskId,
    workflow::{self, Env, Expr, File, PrimInfo, Workflow},
};
use pretty_assertions::assert_eq;

use crate::test_engine;

type Spans = Arc<Mutex<Vec<(Instant, Instant)>>>;

/// A path workflow that holds `np` CPU slots for a little while and
/// records the interval it was running.
fn busy(name: &str, np: u32, spans: Spans) -> Workflow<File> {
    let info = PrimInfo::builder().id(format!("test.busy.{name}")).np(np).build();
    workflow::path(Expr::prim_fn(info, move |_args, env: Env| {
        let spans = Arc::clone(&spans);
        async move {
            let start = Instant::now();
            tokio::time::sleep(Duration::from_millis(50)).await;
            galley::fs::write(env.dest().expect("dest"), "ok").await?;
            spans.lock().expect("spans lock").push((start, Instant::now()));
            Ok(serde_json::Value::Null)
        }
    }))
}

#[test_log::test(tokio::test)]
async fn saturating_tasks_serialize() -> Result<()> {
    let (_dir, engine) = test_engine().await;
    let spans: Spans = Arc::default();

    let first = busy("first", 2, Arc::clone(&spans));
    let second = busy("second", 2, Arc::clone(&spans));

    let mut dag = engine::materialize(first.erased())?;
    let second_dag = engine::materialize(second.erased())?;
    let second_task = second_dag
        .task(&TaskId::from(second.id()))
        .expect("second task")
        .clone();
    dag.add_task(second_task);

    let alloc = LocalAlloc::new(2, 4096);
    let traces = scheduler::run(engine.store(), &alloc, Arc::new(NullLogger), &dag).await?;
    for trace in traces.values() {
        assert!(trace.is_success(), "both tasks should run: {trace:?}");
    }

    let mut spans = spans.lock().expect("spans lock").clone();
    spans.sort_by_key(|(start, _)| *start);
    assert_eq!(spans.len(), 2);
    let (_, first_end) = spans[0];
    let (second_start, _) = spans[1];
    assert!(
        first_end <= second_start,
        "tasks requiring every CPU slot must not overlap"
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn oversized_requests_are_skipped() -> Result<()> {
    let (_dir, engine) = test_engine().await;
    let spans: Spans = Arc::default();
    let oversized = busy("oversized", 3, spans);

    let dag = engine::materialize(oversized.erased())?;
    let alloc = LocalAlloc::new(2, 4096);
    let traces = scheduler::run(engine.store(), &alloc, Arc::new(NullLogger), &dag).await?;

    match traces.get(&TaskId::from(oversized.id())) {
        Some(Trace::Skipped(SkipReason::AllocationError(message))) => {
            assert!(message.contains("CPU slots"), "message: {message}");
        }
        other => panic!("expected allocation skip, got {other:?}"),
    }
    assert!(!galley::fs::exists(engine.store().cache_path(oversized.erased())).await);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn memory_is_a_separate_budget() -> Result<()> {
    let (_dir, engine) = test_engine().await;

    let hungry = workflow::path::<File>(Expr::prim_fn(
        PrimInfo::builder().id("test.hungry").np(1).mem(8192).build(),
        |_args, env: Env| async move {
            galley::fs::write(env.dest().expect("dest"), "ok").await?;
            Ok(serde_json::Value::Null)
        },
    ));

    let dag = engine::materialize(hungry.erased())?;
    let alloc = LocalAlloc::new(4, 4096);
    let traces = scheduler::run(engine.store(), &alloc, Arc::new(NullLogger), &dag).await?;

    match traces.get(&TaskId::from(hungry.id())) {
        Some(Trace::Skipped(SkipReason::AllocationError(message))) => {
            assert!(message.contains("memory"), "message: {message}");
        }
        other => panic!("expected allocation skip, got {other:?}"),
    }
    Ok(())
}
