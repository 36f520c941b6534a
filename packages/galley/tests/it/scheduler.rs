use std::sync::{Arc, Mutex};

use color_eyre::{Result, eyre::eyre};
use galley::{
    alloc::LocalAlloc,
    engine,
    logger::{Event, Logger},
    scheduler::{self, SkipReason, Trace},
    store::HistoryTag,
    task::{TaskError, TaskId},
    workflow::{self, Dir, Env, Expr, File, PrimInfo, Workflow},
};
use pretty_assertions::assert_eq;

use crate::{emit_file, test_engine};

/// Captures every event for later inspection.
#[derive(Default)]
struct RecordingLogger {
    events: Mutex<Vec<Event>>,
}

impl RecordingLogger {
    fn events(&self) -> Vec<Event> {
        self.events.lock().expect("events lock").clone()
    }

    fn started(&self, id: &TaskId) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, Event::Started(task) if task == id))
            .count()
    }
}

impl Logger for RecordingLogger {
    fn event(&self, _: jiff::Timestamp, event: Event) {
        self.events.lock().expect("events lock").push(event);
    }
}

#[test_log::test(tokio::test)]
async fn linear_chain_builds_bottom_up() -> Result<()> {
    let (_dir, engine) = test_engine().await;
    let a = emit_file("a", "ok", None);
    let b = emit_file("b", "ok", Some(&a));
    let c = emit_file("c", "ok", Some(&b));

    let dag = engine::materialize(c.erased())?;
    let alloc = LocalAlloc::new(4, 4096);
    let logger = Arc::new(RecordingLogger::default());
    let traces =
        scheduler::run(engine.store(), &alloc, logger.clone() as Arc<dyn Logger>, &dag).await?;

    for w in [&a, &b, &c] {
        let cached = galley::fs::read_buffered_utf8(engine.store().cache_path(w.erased())).await?;
        assert_eq!(cached.as_deref(), Some("ok"), "workflow {w:?}");

        match traces.get(&TaskId::from(w.id())) {
            Some(Trace::Run { outcome: Ok(()), .. }) => {}
            other => panic!("expected successful run for {w:?}, got {other:?}"),
        }
    }

    // Dependencies finish before their dependents start.
    for (task, on) in [(&c, &b), (&b, &a)] {
        let Some(Trace::Run { start, .. }) = traces.get(&TaskId::from(task.id())) else {
            unreachable!("checked above");
        };
        let Some(Trace::Run { end, .. }) = traces.get(&TaskId::from(on.id())) else {
            unreachable!("checked above");
        };
        assert!(end <= start, "dependency should end before dependent starts");
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn failures_skip_dependents_without_aborting() -> Result<()> {
    let (_dir, engine) = test_engine().await;

    let failing = workflow::path::<File>(Expr::prim_fn(
        PrimInfo::builder().id("test.fails").build(),
        |_args, _env: Env| async move { Err(eyre!("no disk space left")) },
    ));
    let dependent = emit_file("dependent", "ok", Some(&failing));
    let unrelated = emit_file("unrelated", "ok", None);

    let mut dag = engine::materialize(dependent.erased())?;
    let unrelated_dag = engine::materialize(unrelated.erased())?;
    let unrelated_task = unrelated_dag
        .task(&TaskId::from(unrelated.id()))
        .expect("unrelated task")
        .clone();
    dag.add_task(unrelated_task);

    let alloc = LocalAlloc::new(4, 4096);
    let logger = Arc::new(RecordingLogger::default());
    let traces =
        scheduler::run(engine.store(), &alloc, logger.clone() as Arc<dyn Logger>, &dag).await?;

    match traces.get(&TaskId::from(failing.id())) {
        Some(Trace::Run {
            outcome: Err(TaskError::Failed { message, .. }),
            ..
        }) => assert!(message.contains("no disk space left")),
        other => panic!("expected failed run, got {other:?}"),
    }
    assert_eq!(
        traces.get(&TaskId::from(dependent.id())),
        Some(&Trace::Skipped(SkipReason::MissingDep))
    );
    assert!(!galley::fs::exists(engine.store().cache_path(dependent.erased())).await);

    // The unrelated branch still ran.
    match traces.get(&TaskId::from(unrelated.id())) {
        Some(Trace::Run { outcome: Ok(()), .. }) => {}
        other => panic!("expected unrelated branch to run, got {other:?}"),
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn second_run_skips_everything() -> Result<()> {
    let (_dir, engine) = test_engine().await;
    let a = emit_file("a", "ok", None);
    let b = emit_file("b", "ok", Some(&a));

    let dag = engine::materialize(b.erased())?;
    let alloc = LocalAlloc::new(4, 4096);

    let first = Arc::new(RecordingLogger::default());
    scheduler::run(engine.store(), &alloc, first.clone() as Arc<dyn Logger>, &dag).await?;
    assert_eq!(first.started(&TaskId::from(a.id())), 1);
    assert_eq!(first.started(&TaskId::from(b.id())), 1);

    let second = Arc::new(RecordingLogger::default());
    let traces =
        scheduler::run(engine.store(), &alloc, second.clone() as Arc<dyn Logger>, &dag).await?;

    for w in [&a, &b] {
        assert_eq!(
            traces.get(&TaskId::from(w.id())),
            Some(&Trace::Skipped(SkipReason::DoneAlready))
        );
        assert_eq!(second.started(&TaskId::from(w.id())), 0);

        let tags = engine
            .store()
            .history(w.erased())
            .await?
            .into_iter()
            .map(|(_, tag)| tag)
            .collect::<Vec<_>>();
        assert_eq!(tags, vec![HistoryTag::Created, HistoryTag::Used]);
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn shared_dependencies_execute_once() -> Result<()> {
    let (_dir, engine) = test_engine().await;
    let base = emit_file("base", "ok", None);
    let left = emit_file("left", "ok", Some(&base));
    let right = emit_file("right", "ok", Some(&base));

    let top = workflow::path::<File>(
        Expr::prim_fn(
            PrimInfo::builder().id("test.join").build(),
            |_args, env: Env| async move {
                galley::fs::write(env.dest().expect("dest"), "ok").await?;
                Ok(serde_json::Value::Null)
            },
        )
        .app(Expr::dep(&left))
        .app(Expr::dep(&right)),
    );

    let dag = engine::materialize(top.erased())?;
    let alloc = LocalAlloc::new(4, 4096);
    let logger = Arc::new(RecordingLogger::default());
    scheduler::run(engine.store(), &alloc, logger.clone() as Arc<dyn Logger>, &dag).await?;

    assert_eq!(logger.started(&TaskId::from(base.id())), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn cyclic_graphs_are_rejected_before_running() -> Result<()> {
    let (_dir, engine) = test_engine().await;
    let a = emit_file("a", "ok", None);
    let b = emit_file("b", "ok", Some(&a));

    let mut dag = engine::materialize(b.erased())?;
    dag.add_dep(&TaskId::from(a.id()), &TaskId::from(b.id()))
        .expect("both tasks present");

    let alloc = LocalAlloc::new(4, 4096);
    let err = scheduler::run(engine.store(), &alloc, Arc::new(RecordingLogger::default()) as Arc<dyn Logger>, &dag)
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<galley::dag::CyclicDag>().is_some());

    // Nothing ran: the store has no cache entries.
    assert_eq!(engine.store().cached().await?, vec![]);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn extracts_project_into_the_parent_cache() -> Result<()> {
    let (_dir, engine) = test_engine().await;

    let tree = workflow::path::<Dir>(Expr::prim_fn(
        PrimInfo::builder().id("test.tree").build(),
        |_args, env: Env| async move {
            let dest = env.dest().expect("dest").to_path_buf();
            galley::fs::write(dest.join("sub").join("file"), "leaf").await?;
            Ok(serde_json::Value::Null)
        },
    ));
    let leaf: Workflow<File> = workflow::extract(&tree, ["sub", "file"])?;

    let path = engine.eval_path(&leaf).await?;
    assert_eq!(
        path,
        engine.store().cache_path(tree.erased()).join("sub").join("file")
    );
    let content = galley::fs::read_buffered_utf8(&path).await?;
    assert_eq!(content.as_deref(), Some("leaf"));

    // The extract owns no cache entry of its own.
    assert_eq!(engine.store().cached().await?, vec![tree.id().clone()]);

    // Projecting through the parent recorded a use.
    let tags = engine
        .store()
        .history(tree.erased())
        .await?
        .into_iter()
        .map(|(_, tag)| tag)
        .collect::<Vec<_>>();
    assert!(tags.contains(&HistoryTag::Used));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn missing_extract_paths_are_invalid_selections() -> Result<()> {
    let (_dir, engine) = test_engine().await;

    let tree = workflow::path::<Dir>(Expr::prim_fn(
        PrimInfo::builder().id("test.tree").build(),
        |_args, env: Env| async move {
            let dest = env.dest().expect("dest").to_path_buf();
            galley::fs::write(dest.join("present"), "here").await?;
            Ok(serde_json::Value::Null)
        },
    ));
    let missing: Workflow<File> = workflow::extract(&tree, ["absent"])?;

    let err = engine.build(&missing).await.unwrap_err();
    match err.downcast_ref::<TaskError>() {
        Some(TaskError::InvalidSelect { path, .. }) => {
            assert_eq!(path, &vec!["absent".to_string()]);
        }
        other => panic!("expected InvalidSelect, got {other:?}"),
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn values_round_trip_through_the_cache() -> Result<()> {
    let (_dir, engine) = test_engine().await;

    let base: Workflow<i64> = workflow::value(Expr::prim_fn(
        PrimInfo::builder().id("test.forty-one").build(),
        |_args, _env: Env| async move { Ok(serde_json::Value::from(41)) },
    ));

    let incremented: Workflow<i64> = workflow::value(
        Expr::prim_fn(
            PrimInfo::builder().id("test.increment").build(),
            |args: Vec<galley::workflow::Arg>, _env: Env| async move {
                let value = args
                    .first()
                    .and_then(|arg| arg.value.as_i64())
                    .expect("dependency renders as its cached value");
                Ok(serde_json::Value::from(value + 1))
            },
        )
        .app(Expr::dep(&base)),
    );

    assert_eq!(engine.eval(&incremented).await?, 42);

    // Evaluating again reuses the cache.
    assert_eq!(engine.eval(&incremented).await?, 42);
    let tags = engine
        .store()
        .history(incremented.erased())
        .await?
        .into_iter()
        .map(|(_, tag)| tag)
        .collect::<Vec<_>>();
    assert_eq!(tags[0], HistoryTag::Created);
    assert!(tags.contains(&HistoryTag::Used));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn inputs_materialise_as_links() -> Result<()> {
    let (_dir, engine) = test_engine().await;
    let (_src_dir, src_path) = crate::temporary_directory();
    let source = src_path.join("reference.txt");
    galley::fs::write(&source, "reference data").await?;

    let input: Workflow<File> = workflow::input(&source);
    let path = engine.eval_path(&input).await?;
    let content = galley::fs::read_buffered_utf8(&path).await?;
    assert_eq!(content.as_deref(), Some("reference data"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn missing_inputs_fail_with_their_path() -> Result<()> {
    let (_dir, engine) = test_engine().await;
    let input: Workflow<File> = workflow::input("/definitely/not/a/real/path");

    let err = engine.build(&input).await.unwrap_err();
    match err.downcast_ref::<TaskError>() {
        Some(TaskError::Failed { message, .. }) => {
            assert!(message.contains("/definitely/not/a/real/path"));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn panicking_primitives_become_error_traces() -> Result<()> {
    let (_dir, engine) = test_engine().await;

    let panicking = workflow::path::<File>(Expr::prim_fn(
        PrimInfo::builder().id("test.panics").build(),
        |_args, _env: Env| async move { panic!("primitive exploded") },
    ));

    let err = engine.build(&panicking).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TaskError>(),
        Some(TaskError::Exception { .. })
    ));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn producers_must_populate_their_build_location() -> Result<()> {
    let (_dir, engine) = test_engine().await;

    let lazy = workflow::path::<File>(Expr::prim_fn(
        PrimInfo::builder().id("test.writes-nothing").build(),
        |_args, _env: Env| async move { Ok(serde_json::Value::Null) },
    ));

    let err = engine.build(&lazy).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TaskError>(),
        Some(TaskError::MissingArtifact { .. })
    ));
    assert!(!galley::fs::exists(engine.store().cache_path(lazy.erased())).await);
    Ok(())
}
