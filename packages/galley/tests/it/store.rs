use color_eyre::Result;
use galley::{
    store::{HistoryTag, MalformedStore, Store},
    workflow::{self, Dir, Expr, File, Workflow},
};
use pretty_assertions::assert_eq;

use crate::{temporary_directory, temporary_store};

#[test_log::test(tokio::test)]
async fn init_creates_the_layout() -> Result<()> {
    let (_dir, path) = temporary_directory();
    let store = Store::init(path.join("store")).await?;

    for sub in ["cache", "build", "tmp", "stdout", "stderr", "logs", "history"] {
        assert!(
            galley::fs::is_dir(store.base().join(sub)).await,
            "{sub} should exist"
        );
    }

    // Re-opening a complete store succeeds.
    Store::init(path.join("store")).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn init_rejects_malformed_stores() -> Result<()> {
    let (_dir, path) = temporary_directory();
    let base = path.join("store");
    let store = Store::init(&base).await?;

    galley::fs::remove_dir_all(store.base().join("history")).await?;

    let err = Store::init(&base).await.unwrap_err();
    let malformed = err
        .downcast_ref::<MalformedStore>()
        .expect("error should be MalformedStore");
    assert_eq!(malformed.missing, "history");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn history_is_an_append_only_record() -> Result<()> {
    let (_dir, store) = temporary_store().await;
    let w: Workflow<String> = workflow::value(Expr::string("x"));
    let w = w.erased();

    assert_eq!(store.history(w).await?, vec![]);

    store.record_created(w).await?;
    store.record_used(w).await?;
    store.record_used(w).await?;

    let events = store.history(w).await?;
    let tags = events.iter().map(|(_, tag)| *tag).collect::<Vec<_>>();
    assert_eq!(
        tags,
        vec![HistoryTag::Created, HistoryTag::Used, HistoryTag::Used]
    );

    // Later events extend the history without disturbing the prefix.
    store.record_used(w).await?;
    let extended = store.history(w).await?;
    assert_eq!(&extended[..events.len()], &events[..]);
    assert_eq!(extended.len(), events.len() + 1);

    // Timestamps are monotonic within one writer.
    for pair in extended.windows(2) {
        assert!(pair[0].0 <= pair[1].0);
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn record_created_rejects_extracts() -> Result<()> {
    let (_dir, store) = temporary_store().await;
    let dir: Workflow<Dir> = workflow::path(Expr::string("tree"));
    let sub: Workflow<File> = workflow::extract(&dir, ["a"])?;

    assert!(store.record_created(sub.erased()).await.is_err());

    // record_used on an extract lands in the parent's history.
    store.record_used(sub.erased()).await?;
    let events = store.history(dir.erased()).await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, HistoryTag::Used);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn extract_cache_paths_compose() -> Result<()> {
    let (_dir, store) = temporary_store().await;
    let dir: Workflow<Dir> = workflow::path(Expr::string("tree"));
    let sub: Workflow<File> = workflow::extract(&dir, ["sub", "file"])?;

    let composed = store.cache_path(sub.erased());
    assert_eq!(
        composed,
        store.cache_path(dir.erased()).join("sub").join("file")
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn promotion_is_a_rename_into_cache() -> Result<()> {
    let (_dir, store) = temporary_store().await;
    let w: Workflow<File> = workflow::path(Expr::string("artifact"));
    let id = w.id();

    galley::fs::write(store.build_path(id), "ok").await?;
    store.promote(id).await?;

    let cached = galley::fs::read_buffered_utf8(store.cache_path(w.erased())).await?;
    assert_eq!(cached.as_deref(), Some("ok"));
    assert!(!galley::fs::exists(store.build_path(id)).await);

    assert_eq!(store.cached().await?, vec![id.clone()]);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn daily_log_appends() -> Result<()> {
    let (_dir, store) = temporary_store().await;
    store.log("first message").await?;
    store.log("second message").await?;

    let mut entries = tokio::fs::read_dir(store.base().join("logs")).await?;
    let entry = entries.next_entry().await?.expect("one log file");
    let name = entry.file_name().to_string_lossy().into_owned();
    assert!(name.ends_with(".log"), "daily log name: {name}");

    let content = galley::fs::read_buffered_utf8(entry.path()).await?.unwrap();
    assert_eq!(content, "first message\nsecond message\n");
    Ok(())
}
