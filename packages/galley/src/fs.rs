//! Filesystem operations tailored to `galley`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using.
//!
//! All store IO goes through here so that error context and trace events
//! are uniform across the crate.

use std::fmt::Debug as StdDebug;
use std::path::Path;

use color_eyre::{Result, eyre::Context};
use tap::TapFallible;
use tokio::io::AsyncWriteExt;
use tracing::{instrument, trace};

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: impl AsRef<Path> + StdDebug) -> Result<()> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Remove the directory and all its contents.
/// Removing a directory that does not exist is not an error.
#[instrument]
pub async fn remove_dir_all(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            trace!(?path, "removed directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            trace!(?path, "removed directory (already removed)");
            Ok(())
        }
        Err(err) => Err(err).context(format!("remove directory: {path:?}")),
    }
}

/// Remove a file or symlink.
/// Removing a file that does not exist is not an error.
#[instrument]
pub async fn remove_file(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            trace!(?path, "removed file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove file: {path:?}")),
    }
}

/// Remove whatever lives at the path, whether file, symlink or directory.
/// Removing a path that does not exist is not an error.
#[instrument]
pub async fn remove_any(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => remove_dir_all(path).await,
        Ok(_) => remove_file(path).await,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("stat for removal: {path:?}")),
    }
}

/// Rename a file or folder, overwriting the destination if it already exists.
#[instrument]
pub async fn rename(src: impl AsRef<Path> + StdDebug, dst: impl AsRef<Path> + StdDebug) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    tokio::fs::rename(src, dst)
        .await
        .with_context(|| format!("rename: {src:?} -> {dst:?}"))
        .tap_ok(|_| trace!(?src, ?dst, "rename"))
}

/// Write the provided file content to disk, creating parent directories.
#[instrument(skip(content))]
pub async fn write(path: impl AsRef<Path> + StdDebug, content: impl AsRef<[u8]>) -> Result<()> {
    let path = path.as_ref();
    let content = content.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Append a single line to the file, creating it (and parent directories)
/// if needed. The newline is added here; `line` must not contain one.
#[instrument(skip(line))]
pub async fn append_line(path: impl AsRef<Path> + StdDebug, line: impl AsRef<str>) -> Result<()> {
    let path = path.as_ref();
    let line = line.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open for append: {path:?}"))?;
    file.write_all(format!("{line}\n").as_bytes())
        .await
        .with_context(|| format!("append to file: {path:?}"))
        .tap_ok(|_| trace!(?path, "append line"))
}

/// Buffer the file content from disk.
/// A missing file is `Ok(None)`.
#[instrument]
pub async fn read_buffered(path: impl AsRef<Path> + StdDebug) -> Result<Option<Vec<u8>>> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk.
/// Unlike [`read_buffered`], this function returns an error if the file
/// doesn't exist.
#[instrument]
pub async fn must_read_buffered(path: impl AsRef<Path> + StdDebug) -> Result<Vec<u8>> {
    let path = path.as_ref();
    tokio::fs::read(path)
        .await
        .with_context(|| format!("read file: {path:?}"))
}

/// Buffer the file content from disk and parse it as UTF8.
/// A missing file is `Ok(None)`.
#[instrument]
pub async fn read_buffered_utf8(path: impl AsRef<Path> + StdDebug) -> Result<Option<String>> {
    let path = path.as_ref();
    match tokio::fs::read_to_string(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file as string");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Open a file with append access, creating it if needed.
#[instrument]
pub async fn open_append(path: impl AsRef<Path> + StdDebug) -> Result<tokio::fs::File> {
    let path = path.as_ref();
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open for append: {path:?}"))
        .tap_ok(|_| trace!(?path, "open append"))
}

/// Create a symlink at `link` pointing at `original`.
///
/// Only Unix symlinks are supported; on other platforms this fails with
/// an error rather than silently copying.
#[instrument]
pub async fn symlink(
    original: impl AsRef<Path> + StdDebug,
    link: impl AsRef<Path> + StdDebug,
) -> Result<()> {
    let (original, link) = (original.as_ref(), link.as_ref());
    #[cfg(unix)]
    {
        tokio::fs::symlink(original, link)
            .await
            .with_context(|| format!("symlink {original:?} -> {link:?}"))
            .tap_ok(|_| trace!(?original, ?link, "symlink"))
    }
    #[cfg(not(unix))]
    {
        color_eyre::eyre::bail!("symlinks are not supported on this platform")
    }
}

/// Check whether the path exists.
///
/// Returns `false` if there is an error checking whether the path exists.
/// Note that this sort of check is prone to race conditions - if you plan
/// to do anything with the file after checking, you should probably
/// just try to do the operation and handle the case of the file not existing.
#[instrument]
pub async fn exists(path: impl AsRef<Path> + StdDebug) -> bool {
    tokio::fs::try_exists(path).await.is_ok_and(|found| found)
}

/// Get the standard metadata for the path.
/// A missing path is `Ok(None)`.
#[instrument]
pub async fn metadata(path: impl AsRef<Path> + StdDebug) -> Result<Option<std::fs::Metadata>> {
    let path = path.as_ref();
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("stat metadata: {path:?}")),
    }
}

/// Return whether the path represents a directory.
///
/// Returns `false` if the directory doesn't exist
/// or if there is an error checking the metadata;
/// to differentiate this case use [`metadata`].
#[instrument]
pub async fn is_dir(path: impl AsRef<Path> + StdDebug) -> bool {
    metadata(path)
        .await
        .is_ok_and(|m| m.is_some_and(|m| m.is_dir()))
}

/// Return whether the path represents a normal file.
///
/// Returns `false` if the file doesn't exist
/// or if there is an error checking the metadata;
/// to differentiate this case use [`metadata`].
#[instrument]
pub async fn is_file(path: impl AsRef<Path> + StdDebug) -> bool {
    metadata(path)
        .await
        .is_ok_and(|m| m.is_some_and(|m| m.is_file()))
}
