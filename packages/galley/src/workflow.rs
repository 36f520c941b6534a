//! Workflow algebra and content-addressed identity.
//!
//! A workflow is a value describing a computation: either an in-process
//! computation producing a serialisable value ([`value`]), or an external
//! computation producing a file or directory at a prescribed location
//! ([`path`], [`input`]). A sub-path of a directory-producing workflow can
//! itself be projected as a workflow ([`extract`]).
//!
//! Every workflow carries an [`Id`] computed once at construction: the
//! blake3 digest of the canonical encoding of its [description]. The
//! description mirrors the workflow but erases opaque primitive
//! implementations, so the identity depends only on hash-relevant shape.
//!
//! [description]: WorkflowDescription

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bon::Builder;
use color_eyre::{
    Result,
    eyre::{Context, OptionExt, bail, ensure},
};
use futures::{FutureExt, future::BoxFuture};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::{
    alloc::Requirement,
    fs,
    hash::Id,
    store::Store,
};

/// Metadata for a named primitive.
///
/// All fields participate in identity hashing; `version` is the author's
/// knob for invalidating previously cached results when the opaque
/// implementation changes behaviour.
#[derive(Clone, Eq, PartialEq, Debug, Builder, Serialize)]
pub struct PrimInfo {
    /// Stable name of the primitive, e.g. `"myproject.align"`.
    #[builder(into)]
    pub id: String,

    /// Implementation version.
    pub version: Option<u32>,

    /// CPU slots the primitive needs to run.
    #[builder(default = 1)]
    pub np: u32,

    /// Memory the primitive needs to run, in MB.
    #[builder(default = 100)]
    pub mem: u32,
}

/// An evaluated argument handed to a primitive.
///
/// Dependencies on path workflows are rendered as JSON strings holding the
/// absolute cache path; dependencies on value workflows are the cached
/// value itself.
#[derive(Clone, Debug)]
pub struct Arg {
    /// The application label, if the argument was labeled.
    pub label: Option<String>,

    /// The evaluated value.
    pub value: serde_json::Value,
}

/// The opaque implementation of a primitive.
///
/// Implementations never participate in hashing; only the [`PrimInfo`]
/// metadata does. Most primitives are async closures via
/// [`Expr::prim_fn`]:
///
/// ```ignore
/// let expr = Expr::prim_fn(info, |_args, env: Env| async move {
///     fs::write(env.dest().unwrap(), "ok").await?;
///     Ok(serde_json::Value::Null)
/// });
/// ```
pub trait Primitive: Send + Sync + 'static {
    /// Execute the primitive with its evaluated arguments.
    ///
    /// Path primitives must write their artifact at [`Env::dest`];
    /// value primitives return the value as JSON.
    fn run(&self, args: Vec<Arg>, env: Env) -> BoxFuture<'static, Result<serde_json::Value>>;
}

impl<F> Primitive for F
where
    F: Fn(Vec<Arg>, Env) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync + 'static,
{
    fn run(&self, args: Vec<Arg>, env: Env) -> BoxFuture<'static, Result<serde_json::Value>> {
        self(args, env)
    }
}

/// The run-time environment handed to a primitive.
#[derive(Clone, Debug)]
pub struct Env {
    id: Id,
    np: u32,
    mem: u32,
    dest: Option<PathBuf>,
    tmp: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
    store: Store,
}

impl Env {
    pub(crate) fn new(
        id: Id,
        np: u32,
        mem: u32,
        dest: Option<PathBuf>,
        store: &Store,
    ) -> Self {
        Self {
            tmp: store.tmp_path(&id),
            stdout: store.stdout_path(&id),
            stderr: store.stderr_path(&id),
            store: store.clone(),
            id,
            np,
            mem,
            dest,
        }
    }

    /// The identity of the workflow being executed.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// CPU slots granted to this execution.
    pub fn np(&self) -> u32 {
        self.np
    }

    /// Memory granted to this execution, in MB.
    pub fn mem(&self) -> u32 {
        self.mem
    }

    /// Where a path primitive must write its artifact.
    /// `None` for value primitives.
    pub fn dest(&self) -> Option<&Path> {
        self.dest.as_deref()
    }

    /// Open the captured-stdout file for appending.
    pub async fn stdout(&self) -> Result<tokio::fs::File> {
        fs::open_append(&self.stdout).await.context("open stdout")
    }

    /// Open the captured-stderr file for appending.
    pub async fn stderr(&self) -> Result<tokio::fs::File> {
        fs::open_append(&self.stderr).await.context("open stderr")
    }

    /// Acquire a fresh scratch file path inside the task's tmp directory.
    ///
    /// The file itself is not created; the path is unique per call and the
    /// whole tmp directory is removed when the task completes.
    pub async fn temp_file(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.tmp)
            .await
            .context("create tmp directory")?;
        Ok(self.tmp.join(Uuid::new_v4().to_string()))
    }

    /// Log a debug-level message against this execution.
    /// The message is also appended to the store's daily log.
    pub async fn debug(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::debug!(id = %self.id, "{msg}");
        if let Err(err) = self.store.log(format!("[{}] DEBUG {msg}", self.id)).await {
            warn!(error = ?err, "unable to append to store log");
        }
    }

    /// Log an info-level message against this execution.
    /// The message is also appended to the store's daily log.
    pub async fn info(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::info!(id = %self.id, "{msg}");
        if let Err(err) = self.store.log(format!("[{}] {msg}", self.id)).await {
            warn!(error = ?err, "unable to append to store log");
        }
    }

    /// Log an error-level message against this execution.
    /// The message is also appended to the store's daily log.
    pub async fn error(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::error!(id = %self.id, "{msg}");
        if let Err(err) = self.store.log(format!("[{}] ERROR {msg}", self.id)).await {
            warn!(error = ?err, "unable to append to store log");
        }
    }
}

/// The argument language of a workflow.
#[derive(Clone)]
pub enum Expr {
    /// A named primitive with an opaque implementation.
    Prim(PrimInfo, Arc<dyn Primitive>),

    /// Application of one expression to another, with an optional argument
    /// label that participates in hashing.
    App {
        f: Box<Expr>,
        x: Box<Expr>,
        label: Option<String>,
    },

    /// A string literal.
    String(String),

    /// An integer literal.
    Int(i64),

    /// A boolean literal.
    Bool(bool),

    /// A dependency on another workflow.
    Workflow(AnyWorkflow),

    /// An optional expression.
    Option(Option<Box<Expr>>),

    /// A sequence of expressions.
    List(Vec<Expr>),
}

struct FnPrim<F, Fut> {
    f: F,
    marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Primitive for FnPrim<F, Fut>
where
    F: Fn(Vec<Arg>, Env) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    fn run(&self, args: Vec<Arg>, env: Env) -> BoxFuture<'static, Result<serde_json::Value>> {
        (self.f)(args, env).boxed()
    }
}

impl Expr {
    /// A primitive expression.
    pub fn prim(info: PrimInfo, implementation: impl Primitive) -> Self {
        Self::Prim(info, Arc::new(implementation))
    }

    /// A primitive expression implemented by an async closure.
    ///
    /// Saves implementors the boxing that [`Primitive::run`] requires
    /// for object safety.
    pub fn prim_fn<F, Fut>(info: PrimInfo, f: F) -> Self
    where
        F: Fn(Vec<Arg>, Env) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self::Prim(
            info,
            Arc::new(FnPrim {
                f,
                marker: PhantomData,
            }),
        )
    }

    /// Apply `self` to an argument.
    pub fn app(self, x: Expr) -> Self {
        Self::App {
            f: Box::new(self),
            x: Box::new(x),
            label: None,
        }
    }

    /// Apply `self` to a labeled argument. The label participates in
    /// identity hashing: renaming a labeled argument changes identity.
    pub fn app_labeled(self, label: impl Into<String>, x: Expr) -> Self {
        Self::App {
            f: Box::new(self),
            x: Box::new(x),
            label: Some(label.into()),
        }
    }

    /// A string literal.
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// An integer literal.
    pub fn int(i: i64) -> Self {
        Self::Int(i)
    }

    /// A boolean literal.
    pub fn boolean(b: bool) -> Self {
        Self::Bool(b)
    }

    /// A dependency on another workflow.
    pub fn dep(w: impl Into<AnyWorkflow>) -> Self {
        Self::Workflow(w.into())
    }

    /// An optional expression.
    pub fn option(e: Option<Expr>) -> Self {
        Self::Option(e.map(Box::new))
    }

    /// A sequence of expressions.
    pub fn list(items: impl IntoIterator<Item = Expr>) -> Self {
        Self::List(items.into_iter().collect())
    }

    /// The canonical, implementation-erased projection used for hashing.
    pub fn description(&self) -> Description {
        match self {
            Self::Prim(info, _) => Description::Prim {
                id: info.id.clone(),
                version: info.version,
                np: info.np,
                mem: info.mem,
            },
            Self::App { f, x, label } => Description::App {
                f: Box::new(f.description()),
                x: Box::new(x.description()),
                label: label.clone(),
            },
            Self::String(s) => Description::String(s.clone()),
            Self::Int(i) => Description::Int(*i),
            Self::Bool(b) => Description::Bool(*b),
            Self::Workflow(w) => Description::Workflow(w.id().clone()),
            Self::Option(e) => Description::Option(e.as_ref().map(|e| Box::new(e.description()))),
            Self::List(items) => Description::List(items.iter().map(Expr::description).collect()),
        }
    }

    /// The resource requirement of the primitive at the head of the
    /// application spine. Expressions without a primitive head need no
    /// resources of their own.
    pub fn requirement(&self) -> Requirement {
        match self {
            Self::Prim(info, _) => Requirement {
                np: info.np,
                mem: info.mem,
            },
            Self::App { f, .. } => f.requirement(),
            _ => Requirement::NONE,
        }
    }

    /// Collect every workflow this expression depends on.
    pub(crate) fn deps(&self, out: &mut Vec<AnyWorkflow>) {
        match self {
            Self::Prim(..) | Self::String(_) | Self::Int(_) | Self::Bool(_) => {}
            Self::App { f, x, .. } => {
                f.deps(out);
                x.deps(out);
            }
            Self::Workflow(w) => out.push(w.clone()),
            Self::Option(e) => {
                if let Some(e) = e {
                    e.deps(out);
                }
            }
            Self::List(items) => {
                for item in items {
                    item.deps(out);
                }
            }
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.description().fmt(f)
    }
}

/// A mirror of [`Expr`] that drops opaque implementations and keeps only
/// hash-relevant shape. Serialising this canonically and digesting the
/// bytes yields the workflow identity.
#[derive(Clone, Eq, PartialEq, Debug, Serialize)]
pub enum Description {
    Prim {
        id: String,
        version: Option<u32>,
        np: u32,
        mem: u32,
    },
    App {
        f: Box<Description>,
        x: Box<Description>,
        label: Option<String>,
    },
    String(String),
    Int(i64),
    Bool(bool),
    Workflow(Id),
    Option(Option<Box<Description>>),
    List(Vec<Description>),
}

/// The description of a whole workflow. The variant tag participates in
/// the encoding, so a value workflow and a path workflow over the same
/// expression have distinct identities.
#[derive(Clone, Eq, PartialEq, Debug, Serialize)]
pub enum WorkflowDescription {
    Value(Description),
    Path(Description),
    Extract {
        dir: Box<WorkflowDescription>,
        path: Vec<String>,
    },
}

impl WorkflowDescription {
    /// Digest the canonical encoding into an identity.
    ///
    /// `serde_json` writes enum tags and struct fields in declaration
    /// order, so the encoding is stable across processes and machines.
    pub fn identity(&self) -> Id {
        let encoded = serde_json::to_vec(self).expect("encode description");
        Id::from_buffer(encoded)
    }
}

/// The variants of a workflow.
#[derive(Clone)]
pub enum WorkflowKind {
    /// An in-process computation producing a value; the result is
    /// serialised to the cache.
    Value(Expr),

    /// An external computation that writes a file or directory at a
    /// prescribed location.
    Path(Expr),

    /// A projection of a sub-path inside a directory-producing parent.
    /// Owns no cache entry of its own.
    Extract {
        dir: AnyWorkflow,
        path: Vec<String>,
    },
}

struct Node {
    id: Id,
    kind: WorkflowKind,
}

/// A workflow with its static type erased.
///
/// This is the currency of the store and the scheduler; typed
/// [`Workflow`] values erase to it cheaply (shared ownership).
#[derive(Clone)]
pub struct AnyWorkflow {
    node: Arc<Node>,
}

impl AnyWorkflow {
    fn new(kind: WorkflowKind) -> Self {
        let id = Self::describe_kind(&kind).identity();
        Self {
            node: Arc::new(Node { id, kind }),
        }
    }

    /// The content-addressed identity of this workflow.
    pub fn id(&self) -> &Id {
        &self.node.id
    }

    /// The variant of this workflow.
    pub fn kind(&self) -> &WorkflowKind {
        &self.node.kind
    }

    /// The canonical description of this workflow.
    pub fn description(&self) -> WorkflowDescription {
        Self::describe_kind(&self.node.kind)
    }

    fn describe_kind(kind: &WorkflowKind) -> WorkflowDescription {
        match kind {
            WorkflowKind::Value(expr) => WorkflowDescription::Value(expr.description()),
            WorkflowKind::Path(expr) => WorkflowDescription::Path(expr.description()),
            WorkflowKind::Extract { dir, path } => WorkflowDescription::Extract {
                dir: Box::new(dir.description()),
                path: path.clone(),
            },
        }
    }

    /// The resource requirement of this workflow's head primitive.
    /// Extracts need no resources.
    pub fn requirement(&self) -> Requirement {
        match &self.node.kind {
            WorkflowKind::Value(expr) | WorkflowKind::Path(expr) => expr.requirement(),
            WorkflowKind::Extract { .. } => Requirement::NONE,
        }
    }

    /// The workflows this workflow directly depends on.
    pub fn deps(&self) -> Vec<AnyWorkflow> {
        let mut out = Vec::new();
        match &self.node.kind {
            WorkflowKind::Value(expr) | WorkflowKind::Path(expr) => expr.deps(&mut out),
            WorkflowKind::Extract { dir, .. } => out.push(dir.clone()),
        }
        out
    }
}

impl fmt::Display for AnyWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id().fmt(f)
    }
}

impl fmt::Debug for AnyWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyWorkflow({})", self.id())
    }
}

/// A typed workflow.
///
/// For value workflows, `T` is the type the cached JSON deserialises to.
/// For path workflows, `T` is an [`Artifact`] marker ([`Dir`] or
/// [`File`]) describing what lands on disk.
pub struct Workflow<T> {
    inner: AnyWorkflow,
    marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Workflow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Workflow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Workflow({})", self.inner.id())
    }
}

impl<T> Workflow<T> {
    fn new(kind: WorkflowKind) -> Self {
        Self {
            inner: AnyWorkflow::new(kind),
            marker: PhantomData,
        }
    }

    /// The content-addressed identity of this workflow.
    pub fn id(&self) -> &Id {
        self.inner.id()
    }

    /// View the workflow with its static type erased.
    pub fn erased(&self) -> &AnyWorkflow {
        &self.inner
    }
}

impl<T> From<Workflow<T>> for AnyWorkflow {
    fn from(w: Workflow<T>) -> Self {
        w.inner
    }
}

impl<T> From<&Workflow<T>> for AnyWorkflow {
    fn from(w: &Workflow<T>) -> Self {
        w.inner.clone()
    }
}

impl From<&AnyWorkflow> for AnyWorkflow {
    fn from(w: &AnyWorkflow) -> Self {
        w.clone()
    }
}

/// Marker for path workflows producing a directory.
pub struct Dir;

/// Marker for path workflows producing a regular file.
pub struct File;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Dir {}
    impl Sealed for super::File {}
}

/// Marker trait for the on-disk shape of a path workflow.
///
/// Sealed: only [`Dir`] and [`File`] implement it, which is what makes
/// extract-over-value unrepresentable in the typed API.
pub trait Artifact: sealed::Sealed {}

impl Artifact for Dir {}
impl Artifact for File {}

/// Construct a workflow denoting an in-process computation.
///
/// The result of evaluating `expr` is serialised to the cache as JSON;
/// `T` is the type it deserialises to on [`eval`](crate::engine::Engine::eval).
pub fn value<T>(expr: Expr) -> Workflow<T> {
    Workflow::new(WorkflowKind::Value(expr))
}

/// Construct a workflow denoting an external computation that writes a
/// file or directory at its destination path.
pub fn path<P: Artifact>(expr: Expr) -> Workflow<P> {
    Workflow::new(WorkflowKind::Path(expr))
}

/// Project a sub-path of a directory-producing workflow as a workflow.
///
/// The projection shares the parent's cache entry: its cache path is the
/// parent's cache path joined with `segments`. Nested extracts flatten,
/// so `extract(extract(d, a), b)` and `extract(d, a ++ b)` have the same
/// identity.
///
/// Fails if `segments` is empty.
pub fn extract<P: Artifact>(
    dir: &Workflow<Dir>,
    segments: impl IntoIterator<Item = impl Into<String>>,
) -> Result<Workflow<P>> {
    let segments = segments.into_iter().map(Into::into).collect::<Vec<_>>();
    ensure!(!segments.is_empty(), "extract requires a non-empty path");
    ensure!(
        segments.iter().all(|s| !s.is_empty() && !s.contains('/')),
        "extract path segments must be single non-empty components"
    );

    // The typed API makes these unreachable; check anyway.
    let (dir, segments) = match dir.erased().kind() {
        WorkflowKind::Value(_) => bail!("cannot extract from a value workflow"),
        WorkflowKind::Path(_) => (dir.erased().clone(), segments),
        WorkflowKind::Extract { dir, path } => {
            let mut flattened = path.clone();
            flattened.extend(segments);
            (dir.clone(), flattened)
        }
    };

    Ok(Workflow::new(WorkflowKind::Extract {
        dir,
        path: segments,
    }))
}

/// Construct a workflow denoting a pre-existing file or directory outside
/// the store.
///
/// The identity covers the textual source path. Executing the workflow
/// verifies the source exists and materialises the cache entry as a
/// symlink to the absolute source, so extracts and downstream
/// dependencies compose uniformly.
pub fn input<P: Artifact>(source: impl Into<PathBuf>) -> Workflow<P> {
    let source = source.into();
    let info = PrimInfo::builder().id("galley.input").build();
    let expr = Expr::prim(info, run_input).app(Expr::string(source.to_string_lossy()));
    path(expr)
}

fn run_input(args: Vec<Arg>, env: Env) -> BoxFuture<'static, Result<serde_json::Value>> {
    Box::pin(async move {
        let source = args
            .first()
            .and_then(|arg| arg.value.as_str())
            .ok_or_eyre("input workflow is missing its source path")?;
        let source = std::path::absolute(source)
            .with_context(|| format!("absolutize input path: {source:?}"))?;
        ensure!(
            fs::exists(&source).await,
            "input path does not exist: {}",
            source.display()
        );

        let dest = env.dest().ok_or_eyre("input workflow has no destination")?;
        fs::symlink(&source, dest).await.context("link input")?;
        Ok(serde_json::Value::Null)
    })
}
