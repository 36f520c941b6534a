//! `galley`: a reproducible workflow engine.
//!
//! Computations are described as typed, composable workflows and
//! executed with aggressive memoization on disk. A workflow denotes
//! either an in-process computation producing a value, or an external
//! computation producing a file or directory at a predetermined path;
//! workflows compose through dependencies and sub-path projection.
//!
//! Results live in a content-addressed [store](store::Store) keyed by
//! workflow [identity](hash::Id): a hash-named cache entry is atomically
//! either absent or complete. The [scheduler](scheduler::run) traverses
//! the dependency DAG concurrently, deduplicates requests for the same
//! identity, gates execution on a resource [allocator](alloc::Allocator)
//! and reports events to a pluggable [logger](logger::Logger).

pub mod alloc;
pub mod dag;
pub mod engine;
pub mod fs;
pub mod hash;
pub mod logger;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod workflow;
