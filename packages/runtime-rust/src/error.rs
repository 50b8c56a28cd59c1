//! Error families of the runtime.
//!
//! Errors split into four families: validation (surfaced verbatim, never
//! retried), engine aggregates (per-engine causes with the fan-out semantics
//! of the proxy), session codes, and stream/driver I/O (anyhow-wrapped,
//! tears down the pipeline). Fatal invariant breaches get their own variant
//! and are never silently recovered.

use cachegrid_core::{CacheFlavor, DescriptorError, FlavorError, TtlError};

/// One engine's failure inside an aggregate.
#[derive(Debug, thiserror::Error)]
#[error("engine {engine}: {source}")]
pub struct EngineFailure {
    pub engine: String,
    #[source]
    pub source: anyhow::Error,
}

/// Aggregate errors raised by the engine proxy.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A fan-out write failed on at least one engine. Successful engines
    /// were compensated (the value was removed again), so the write is
    /// atomic from the caller's view.
    #[error("set failed on {}/{total} engines for {descriptor} (compensated)", causes.len())]
    WriteFailed {
        descriptor: String,
        total: usize,
        causes: Vec<EngineFailure>,
    },
    /// Every engine failed to remove the record.
    #[error("remove failed on every engine for {descriptor}")]
    RemoveFailed {
        descriptor: String,
        causes: Vec<EngineFailure>,
    },
    /// Every engine failed the read and none reported "absent".
    #[error("read failed on every engine for {descriptor}")]
    ReadFailed {
        descriptor: String,
        causes: Vec<EngineFailure>,
    },
    /// A record is present in the scope map but absent from every engine.
    /// This is an internal invariant breach, not a cache miss.
    #[error("record {descriptor} is mapped but absent from every engine")]
    Inconsistent { descriptor: String },
}

/// Inputs that violate the documented option schemas.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Flavor(#[from] FlavorError),
    #[error(transparent)]
    Ttl(#[from] TtlError),
    #[error("a record must live in at least one engine")]
    NoEngines,
    #[error("unknown engine: {name}")]
    UnknownEngine { name: String },
    #[error("engine name \"{name}\" is reserved")]
    ReservedEngineName { name: String },
    #[error("an engine named {name} is already registered")]
    DuplicateEngine { name: String },
    #[error("unknown persistence driver: {name}")]
    UnknownDriver { name: String },
    #[error("a driver named {name} is already registered")]
    DuplicateDriver { name: String },
    #[error("invalid backup name {name:?}: {reason}")]
    InvalidBackupName { name: String, reason: &'static str },
    #[error("{field} must be greater than zero")]
    ZeroTunable { field: &'static str },
    #[error("file path must be absolute: {path}")]
    PathNotAbsolute { path: String },
}

/// A manager-level process conflicting with the blocking flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("cache is busy {active}; cannot start {requested}")]
    Busy {
        active: &'static str,
        requested: &'static str,
    },
    #[error("cache is clearing; reads and writes are rejected")]
    Clearing,
}

/// Top-level error type of manager operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    State(#[from] StateError),
    /// Engine aggregates are shared between coalesced waiters, hence `Arc`.
    #[error(transparent)]
    Engine(#[from] std::sync::Arc<EngineError>),
    #[error(transparent)]
    Session(#[from] crate::session::SessionError),
    #[error("file {path} is {size} bytes, over the {limit}-byte limit")]
    FileTooLarge {
        path: String,
        size: u64,
        limit: u64,
    },
    #[error("file record not found for {path}")]
    FileNotFound { path: String },
    #[error("stream failure: {0}")]
    Stream(#[from] anyhow::Error),
    #[error("io failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    /// Flavor guard shared by the persistence entry points: only `kvs` and
    /// `files` may back up or restore.
    pub fn check_flavor_supported(name: &str) -> Result<CacheFlavor, ValidationError> {
        Ok(CacheFlavor::parse(name)?)
    }
}
