//! Certificate cache
//!
//! [`CertCache`] is the storage capability used by certificate management:
//! opaque names map to opaque byte blobs, a missing entry is reported as
//! [`CacheError::Miss`] rather than as a failure, and every call takes a
//! [`Context`] that lets the caller stop waiting.
//!
//! Two variants are provided: [`ObjectCache`] on top of an
//! [`ObjectStore`](crate::store::ObjectStore) and [`DirCache`] on the local
//! filesystem.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::store::StoreError;

pub mod context;
pub mod dir;
pub mod object;

pub use context::Context;
pub use dir::DirCache;
pub use object::{ObjectCache, DEFAULT_PREFIX};

/// Default limit on detached calls running at once, per cache
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// Outcome of a cache call other than success
#[derive(Error, Debug)]
pub enum CacheError {
    /// Nothing is stored under the requested name
    #[error("cache miss")]
    Miss,

    /// The caller cancelled the context
    #[error("context canceled")]
    Cancelled,

    /// The context deadline passed before the call finished
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The backing object store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Local filesystem failure
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Name cannot be used as a cache key
    #[error("invalid cache key: {0:?}")]
    InvalidKey(String),

    /// The cache was constructed with missing parameters
    #[error("cache configuration error: {0}")]
    Config(String),

    /// The background task running the call panicked
    #[error("cache task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// No more calls can be started
    #[error("cache is closed")]
    Closed,
}

impl CacheError {
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::Miss)
    }

    /// True for both explicit cancellation and deadline expiry
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled | CacheError::DeadlineExceeded)
    }
}

/// Storage used by certificate management to persist certificate bundles
#[async_trait]
pub trait CertCache: Send + Sync {
    /// Read the blob stored under `name`, or [`CacheError::Miss`]
    async fn fetch(&self, ctx: &Context, name: &str) -> Result<Vec<u8>, CacheError>;

    /// Store `data` under `name`, replacing any previous value
    async fn store(&self, ctx: &Context, name: &str, data: &[u8]) -> Result<(), CacheError>;

    /// Remove `name`. Removing a missing name succeeds.
    async fn delete(&self, ctx: &Context, name: &str) -> Result<(), CacheError>;
}

/// Run `call` on its own task and wait until it finishes or `ctx` is done.
///
/// When `ctx` wins the task keeps running to completion in the background;
/// only the caller stops waiting for it.
pub(crate) async fn detach_until_done<T, F>(ctx: &Context, call: F) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, CacheError>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(call);

    tokio::select! {
        biased;
        joined = handle => joined?,
        err = ctx.done() => Err(err),
    }
}

/// [`detach_until_done`] holding a slot of `in_flight` for the whole call.
///
/// A context that is already done never starts the call, and waiting for a
/// slot is raced against the context as well.
pub(crate) async fn detach_bounded<T, F>(
    ctx: &Context,
    in_flight: &Arc<Semaphore>,
    call: F,
) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, CacheError>> + Send + 'static,
    T: Send + 'static,
{
    if let Some(err) = ctx.err() {
        return Err(err);
    }

    let permit = tokio::select! {
        biased;
        permit = Arc::clone(in_flight).acquire_owned() => {
            permit.map_err(|_| CacheError::Closed)?
        }
        err = ctx.done() => return Err(err),
    };

    detach_until_done(ctx, async move {
        let result = call.await;
        drop(permit);
        result
    })
    .await
}
