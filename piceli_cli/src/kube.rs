//! The minimal cluster surface the executor drives.
//!
//! Implementations classify their failures as transient (worth retrying
//! with backoff) or terminal (abort the level) via the corresponding
//! `ErrorKind`s. `get` reports absence as `Ok(None)` rather than an error,
//! and `delete` tolerates already-gone objects.

use async_trait::async_trait;

use super::node::Node;
use super::{CanonicalObject, Identity};
use super::{Error, ErrorKind, Result};

#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Fetch the live object, `None` when the cluster has no such object.
    async fn get(&self, id: &Identity) -> Result<Option<CanonicalObject>>;

    async fn create(&self, id: &Identity, body: &Node) -> Result<()>;

    /// Apply a json merge patch.
    async fn patch(&self, id: &Identity, patch: &Node) -> Result<()>;

    /// Swap the whole object for `body` (delete-then-create semantics).
    async fn replace(&self, id: &Identity, body: &Node) -> Result<()>;

    async fn delete(&self, id: &Identity) -> Result<()>;
}

/// Should the executor retry after this error?
pub fn is_transient(e: &Error) -> bool {
    match e {
        Error(ErrorKind::TransientTransport(_, _), _) => true,
        _ => false,
    }
}
