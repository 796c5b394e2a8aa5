//! The rollback journal: an append-only in-memory log of pre-images.
//!
//! Every mutating action records the live object as read immediately
//! before the mutation (`None` for creations). On abort the journal
//! replays newest-first: creations are deleted, everything else is
//! restored from its pre-image. Replay is best effort; step failures are
//! reported and do not stop the remaining steps.
//!
//! Nothing is persisted across invocations. A crashed run leaves the
//! cluster partially applied and the next run reconciles it through the
//! normal diff path.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Mutex;

use super::kube::ClusterTransport;
use super::node::Node;
use super::{CanonicalObject, Error, ErrorKind, Identity};

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum ActionKind {
    Create,
    Patch,
    Replace,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Create => "CREATE",
            ActionKind::Patch => "PATCH",
            ActionKind::Replace => "REPLACE",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct JournalEntry {
    pub identity: Identity,
    /// the live object as read just before mutating; `None` for CREATE
    pub pre_image: Option<CanonicalObject>,
    pub action: ActionKind,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
pub struct Journal {
    entries: Mutex<Vec<JournalEntry>>,
}

impl Journal {
    pub fn new() -> Journal {
        Journal::default()
    }

    pub fn append(&self, identity: Identity, pre_image: Option<CanonicalObject>, action: ActionKind) {
        let entry = JournalEntry {
            identity,
            pre_image,
            action,
            at: Utc::now(),
        };
        debug!("journal: {} {}", entry.action, entry.identity);
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.push(entry);
    }

    /// Snapshot for diagnostics, in application order.
    pub fn entries(&self) -> Vec<JournalEntry> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.clone()
    }

    pub fn is_empty(&self) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.is_empty()
    }

    /// Undo every journaled mutation in strict reverse order of
    /// application. Returns the per-entry failures; an empty vec means the
    /// cluster is back at its pre-deploy state.
    pub async fn replay<T: ClusterTransport + ?Sized>(
        &self,
        transport: &T,
    ) -> Vec<(Identity, Error)> {
        let entries = self.entries();
        let mut failures = Vec::new();
        for entry in entries.iter().rev() {
            let outcome = match &entry.pre_image {
                None => {
                    info!("rollback: deleting {}", entry.identity);
                    transport.delete(&entry.identity).await
                }
                Some(pre) => {
                    info!("rollback: restoring {}", entry.identity);
                    let body = sanitize_pre_image(pre.tree());
                    transport.replace(&entry.identity, &body).await
                }
            };
            if let Err(e) = outcome {
                warn!("rollback step for {} failed: {}", entry.identity, e);
                let step = ErrorKind::RollbackStepFailed(entry.identity.to_string(), e.to_string());
                failures.push((entry.identity.clone(), Error::with_chain(e, step)));
            }
        }
        failures
    }
}

/// Strip the server-owned metadata a restore must not echo back.
fn sanitize_pre_image(tree: &Node) -> Node {
    let mut body = tree.clone();
    body.remove("status");
    if let Some(metadata) = body.get_mut("metadata") {
        for field in &[
            "resourceVersion",
            "uid",
            "creationTimestamp",
            "selfLink",
            "managedFields",
            "generation",
            "ownerReferences",
        ] {
            metadata.remove(field);
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::super::{loader, Origin};
    use super::*;

    fn obj(yaml: &str) -> CanonicalObject {
        loader::load_documents(yaml, &Origin::Literal("test".into()))
            .unwrap()
            .remove(0)
    }

    #[test]
    fn entries_keep_application_order() {
        let journal = Journal::new();
        let a = obj("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: n\n");
        let b = obj("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n  namespace: n\n");
        journal.append(a.identity().clone(), None, ActionKind::Create);
        journal.append(b.identity().clone(), Some(a.clone()), ActionKind::Patch);
        let entries = journal.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].identity.name, "a");
        assert_eq!(entries[1].identity.name, "b");
        assert!(entries[0].at <= entries[1].at);
    }

    #[test]
    fn pre_images_are_sanitized_for_restore() {
        let live = obj(
            r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: cm
  namespace: n
  resourceVersion: "99"
  uid: abc-123
  creationTimestamp: "2020-01-01T00:00:00Z"
data:
  a: "1"
status:
  anything: here
"#,
        );
        let body = sanitize_pre_image(live.tree());
        assert!(body.get("status").is_none());
        assert!(body.dig(&["metadata", "resourceVersion"]).is_none());
        assert!(body.dig(&["metadata", "uid"]).is_none());
        assert_eq!(
            body.dig(&["metadata", "name"]).and_then(Node::as_str),
            Some("cm")
        );
        assert_eq!(body.dig(&["data", "a"]).and_then(Node::as_str), Some("1"));
    }
}
