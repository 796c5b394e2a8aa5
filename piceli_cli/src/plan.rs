//! Per-object reconciliation planning.
//!
//! Combines the comparator verdict with kind policy to pick the minimal
//! mutation: nothing, a create, a merge patch carrying only the differing
//! paths, or a delete-then-create replacement when patching cannot work.

use std::fmt;

use super::diff::{self, DiffResult};
use super::kinds;
use super::node::{path_has_prefix, Node, Step};
use super::{CanonicalObject, Identity};

#[derive(Clone, Debug)]
pub enum Action {
    NoAction,
    Create(Node),
    Patch(Node),
    Replace(Node),
}

impl Action {
    pub fn is_mutation(&self) -> bool {
        match self {
            Action::NoAction => false,
            _ => true,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::NoAction => "NO_ACTION",
            Action::Create(_) => "CREATE",
            Action::Patch(_) => "PATCH",
            Action::Replace(_) => "REPLACE",
        };
        f.write_str(s)
    }
}

/// The planner's verdict for one object; the diff is carried along for
/// `deploy detail` output.
#[derive(Clone, Debug)]
pub struct PlannedAction {
    pub identity: Identity,
    pub action: Action,
    pub diff: Option<DiffResult>,
}

/// Choose the action that reconciles `desired` with what is live.
pub fn decide(desired: &CanonicalObject, live: Option<&CanonicalObject>) -> PlannedAction {
    let identity = desired.identity().clone();
    let live = match live {
        Some(l) => l,
        None => {
            return PlannedAction {
                identity,
                action: Action::Create(desired.tree().clone()),
                diff: None,
            }
        }
    };
    let result = diff::compare(live, desired);
    if !result.needs_action() {
        return PlannedAction {
            identity,
            action: Action::NoAction,
            diff: Some(result),
        };
    }
    if requires_replace(desired.kind(), &result) {
        return PlannedAction {
            identity,
            action: Action::Replace(desired.tree().clone()),
            diff: Some(result),
        };
    }
    let patch = merge_patch(desired.tree(), &result);
    PlannedAction {
        identity,
        action: Action::Patch(patch),
        diff: Some(result),
    }
}

/// Patch is off the table when the kind's spec is immutable, when a
/// differing path sits under a forbidden prefix, or when patching would
/// have to remove keys the live side still holds.
fn requires_replace(kind: &str, result: &DiffResult) -> bool {
    if kinds::is_immutable_kind(kind) {
        return true;
    }
    let forbidden = kinds::immutable_prefixes(kind);
    result.differing().any(|entry| {
        entry.right.is_none()
            || forbidden
                .iter()
                .any(|prefix| path_has_prefix(&entry.path, prefix))
    })
}

/// Build a merge-patch body from the differing paths only.
///
/// Merge patches cannot address sequence members, so any path crossing a
/// sequence widens to the nearest enclosing sequence, which is then sent
/// wholesale from the desired tree.
fn merge_patch(desired: &Node, result: &DiffResult) -> Node {
    let mut prefixes: Vec<Vec<String>> = Vec::new();
    for entry in result.differing() {
        let mut keys = Vec::new();
        for step in &entry.path {
            match step {
                Step::Key(k) => keys.push(k.clone()),
                Step::Index(_) => break,
            }
        }
        if !prefixes
            .iter()
            .any(|existing| keys.starts_with(existing))
        {
            prefixes.retain(|existing| !existing.starts_with(&keys));
            prefixes.push(keys);
        }
    }

    let mut patch = Node::map(vec![]);
    for prefix in prefixes {
        if let Some(value) = desired.dig(&prefix.iter().map(|s| s.as_str()).collect::<Vec<_>>()) {
            insert_at(&mut patch, &prefix, value.clone());
        }
    }
    patch
}

fn insert_at(patch: &mut Node, path: &[String], value: Node) {
    if path.is_empty() {
        *patch = value;
        return;
    }
    if patch.get(&path[0]).is_none() {
        patch.set(&path[0], Node::map(vec![]));
    }
    if let Some(child) = patch.get_mut(&path[0]) {
        insert_at(child, &path[1..], value);
    }
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
    fn absent_live_means_create() {
        let desired = obj("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: n\n");
        let planned = decide(&desired, None);
        match planned.action {
            Action::Create(_) => {}
            other => panic!("expected CREATE, got {}", other),
        }
    }

    #[test]
    fn identical_live_means_no_action() {
        let desired = obj(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: n\ndata:\n  a: \"1\"\n",
        );
        let planned = decide(&desired, Some(&desired));
        match planned.action {
            Action::NoAction => {}
            other => panic!("expected NO_ACTION, got {}", other),
        }
    }

    #[test]
    fn job_image_change_is_replaced_not_patched() {
        let live = obj(
            r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: migrate
  namespace: n
spec:
  template:
    spec:
      containers:
      - name: migrate
        image: tool:v1
"#,
        );
        let desired = obj(
            r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: migrate
  namespace: n
spec:
  template:
    spec:
      containers:
      - name: migrate
        image: tool:v2
"#,
        );
        let planned = decide(&desired, Some(&live));
        match planned.action {
            Action::Replace(_) => {}
            other => panic!("expected REPLACE, got {}", other),
        }
    }

    #[test]
    fn scalar_change_patches_only_the_differing_path() {
        let live = obj(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: n
spec:
  replicas: 1
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
      - name: web
        image: nginx
"#,
        );
        let desired = obj(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: n
spec:
  replicas: 3
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
      - name: web
        image: nginx
"#,
        );
        let planned = decide(&desired, Some(&live));
        match planned.action {
            Action::Patch(patch) => {
                assert_eq!(
                    serde_json::to_string(&patch).unwrap(),
                    r#"{"spec":{"replicas":3}}"#
                );
            }
            other => panic!("expected PATCH, got {}", other),
        }
    }

    #[test]
    fn container_change_widens_to_the_sequence() {
        let live = obj(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: n
spec:
  template:
    spec:
      containers:
      - name: web
        image: nginx:1
"#,
        );
        let desired = obj(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: n
spec:
  template:
    spec:
      containers:
      - name: web
        image: nginx:2
"#,
        );
        let planned = decide(&desired, Some(&live));
        match planned.action {
            Action::Patch(patch) => {
                let containers = patch
                    .dig(&["spec", "template", "spec", "containers"])
                    .expect("whole container list in patch");
                assert_eq!(containers.as_seq().map(|s| s.len()), Some(1));
            }
            other => panic!("expected PATCH, got {}", other),
        }
    }

    #[test]
    fn key_removal_forces_replace() {
        let live = obj(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: n\ndata:\n  keep: \"1\"\n  drop: \"2\"\n",
        );
        let desired = obj(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: n\ndata:\n  keep: \"1\"\n",
        );
        let planned = decide(&desired, Some(&live));
        match planned.action {
            Action::Replace(_) => {}
            other => panic!("expected REPLACE, got {}", other),
        }
    }

    #[test]
    fn service_selector_change_forces_replace() {
        let live = obj(
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: s\n  namespace: n\nspec:\n  selector:\n    app: old\n  ports:\n  - port: 80\n",
        );
        let desired = obj(
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: s\n  namespace: n\nspec:\n  selector:\n    app: new\n  ports:\n  - port: 80\n",
        );
        let planned = decide(&desired, Some(&live));
        match planned.action {
            Action::Replace(_) => {}
            other => panic!("expected REPLACE, got {}", other),
        }
    }
}
