//! Semantic comparison between a live object and its desired state.
//!
//! Works on parsed spec trees, never on text. Every examined path gets a
//! classification, evaluated in order: server-managed paths are Ignored,
//! live-only paths matching a known server default are Defaulted, then
//! structural equality decides Equal vs Differing. Entries come out in
//! stable pre-order, desired-side key order first.

use std::fmt;

use super::kinds::{self, SetKey};
use super::node::{path_matches, render_path, Node, Step};
use super::CanonicalObject;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum Classification {
    Equal,
    Ignored,
    Defaulted,
    Differing,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::Equal => "equal",
            Classification::Ignored => "ignored",
            Classification::Defaulted => "defaulted",
            Classification::Differing => "differing",
        };
        f.write_str(s)
    }
}

/// One classified path. `left` is the live side, `right` the desired side;
/// Ignored and Defaulted entries only ever carry a live side.
#[derive(Clone, Debug)]
pub struct DiffEntry {
    pub path: Vec<Step>,
    pub classification: Classification,
    pub left: Option<Node>,
    pub right: Option<Node>,
}

impl DiffEntry {
    pub fn rendered_path(&self) -> String {
        render_path(&self.path)
    }
}

#[derive(Clone, Debug, Default)]
pub struct DiffResult {
    pub entries: Vec<DiffEntry>,
}

impl DiffResult {
    pub fn needs_action(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.classification == Classification::Differing)
    }

    pub fn differing(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries
            .iter()
            .filter(|e| e.classification == Classification::Differing)
    }
}

struct Comparator<'a> {
    kind: &'a str,
    ignored: Vec<&'static [&'static str]>,
    defaults: Vec<(&'static [&'static str], Node)>,
    desired_has_owner_refs: bool,
    entries: Vec<DiffEntry>,
}

/// Does the live object already satisfy the desired one?
pub fn compare(live: &CanonicalObject, desired: &CanonicalObject) -> DiffResult {
    let kind = desired.kind();
    let mut cmp = Comparator {
        kind,
        ignored: kinds::ignored_paths(kind),
        defaults: kinds::server_defaults(kind),
        desired_has_owner_refs: desired
            .tree()
            .dig(&["metadata", "ownerReferences"])
            .is_some(),
        entries: Vec::new(),
    };
    let mut path = Vec::new();
    cmp.walk(&mut path, Some(live.tree()), Some(desired.tree()));
    DiffResult {
        entries: cmp.entries,
    }
}

impl<'a> Comparator<'a> {
    fn push(
        &mut self,
        path: &[Step],
        classification: Classification,
        left: Option<&Node>,
        right: Option<&Node>,
    ) {
        self.entries.push(DiffEntry {
            path: path.to_vec(),
            classification,
            left: left.cloned(),
            right: right.cloned(),
        });
    }

    fn is_ignored(&self, path: &[Step]) -> bool {
        self.ignored.iter().any(|p| path_matches(path, p))
            || (!self.desired_has_owner_refs && path_matches(path, kinds::OWNER_REFERENCES))
    }

    fn matches_default(&self, path: &[Step], live: &Node) -> bool {
        self.defaults
            .iter()
            .any(|(p, v)| path_matches(path, p) && v == live)
    }

    fn walk(&mut self, path: &mut Vec<Step>, left: Option<&Node>, right: Option<&Node>) {
        match (left, right) {
            (None, None) => {}
            (Some(l), None) => self.live_only(path, l),
            (None, Some(r)) => {
                self.push(path, Classification::Differing, None, Some(r));
            }
            (Some(l), Some(r)) => self.both(path, l, r),
        }
    }

    // live-only paths: Ignored, Defaulted, or Differing (unknown extras)
    fn live_only(&mut self, path: &mut Vec<Step>, live: &Node) {
        if self.is_ignored(path) {
            self.push(path, Classification::Ignored, Some(live), None);
            return;
        }
        if self.matches_default(path, live) {
            self.push(path, Classification::Defaulted, Some(live), None);
            return;
        }
        // descend into live-only maps so nested ignored/defaulted fields
        // (e.g. injected annotations) classify individually
        if let Node::Map(entries) = live {
            for (k, v) in entries {
                path.push(Step::Key(k.clone()));
                self.live_only(path, v);
                path.pop();
            }
            return;
        }
        self.push(path, Classification::Differing, Some(live), None);
    }

    fn both(&mut self, path: &mut Vec<Step>, live: &Node, desired: &Node) {
        if self.is_ignored(path) {
            self.push(path, Classification::Ignored, Some(live), None);
            return;
        }
        match (live, desired) {
            (Node::Map(_), Node::Map(desired_entries)) => {
                for (k, dv) in desired_entries {
                    path.push(Step::Key(k.clone()));
                    self.walk(path, live.get(k), Some(dv));
                    path.pop();
                }
                if let Node::Map(live_entries) = live {
                    for (k, lv) in live_entries {
                        if desired.get(k).is_some() {
                            continue;
                        }
                        path.push(Step::Key(k.clone()));
                        self.live_only(path, lv);
                        path.pop();
                    }
                }
            }
            (Node::Seq(lv), Node::Seq(dv)) => {
                if let Some(key) = kinds::set_valued(self.kind, path) {
                    self.set_sequence(path, lv, dv, key);
                } else if lv.len() == dv.len() {
                    for (i, d) in dv.iter().enumerate() {
                        path.push(Step::Index(i));
                        self.walk(path, lv.get(i), Some(d));
                        path.pop();
                    }
                } else {
                    self.push(path, Classification::Differing, Some(live), Some(desired));
                }
            }
            (Node::Scalar(_), Node::Scalar(_)) => {
                let cls = if live == desired {
                    Classification::Equal
                } else {
                    Classification::Differing
                };
                self.push(path, cls, Some(live), Some(desired));
            }
            // shape mismatch
            _ => self.push(path, Classification::Differing, Some(live), Some(desired)),
        }
    }

    // set-valued sequences compare as multisets keyed by member identity
    fn set_sequence(&mut self, path: &mut Vec<Step>, live: &[Node], desired: &[Node], key: SetKey) {
        match key {
            SetKey::Value => {
                let cls = if multiset_equal(live, desired) {
                    Classification::Equal
                } else {
                    Classification::Differing
                };
                self.push(
                    path,
                    cls,
                    Some(&Node::seq(live.to_vec())),
                    Some(&Node::seq(desired.to_vec())),
                );
            }
            SetKey::Name | SetKey::NameKind => {
                let live_keys: Vec<Option<String>> =
                    live.iter().map(|n| member_key(n, key)).collect();
                let desired_keys: Vec<Option<String>> =
                    desired.iter().map(|n| member_key(n, key)).collect();
                let keyed = live.len() == desired.len()
                    && live_keys.iter().all(|k| k.is_some())
                    && desired_keys
                        .iter()
                        .all(|k| k.is_some() && live_keys.contains(k));
                if !keyed {
                    let cls = if multiset_equal(live, desired) {
                        Classification::Equal
                    } else {
                        Classification::Differing
                    };
                    self.push(
                        path,
                        cls,
                        Some(&Node::seq(live.to_vec())),
                        Some(&Node::seq(desired.to_vec())),
                    );
                    return;
                }
                // pairwise diff in desired order, desired indices
                for (i, d) in desired.iter().enumerate() {
                    let dk = &desired_keys[i];
                    let partner = live_keys
                        .iter()
                        .position(|lk| lk == dk)
                        .map(|pos| &live[pos]);
                    path.push(Step::Index(i));
                    self.walk(path, partner, Some(d));
                    path.pop();
                }
            }
        }
    }
}

fn multiset_equal(a: &[Node], b: &[Node]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut used = vec![false; b.len()];
    'outer: for x in a {
        for (i, y) in b.iter().enumerate() {
            if !used[i] && x == y {
                used[i] = true;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

fn member_key(node: &Node, key: SetKey) -> Option<String> {
    match key {
        SetKey::Value => None,
        SetKey::Name => node.get("name").and_then(Node::as_str).map(String::from),
        SetKey::NameKind => {
            let name = node.get("name").and_then(Node::as_str)?;
            let kind = node.get("kind").and_then(Node::as_str)?;
            Some(format!("{}/{}", kind, name))
        }
    }
}

/// Rows for `deploy detail`: everything but Equal entries.
pub fn render_entries(result: &DiffResult) -> String {
    let mut out = String::new();
    for entry in &result.entries {
        if entry.classification == Classification::Equal {
            continue;
        }
        let left = entry
            .left
            .as_ref()
            .map(Node::render)
            .unwrap_or_else(|| "-".into());
        let right = entry
            .right
            .as_ref()
            .map(Node::render)
            .unwrap_or_else(|| "-".into());
        out.push_str(&format!(
            "  {:<10} {:<60} live={} desired={}\n",
            entry.classification.to_string(),
            entry.rendered_path(),
            left,
            right
        ));
    }
    out
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

    const STORAGE_DESIRED: &str = r#"
apiVersion: storage.k8s.io/v1
kind: StorageClass
metadata:
  name: resizable
provisioner: k8s.io/minikube-hostpath
allowVolumeExpansion: true
"#;

    const STORAGE_LIVE: &str = r#"
apiVersion: storage.k8s.io/v1
kind: StorageClass
metadata:
  name: resizable
  resourceVersion: "12345"
  managedFields:
  - manager: kubectl
provisioner: k8s.io/minikube-hostpath
allowVolumeExpansion: true
reclaimPolicy: Delete
volumeBindingMode: Immediate
"#;

    #[test]
    fn storageclass_with_server_defaults_needs_no_action() {
        let result = compare(&obj(STORAGE_LIVE), &obj(STORAGE_DESIRED));
        assert!(!result.needs_action());
        let cls = |p: &str| {
            result
                .entries
                .iter()
                .find(|e| e.rendered_path() == p)
                .map(|e| e.classification)
        };
        assert_eq!(cls("reclaimPolicy"), Some(Classification::Defaulted));
        assert_eq!(cls("volumeBindingMode"), Some(Classification::Defaulted));
        assert_eq!(
            cls("metadata.resourceVersion"),
            Some(Classification::Ignored)
        );
        assert_eq!(cls("metadata.managedFields"), Some(Classification::Ignored));
    }

    #[test]
    fn comparison_is_reflexive() {
        let desired = obj(STORAGE_DESIRED);
        let result = compare(&desired, &desired);
        assert!(!result.needs_action());
        assert!(result
            .entries
            .iter()
            .all(|e| e.classification == Classification::Equal));
    }

    #[test]
    fn env_reordering_is_equal() {
        let a = obj(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: d
  namespace: n
spec:
  template:
    spec:
      containers:
      - name: app
        image: nginx
        env:
        - name: A
          value: "1"
        - name: B
          value: "2"
"#,
        );
        let b = obj(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: d
  namespace: n
spec:
  template:
    spec:
      containers:
      - name: app
        image: nginx
        env:
        - name: B
          value: "2"
        - name: A
          value: "1"
"#,
        );
        assert!(!compare(&a, &b).needs_action());
    }

    #[test]
    fn env_value_change_pairs_by_name() {
        let live = obj(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: d
  namespace: n
spec:
  template:
    spec:
      containers:
      - name: app
        image: nginx
        env:
        - name: B
          value: "old"
        - name: A
          value: "1"
"#,
        );
        let desired = obj(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: d
  namespace: n
spec:
  template:
    spec:
      containers:
      - name: app
        image: nginx
        env:
        - name: A
          value: "1"
        - name: B
          value: "new"
"#,
        );
        let result = compare(&live, &desired);
        let differing: Vec<_> = result.differing().map(|e| e.rendered_path()).collect();
        assert_eq!(
            differing,
            vec!["spec.template.spec.containers[0].env[1].value"]
        );
    }

    #[test]
    fn live_only_unknown_extras_differ() {
        let live = obj(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: n\ndata:\n  a: \"1\"\n  b: \"2\"\n",
        );
        let desired = obj(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: n\ndata:\n  a: \"1\"\n",
        );
        let result = compare(&live, &desired);
        assert!(result.needs_action());
        let entry = result.differing().next().unwrap();
        assert_eq!(entry.rendered_path(), "data.b");
        assert!(entry.right.is_none());
    }

    #[test]
    fn desired_only_paths_differ() {
        let live = obj(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: n\ndata:\n  a: \"1\"\n",
        );
        let desired = obj(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: n\ndata:\n  a: \"1\"\n  b: \"2\"\n",
        );
        let result = compare(&live, &desired);
        assert!(result.needs_action());
        let entry = result.differing().next().unwrap();
        assert_eq!(entry.rendered_path(), "data.b");
        assert!(entry.left.is_none());
    }

    #[test]
    fn owner_references_ignored_when_desired_silent() {
        let live = obj(
            r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: cm
  namespace: n
  ownerReferences:
  - kind: Deployment
    name: owner
data:
  a: "1"
"#,
        );
        let desired =
            obj("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: n\ndata:\n  a: \"1\"\n");
        assert!(!compare(&live, &desired).needs_action());
    }
}
