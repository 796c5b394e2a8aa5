use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use super::kinds;
use super::node::Node;
use super::{ErrorKind, Result};

/// The identity tuple a kubernetes object is addressed by.
///
/// `namespace` is empty for cluster-scoped kinds. Identity is globally
/// unique within a deployment; the loader rejects duplicates.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct Identity {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl Identity {
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Identity {
        let (group, version) = split_api_version(api_version);
        Identity {
            group,
            version,
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Reassemble the wire `apiVersion` string.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Stable ordering key used wherever plans need deterministic output.
    pub fn sort_key(&self) -> (String, String, String) {
        (self.kind.clone(), self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.find('/') {
        Some(pos) => (
            api_version[..pos].to_string(),
            api_version[pos + 1..].to_string(),
        ),
        None => (String::new(), api_version.to_string()),
    }
}

/// Where an object came from, for diagnostics only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Origin {
    File(PathBuf),
    Literal(String),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::File(p) => write!(f, "{}", p.display()),
            Origin::Literal(s) => write!(f, "{}", s),
        }
    }
}

/// A loader-normalized kubernetes object, immutable after construction.
///
/// The full wire tree is retained (the comparator needs `metadata` paths as
/// much as `spec` ones); identity, labels and annotations are extracted
/// views over it.
#[derive(Clone, Debug)]
pub struct CanonicalObject {
    identity: Identity,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    tree: Node,
    origin: Origin,
}

impl CanonicalObject {
    /// Parse a wire tree into the canonical form.
    pub fn from_wire(tree: Node, origin: Origin) -> Result<CanonicalObject> {
        let kind = match tree.get("kind").and_then(Node::as_str) {
            Some(k) if !k.is_empty() => k.to_string(),
            _ => return Err(malformed(&origin, "missing kind")),
        };
        let api_version = match tree.get("apiVersion").and_then(Node::as_str) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => return Err(malformed(&origin, "missing apiVersion")),
        };
        let metadata = match tree.get("metadata") {
            Some(m) => m,
            None => return Err(malformed(&origin, "missing metadata")),
        };
        let name = match metadata.get("name").and_then(Node::as_str) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => return Err(malformed(&origin, "missing metadata.name")),
        };
        let namespace = if kinds::is_cluster_scoped(&kind) {
            String::new()
        } else {
            metadata
                .get("namespace")
                .and_then(Node::as_str)
                .unwrap_or("")
                .to_string()
        };
        let labels = string_map(metadata.get("labels"), &origin, "metadata.labels")?;
        let annotations = string_map(metadata.get("annotations"), &origin, "metadata.annotations")?;

        Ok(CanonicalObject {
            identity: Identity::new(&api_version, &kind, &namespace, &name),
            labels,
            annotations,
            tree,
            origin,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn kind(&self) -> &str {
        &self.identity.kind
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn namespace(&self) -> &str {
        &self.identity.namespace
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(|s| s.as_str())
    }

    /// The full wire tree in loader key order.
    pub fn tree(&self) -> &Node {
        &self.tree
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Serialize into the JSON body the cluster transport expects.
    pub fn to_wire_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.tree)?)
    }

    /// A copy with the namespace filled in, for the namespace-override flow.
    /// Objects that already carry an explicit namespace win over the
    /// override and are returned unchanged; so are cluster-scoped kinds.
    pub fn with_namespace(&self, namespace: &str) -> CanonicalObject {
        if kinds::is_cluster_scoped(self.kind()) || !self.identity.namespace.is_empty() {
            return self.clone();
        }
        let mut copy = self.clone();
        copy.identity.namespace = namespace.to_string();
        if let Some(metadata) = copy.tree.get_mut("metadata") {
            metadata.set("namespace", Node::from(namespace));
        }
        copy
    }
}

fn malformed(origin: &Origin, reason: &str) -> super::Error {
    ErrorKind::MalformedObject(origin.to_string(), reason.to_string()).into()
}

fn string_map(
    node: Option<&Node>,
    origin: &Origin,
    what: &str,
) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    if let Some(n) = node {
        let entries = match n.as_map() {
            Some(e) => e,
            None => return Err(malformed(origin, &format!("{} is not a mapping", what))),
        };
        for (k, v) in entries {
            match v.as_str() {
                Some(s) => {
                    out.insert(k.clone(), s.to_string());
                }
                None => {
                    return Err(malformed(
                        origin,
                        &format!("{}.{} is not a string", what, k),
                    ))
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> CanonicalObject {
        let tree: Node = serde_yaml::from_str(yaml).unwrap();
        CanonicalObject::from_wire(tree, Origin::Literal("test".into())).unwrap()
    }

    #[test]
    fn identity_extraction() {
        let obj = parse(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: shop\n  labels:\n    app: web\n",
        );
        assert_eq!(obj.identity().group, "apps");
        assert_eq!(obj.identity().version, "v1");
        assert_eq!(obj.identity().api_version(), "apps/v1");
        assert_eq!(obj.identity().to_string(), "Deployment/shop/web");
        assert_eq!(obj.labels()["app"], "web");
    }

    #[test]
    fn cluster_scoped_kinds_drop_namespace() {
        let obj = parse(
            "apiVersion: storage.k8s.io/v1\nkind: StorageClass\nmetadata:\n  name: fast\n  namespace: ignored\n",
        );
        assert_eq!(obj.namespace(), "");
        assert_eq!(obj.identity().to_string(), "StorageClass/fast");
    }

    #[test]
    fn missing_name_is_malformed() {
        let tree: Node =
            serde_yaml::from_str("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap();
        assert!(CanonicalObject::from_wire(tree, Origin::Literal("t".into())).is_err());
    }

    #[test]
    fn namespace_override_respects_explicit_namespace() {
        let obj = parse("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n");
        let moved = obj.with_namespace("prod");
        assert_eq!(moved.namespace(), "prod");
        assert_eq!(
            moved.tree().dig(&["metadata", "namespace"]).and_then(Node::as_str),
            Some("prod")
        );

        let pinned = parse(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: staging\n",
        );
        assert_eq!(pinned.with_namespace("prod").namespace(), "staging");
    }
}
