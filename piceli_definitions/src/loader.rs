//! Folder and document ingestion.
//!
//! The engine itself makes no assumption about where objects come from;
//! this module covers the common sources (manifest folders and serialized
//! document streams) and enforces the duplicate-identity invariant.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use walkdir::WalkDir;

use super::kinds;
use super::node::Node;
use super::object::{CanonicalObject, Identity, Origin};
use super::{ErrorKind, Result, ResultExt};

/// Split a raw stream into yaml documents on `---` separators.
pub fn split_documents(raw: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();
    for line in raw.lines() {
        if line == "---" || line.starts_with("--- ") {
            docs.push(current);
            current = String::new();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    docs.push(current);
    docs.into_iter()
        .filter(|d| !d.trim().is_empty())
        .collect()
}

/// Parse every object out of a serialized multi-document stream.
pub fn load_documents(raw: &str, origin: &Origin) -> Result<Vec<CanonicalObject>> {
    let mut objects = Vec::new();
    for doc in split_documents(raw) {
        let tree: Node = serde_yaml::from_str(&doc)
            .chain_err(|| ErrorKind::MalformedObject(origin.to_string(), "unparseable document".into()))?;
        if tree.is_null() {
            continue;
        }
        objects.push(CanonicalObject::from_wire(tree, origin.clone())?);
    }
    Ok(objects)
}

fn is_manifest_file(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yml") | Some("yaml") | Some("json") => true,
        _ => false,
    }
}

/// Load every manifest file under a folder, sorted for determinism.
pub fn load_folder(folder: &Path, recurse: bool) -> Result<Vec<CanonicalObject>> {
    if !folder.is_dir() {
        bail!("manifest folder {} does not exist", folder.display());
    }
    let walker = if recurse {
        WalkDir::new(folder)
    } else {
        WalkDir::new(folder).max_depth(1)
    };
    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| ErrorKind::Msg(format!("walking {}: {}", folder.display(), e)))?;
        if entry.file_type().is_file() && is_manifest_file(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();

    let mut objects = Vec::new();
    for file in files {
        debug!("Loading manifests from {}", file.display());
        let raw = std::fs::read_to_string(&file)?;
        let origin = Origin::File(file.clone());
        objects.extend(load_documents(&raw, &origin)?);
    }
    Ok(objects)
}

/// A reference to an object by kind, namespace and name; the resolution
/// key used both for in-set lookups and external annotations.
pub type RefKey = (String, String, String);

/// The validated input collection handed to the planner.
///
/// Construction enforces globally unique identities. Also carries the
/// set of references the caller has declared external (pre-existing on
/// the cluster), collected from `piceli.dev/external` annotations or via
/// `mark_external`.
#[derive(Clone, Debug, Default)]
pub struct ObjectSet {
    objects: Vec<CanonicalObject>,
    index: BTreeMap<Identity, usize>,
    external: BTreeSet<RefKey>,
}

impl ObjectSet {
    pub fn new(objects: Vec<CanonicalObject>) -> Result<ObjectSet> {
        let mut set = ObjectSet::default();
        for obj in objects {
            set.insert(obj)?;
        }
        Ok(set)
    }

    fn insert(&mut self, obj: CanonicalObject) -> Result<()> {
        if let Some(previous) = self.index.get(obj.identity()) {
            let first = self.objects[*previous].origin().to_string();
            return Err(ErrorKind::DuplicateIdentity(
                obj.identity().to_string(),
                first,
                obj.origin().to_string(),
            )
            .into());
        }
        for external in parse_external_annotation(&obj) {
            self.external.insert(external);
        }
        self.index.insert(obj.identity().clone(), self.objects.len());
        self.objects.push(obj);
        Ok(())
    }

    /// Apply a target-namespace override; objects with an explicit
    /// `metadata.namespace` keep it.
    pub fn with_namespace(self, namespace: &str) -> Result<ObjectSet> {
        let moved = self
            .objects
            .iter()
            .map(|o| o.with_namespace(namespace))
            .collect();
        let mut set = ObjectSet::new(moved)?;
        set.external = self.external;
        Ok(set)
    }

    /// Declare a reference external so validation accepts it.
    pub fn mark_external(&mut self, kind: &str, namespace: &str, name: &str) {
        self.external
            .insert((kind.to_string(), namespace.to_string(), name.to_string()));
    }

    pub fn is_external(&self, kind: &str, namespace: &str, name: &str) -> bool {
        self.external
            .contains(&(kind.to_string(), namespace.to_string(), name.to_string()))
            // cluster-wide external declarations do not carry a namespace
            || self
                .external
                .contains(&(kind.to_string(), String::new(), name.to_string()))
    }

    pub fn get(&self, identity: &Identity) -> Option<&CanonicalObject> {
        self.index.get(identity).map(|i| &self.objects[*i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanonicalObject> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Objects in the stable `(kind, namespace, name)` order.
    pub fn sorted(&self) -> Vec<&CanonicalObject> {
        let mut objs: Vec<_> = self.objects.iter().collect();
        objs.sort_by_key(|o| o.identity().sort_key());
        objs
    }

    /// The distinct namespaces named by the set's objects.
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.objects
            .iter()
            .map(|o| o.namespace().to_string())
            .filter(|ns| !ns.is_empty())
            .collect()
    }
}

/// Parse `piceli.dev/external: "Kind/name, Kind/namespace/name"`.
fn parse_external_annotation(obj: &CanonicalObject) -> Vec<RefKey> {
    let mut keys = Vec::new();
    if let Some(raw) = obj.annotation(kinds::EXTERNAL_ANNOTATION) {
        for item in raw.split(',') {
            if let Some(key) = parse_ref(item.trim(), obj.namespace()) {
                keys.push(key);
            } else if !item.trim().is_empty() {
                warn!(
                    "{}: unparseable external reference '{}' ignored",
                    obj.identity(),
                    item.trim()
                );
            }
        }
    }
    keys
}

/// Parse a `Kind/name` or `Kind/namespace/name` reference string.
pub fn parse_ref(raw: &str, default_namespace: &str) -> Option<RefKey> {
    let parts: Vec<&str> = raw.split('/').collect();
    match parts.as_slice() {
        [kind, name] if !kind.is_empty() && !name.is_empty() => {
            let ns = if kinds::is_cluster_scoped(kind) {
                String::new()
            } else {
                default_namespace.to_string()
            };
            Some((kind.to_string(), ns, name.to_string()))
        }
        [kind, ns, name] if !kind.is_empty() && !name.is_empty() => {
            Some((kind.to_string(), ns.to_string(), name.to_string()))
        }
        _ => None,
    }
}
