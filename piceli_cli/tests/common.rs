extern crate piceli;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use piceli::kube::ClusterTransport;
use piceli::node::Node;
use piceli::{CanonicalObject, ErrorKind, Identity, ObjectSet, Origin, Result};

static START: Once = Once::new();

/// One-time init for integration tests.
pub fn setup() {
    START.call_once(|| {
        println!(
            "Initializing tests - fixtures at {}",
            fixtures_dir().display()
        );
    });
}

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

pub fn fixture_set() -> ObjectSet {
    let objects = piceli::loader::load_folder(&fixtures_dir(), false).unwrap();
    ObjectSet::new(objects).unwrap()
}

pub fn parse_objects(yaml: &str) -> Vec<CanonicalObject> {
    piceli::loader::load_documents(yaml, &Origin::Literal("test".into())).unwrap()
}

pub fn set_from(yaml: &str) -> ObjectSet {
    ObjectSet::new(parse_objects(yaml)).unwrap()
}

/// In-memory stand-in for a cluster: stores wire trees by identity,
/// fabricates enough status for readiness checks, logs every operation
/// and can be told to break specific objects or fail transiently.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<BTreeMap<Identity, Node>>,
    pub ops: Mutex<Vec<String>>,
    broken: Mutex<BTreeSet<Identity>>,
    transient_failures: Mutex<BTreeMap<Identity, u32>>,
}

impl FakeCluster {
    pub fn new() -> FakeCluster {
        FakeCluster::default()
    }

    /// Pre-populate live state, as if a previous deploy left it there.
    pub fn seed(&self, obj: &CanonicalObject) {
        self.state
            .lock()
            .unwrap()
            .insert(obj.identity().clone(), obj.tree().clone());
    }

    /// Objects that will never report ready.
    pub fn break_object(&self, id: &Identity) {
        self.broken.lock().unwrap().insert(id.clone());
    }

    /// The next `n` mutations of `id` fail with a transient error.
    pub fn fail_transient_times(&self, id: &Identity, n: u32) {
        self.transient_failures.lock().unwrap().insert(id.clone(), n);
    }

    pub fn contains(&self, id: &Identity) -> bool {
        self.state.lock().unwrap().contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().is_empty()
    }

    pub fn stored(&self, id: &Identity) -> Option<Node> {
        self.state.lock().unwrap().get(id).cloned()
    }

    pub fn operations(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn log(&self, op: &str, id: &Identity) {
        self.ops.lock().unwrap().push(format!("{} {}", op, id));
    }

    fn check_transient(&self, op: &str, id: &Identity) -> Result<()> {
        let mut failures = self.transient_failures.lock().unwrap();
        if let Some(left) = failures.get_mut(id) {
            if *left > 0 {
                *left -= 1;
                return Err(ErrorKind::TransientTransport(
                    format!("{} {}", op, id),
                    "injected transient failure".into(),
                )
                .into());
            }
        }
        Ok(())
    }

    /// Fabricate the status fields the readiness checks look for.
    fn decorate(&self, id: &Identity, tree: &Node) -> Node {
        let broken = self.broken.lock().unwrap().contains(id);
        let mut live = tree.clone();
        match id.kind.as_str() {
            "Deployment" | "StatefulSet" => {
                let replicas = live
                    .dig(&["spec", "replicas"])
                    .and_then(Node::as_i64)
                    .unwrap_or(1);
                let generation = live
                    .dig(&["metadata", "generation"])
                    .and_then(Node::as_i64)
                    .unwrap_or(0);
                let ready = if broken { 0 } else { replicas };
                live.set(
                    "status",
                    Node::map(vec![
                        ("observedGeneration".into(), Node::from(generation)),
                        ("replicas".into(), Node::from(replicas)),
                        ("readyReplicas".into(), Node::from(ready)),
                    ]),
                );
            }
            "Job" => {
                let succeeded = if broken { 0i64 } else { 1i64 };
                live.set(
                    "status",
                    Node::map(vec![("succeeded".into(), Node::from(succeeded))]),
                );
            }
            "Namespace" => {
                let phase = if broken { "Terminating" } else { "Active" };
                live.set(
                    "status",
                    Node::map(vec![("phase".into(), Node::from(phase))]),
                );
            }
            _ => {}
        }
        live
    }
}

fn merge_into(into: &mut Node, patch: &Node) {
    match patch {
        Node::Map(entries) => {
            if into.as_map().is_none() {
                *into = Node::map(vec![]);
            }
            for (k, v) in entries {
                if v.is_null() {
                    into.remove(k);
                } else if into.get(k).is_none() {
                    into.set(k, v.clone());
                } else if let Some(child) = into.get_mut(k) {
                    merge_into(child, v);
                }
            }
        }
        other => *into = other.clone(),
    }
}

#[async_trait]
impl ClusterTransport for FakeCluster {
    async fn get(&self, id: &Identity) -> Result<Option<CanonicalObject>> {
        let tree = self.state.lock().unwrap().get(id).cloned();
        match tree {
            None => Ok(None),
            Some(t) => {
                let live = self.decorate(id, &t);
                Ok(Some(CanonicalObject::from_wire(
                    live,
                    Origin::Literal(format!("live:{}", id)),
                )?))
            }
        }
    }

    async fn create(&self, id: &Identity, body: &Node) -> Result<()> {
        self.log("create", id);
        self.check_transient("create", id)?;
        let mut state = self.state.lock().unwrap();
        if state.contains_key(id) {
            return Err(ErrorKind::TerminalTransport(
                format!("create {}", id),
                "AlreadyExists".into(),
            )
            .into());
        }
        state.insert(id.clone(), body.clone());
        Ok(())
    }

    async fn patch(&self, id: &Identity, patch: &Node) -> Result<()> {
        self.log("patch", id);
        self.check_transient("patch", id)?;
        let mut state = self.state.lock().unwrap();
        match state.get_mut(id) {
            Some(existing) => {
                merge_into(existing, patch);
                Ok(())
            }
            None => Err(ErrorKind::TerminalTransport(
                format!("patch {}", id),
                "NotFound".into(),
            )
            .into()),
        }
    }

    async fn replace(&self, id: &Identity, body: &Node) -> Result<()> {
        self.log("replace", id);
        self.check_transient("replace", id)?;
        self.state.lock().unwrap().insert(id.clone(), body.clone());
        Ok(())
    }

    async fn delete(&self, id: &Identity) -> Result<()> {
        self.log("delete", id);
        self.check_transient("delete", id)?;
        self.state.lock().unwrap().remove(id);
        Ok(())
    }
}
