//! Dependency resolution: turns the flat object set into a layered,
//! dependency-respecting schedule.
//!
//! Edges come from two places: cross-object references (rbac role refs,
//! service accounts, config/secret/volume consumption, autoscaler targets,
//! service selectors) and the kind rule, which orders deploy waves by
//! `kinds::deploy_rank`. Levels are assigned with Kahn's algorithm using a
//! stable `(kind, namespace, name)` tie-break, so shuffled input produces
//! identical schedules.

use petgraph::{
    dot,
    graph::{DiGraph, NodeIndex},
    Direction,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug};

use super::{kinds, loader, CanonicalObject, Identity, ObjectSet};
use super::{ErrorKind, Result};

/// The node type in `DeployGraph`, one per canonical object.
#[derive(Serialize, Deserialize, Clone)]
pub struct ObjectNode {
    pub identity: Identity,
}

impl ObjectNode {
    fn new(identity: &Identity) -> Self {
        ObjectNode {
            identity: identity.clone(),
        }
    }
}

// Debug is used for the `dot` interface - nice to have a minimal output for that
impl Debug for ObjectNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity)
    }
}

/// Why an edge exists; `A -> B` always means "apply A before B".
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum DepEdge {
    /// namespaced object inside a Namespace present in the set
    Namespace,
    RoleRef,
    Subject,
    ServiceAccount,
    ConfigMap,
    Secret,
    VolumeClaim,
    StorageClass,
    ScaleTarget,
    /// service selector matched a workload's pod template labels
    Selector,
    /// deploy-wave ordering between adjacent kind ranks
    KindOrder,
    /// a `piceli.dev/depends-on` annotation
    Explicit,
}

/// Graph of canonical objects with dependency edges
pub type DeployGraph = DiGraph<ObjectNode, DepEdge>;

/// The level schedule: level *i* holds objects whose dependencies all sit
/// in levels `< i`; objects within a level are mutually independent.
#[derive(Serialize, Clone, Debug, Default)]
pub struct Layered {
    pub levels: Vec<Vec<Identity>>,
}

impl Layered {
    pub fn level_of(&self, id: &Identity) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|i| i == id))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, level) in self.levels.iter().enumerate() {
            out.push_str(&format!("level {}:\n", i));
            for id in level {
                out.push_str(&format!("  - {}\n", id));
            }
        }
        out
    }
}

/// Build the full layered plan; `validate` additionally rejects
/// references that resolve neither in-set nor to an external annotation.
pub fn plan(set: &ObjectSet, validate: bool) -> Result<Layered> {
    let graph = build(set, validate)?;
    levels(&graph)
}

fn via_edge(via: kinds::RefVia) -> DepEdge {
    match via {
        kinds::RefVia::RoleRef => DepEdge::RoleRef,
        kinds::RefVia::Subject => DepEdge::Subject,
        kinds::RefVia::ServiceAccount => DepEdge::ServiceAccount,
        kinds::RefVia::ConfigMap => DepEdge::ConfigMap,
        kinds::RefVia::Secret => DepEdge::Secret,
        kinds::RefVia::VolumeClaim => DepEdge::VolumeClaim,
        kinds::RefVia::StorageClass => DepEdge::StorageClass,
        kinds::RefVia::ScaleTarget => DepEdge::ScaleTarget,
    }
}

/// Construct the dependency graph for an object set.
pub fn build(set: &ObjectSet, validate: bool) -> Result<DeployGraph> {
    let mut graph = DeployGraph::new();
    let mut by_key: BTreeMap<(String, String, String), NodeIndex> = BTreeMap::new();
    let mut indices: Vec<(NodeIndex, &CanonicalObject)> = Vec::new();

    for obj in set.sorted() {
        let idx = graph.add_node(ObjectNode::new(obj.identity()));
        let id = obj.identity();
        by_key.insert((id.kind.clone(), id.namespace.clone(), id.name.clone()), idx);
        indices.push((idx, obj));
    }

    // rule 1: namespace containment
    for (idx, obj) in &indices {
        if obj.namespace().is_empty() {
            continue;
        }
        let key = (
            "Namespace".to_string(),
            String::new(),
            obj.namespace().to_string(),
        );
        if let Some(ns_idx) = by_key.get(&key) {
            graph.update_edge(*ns_idx, *idx, DepEdge::Namespace);
        }
    }

    // rules 2-6: extracted references
    for (idx, obj) in &indices {
        for reference in kinds::references(obj) {
            let ns = if kinds::is_cluster_scoped(&reference.kind) {
                String::new()
            } else {
                reference
                    .namespace
                    .clone()
                    .unwrap_or_else(|| obj.namespace().to_string())
            };
            let key = (reference.kind.clone(), ns.clone(), reference.name.clone());
            match by_key.get(&key) {
                Some(target) => {
                    graph.update_edge(*target, *idx, via_edge(reference.via));
                }
                None => {
                    // absent targets are assumed to pre-exist on the cluster
                    if validate && !set.is_external(&reference.kind, &ns, &reference.name) {
                        return Err(ErrorKind::DanglingReference(
                            obj.identity().to_string(),
                            format!("{}/{}", reference.kind, reference.name),
                        )
                        .into());
                    }
                    trace!(
                        "{}: reference to {}/{} outside the set",
                        obj.identity(),
                        reference.kind,
                        reference.name
                    );
                }
            }
        }
    }

    // rule 7: services depend on the workloads their selectors match
    for (svc_idx, svc) in &indices {
        let selector = match kinds::service_selector(svc) {
            Some(s) => s,
            None => continue,
        };
        for (wl_idx, wl) in &indices {
            if !kinds::is_workload(wl.kind()) || wl.namespace() != svc.namespace() {
                continue;
            }
            // cron jobs schedule after services; their pods are transient
            // and must not pull the service backwards in the wave order
            if wl.kind() == "CronJob" {
                continue;
            }
            if let Some(labels) = kinds::template_labels(wl) {
                if selector.iter().all(|(k, v)| labels.get(k) == Some(v)) {
                    graph.update_edge(*wl_idx, *svc_idx, DepEdge::Selector);
                }
            }
        }
    }

    // explicit dependency hints
    for (idx, obj) in &indices {
        let raw = match obj.annotation(kinds::DEPENDS_ON_ANNOTATION) {
            Some(r) => r,
            None => continue,
        };
        for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match loader::parse_ref(item, obj.namespace()) {
                Some(key) => match by_key.get(&key) {
                    Some(target) => {
                        graph.update_edge(*target, *idx, DepEdge::Explicit);
                    }
                    None => {
                        if validate && !set.is_external(&key.0, &key.1, &key.2) {
                            return Err(ErrorKind::DanglingReference(
                                obj.identity().to_string(),
                                item.to_string(),
                            )
                            .into());
                        }
                    }
                },
                None => warn!("{}: unparseable dependency '{}' ignored", obj.identity(), item),
            }
        }
    }

    // kind rule: deploy waves between adjacent ranks present in the set
    let mut by_rank: BTreeMap<u8, Vec<NodeIndex>> = BTreeMap::new();
    for (idx, obj) in &indices {
        by_rank
            .entry(kinds::deploy_rank(obj.kind()))
            .or_insert_with(Vec::new)
            .push(*idx);
    }
    let ranks: Vec<u8> = by_rank.keys().cloned().collect();
    for pair in ranks.windows(2) {
        for earlier in &by_rank[&pair[0]] {
            for later in &by_rank[&pair[1]] {
                if graph.find_edge(*earlier, *later).is_none() {
                    graph.add_edge(*earlier, *later, DepEdge::KindOrder);
                }
            }
        }
    }

    Ok(graph)
}

/// Kahn level assignment with stable tie-breaking.
pub fn levels(graph: &DeployGraph) -> Result<Layered> {
    let mut indeg: BTreeMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|i| (i, graph.neighbors_directed(i, Direction::Incoming).count()))
        .collect();

    let mut layered = Layered::default();
    loop {
        let mut wave: Vec<NodeIndex> = indeg
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(idx, _)| *idx)
            .collect();
        if wave.is_empty() {
            break;
        }
        wave.sort_by_key(|idx| graph[*idx].identity.sort_key());
        for idx in &wave {
            indeg.remove(idx);
        }
        for idx in &wave {
            for succ in graph.neighbors_directed(*idx, Direction::Outgoing) {
                if let Some(deg) = indeg.get_mut(&succ) {
                    *deg -= 1;
                }
            }
        }
        layered
            .levels
            .push(wave.iter().map(|idx| graph[*idx].identity.clone()).collect());
    }

    if !indeg.is_empty() {
        let remaining: BTreeSet<NodeIndex> = indeg.keys().cloned().collect();
        return Err(ErrorKind::CycleDetected(find_cycle(graph, &remaining)).into());
    }
    Ok(layered)
}

/// Extract one witnessing cycle from the nodes Kahn could not place.
///
/// Every remaining node still has an in-edge from another remaining node,
/// so walking predecessors must revisit one.
fn find_cycle(graph: &DeployGraph, remaining: &BTreeSet<NodeIndex>) -> Vec<String> {
    let start = match remaining.iter().next() {
        Some(idx) => *idx,
        None => return vec![],
    };
    let mut path: Vec<NodeIndex> = Vec::new();
    let mut position: BTreeMap<NodeIndex, usize> = BTreeMap::new();
    let mut cur = start;
    loop {
        if let Some(&i) = position.get(&cur) {
            let mut cycle: Vec<String> = path[i..]
                .iter()
                .map(|idx| graph[*idx].identity.to_string())
                .collect();
            // the walk followed predecessors, so flip into apply order
            cycle.reverse();
            return cycle;
        }
        position.insert(cur, path.len());
        path.push(cur);
        match graph
            .neighbors_directed(cur, Direction::Incoming)
            .find(|n| remaining.contains(n))
        {
            Some(pred) => cur = pred,
            None => {
                return path
                    .iter()
                    .map(|idx| graph[*idx].identity.to_string())
                    .collect()
            }
        }
    }
}

/// Graphviz rendering of the dependency graph.
pub fn to_dot(graph: &DeployGraph) -> String {
    format!(
        "{:?}",
        dot::Dot::with_config(graph, &[dot::Config::EdgeNoLabel])
    )
}

#[cfg(test)]
mod tests {
    use super::super::{loader, Origin};
    use super::*;

    fn set_from(yaml: &str) -> ObjectSet {
        let objs = loader::load_documents(yaml, &Origin::Literal("test".into())).unwrap();
        ObjectSet::new(objs).unwrap()
    }

    #[test]
    fn namespace_containment_orders_first() {
        let set = set_from(
            r#"---
apiVersion: v1
kind: ConfigMap
metadata:
  name: cm
  namespace: shop
---
apiVersion: v1
kind: Namespace
metadata:
  name: shop
"#,
        );
        let layered = plan(&set, false).unwrap();
        assert_eq!(layered.levels.len(), 2);
        assert_eq!(layered.levels[0][0].to_string(), "Namespace/shop");
        assert_eq!(layered.levels[1][0].to_string(), "ConfigMap/shop/cm");
    }

    #[test]
    fn explicit_hints_can_form_cycles() {
        let set = set_from(
            r#"---
apiVersion: v1
kind: Service
metadata:
  name: alpha
  namespace: shop
  annotations:
    piceli.dev/depends-on: "Service/beta"
spec:
  ports:
  - port: 80
---
apiVersion: v1
kind: Service
metadata:
  name: beta
  namespace: shop
  annotations:
    piceli.dev/depends-on: "Service/alpha"
spec:
  ports:
  - port: 80
"#,
        );
        let err = plan(&set, false).unwrap_err();
        match err {
            super::super::Error(ErrorKind::CycleDetected(cycle), _) => {
                assert!(cycle.iter().any(|n| n.contains("alpha")));
                assert!(cycle.iter().any(|n| n.contains("beta")));
            }
            other => panic!("expected CycleDetected, got {}", other),
        }
    }

    #[test]
    fn dangling_reference_only_fails_validation() {
        let raw = r#"---
apiVersion: rbac.authorization.k8s.io/v1
kind: RoleBinding
metadata:
  name: rb
  namespace: shop
roleRef:
  kind: Role
  name: missing-role
subjects:
- kind: ServiceAccount
  name: missing-sa
"#;
        let set = set_from(raw);
        assert!(plan(&set, false).is_ok());
        let err = plan(&set, true).unwrap_err();
        assert!(err.to_string().contains("missing-role"));

        // marking the references external restores validation
        let mut annotated = set_from(raw);
        annotated.mark_external("Role", "shop", "missing-role");
        annotated.mark_external("ServiceAccount", "shop", "missing-sa");
        assert!(plan(&annotated, true).is_ok());
    }

    #[test]
    fn selector_matches_create_workload_edges() {
        let set = set_from(
            r#"---
apiVersion: v1
kind: Service
metadata:
  name: svc
  namespace: shop
spec:
  selector:
    app: web
  ports:
  - port: 80
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: shop
spec:
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
        let layered = plan(&set, false).unwrap();
        assert_eq!(layered.levels.len(), 2);
        assert_eq!(layered.levels[0][0].kind, "Deployment");
        assert_eq!(layered.levels[1][0].kind, "Service");
    }
}
