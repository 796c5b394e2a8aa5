//! Kind knowledge tables.
//!
//! Everything the engine knows about individual kubernetes kinds lives
//! here as data: deploy-wave ranks, reference extraction, server defaults,
//! server-managed (ignored) paths, set-valued sequences and immutable
//! fields. The comparator and resolver stay kind-agnostic by consuming
//! these tables.

use std::collections::BTreeMap;

use super::node::{path_matches, Node, Step};
use super::object::CanonicalObject;

/// Objects may declare extra dependencies explicitly,
/// e.g. `piceli.dev/depends-on: "Service/other, ConfigMap/shared/cm"`.
pub const DEPENDS_ON_ANNOTATION: &str = "piceli.dev/depends-on";

/// References listed here are assumed to exist outside the input set and
/// are exempt from dangling-reference validation.
pub const EXTERNAL_ANNOTATION: &str = "piceli.dev/external";

/// Deploy-wave rank. Objects of a lower rank are applied before objects
/// of a higher rank; kinds sharing a rank have no ordering between them
/// beyond explicit references. Unknown kinds (custom resources) go last.
pub fn deploy_rank(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "Role" | "ClusterRole" | "ServiceAccount" | "StorageClass" | "PersistentVolume" => 1,
        "RoleBinding" | "ClusterRoleBinding" => 2,
        "Secret" | "ConfigMap" => 3,
        "PersistentVolumeClaim" => 4,
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" | "Pod" => 5,
        "Service" | "Ingress" => 6,
        "CronJob" => 7,
        "HorizontalPodAutoscaler" | "VerticalPodAutoscaler" | "PodDisruptionBudget" => 8,
        _ => 9,
    }
}

pub fn is_cluster_scoped(kind: &str) -> bool {
    match kind {
        "Namespace"
        | "ClusterRole"
        | "ClusterRoleBinding"
        | "StorageClass"
        | "PersistentVolume"
        | "PriorityClass"
        | "CustomResourceDefinition" => true,
        _ => false,
    }
}

pub fn is_workload(kind: &str) -> bool {
    match kind {
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" | "CronJob" | "Pod" => {
            true
        }
        _ => false,
    }
}

/// Kinds the executor polls for readiness; everything else counts as
/// ready once the apply is acknowledged.
pub fn has_readiness(kind: &str) -> bool {
    match kind {
        "Deployment" | "StatefulSet" | "Job" | "Namespace" => true,
        _ => false,
    }
}

/// Kinds whose spec cannot be patched in place; any differing path means
/// delete-then-create.
pub fn is_immutable_kind(kind: &str) -> bool {
    match kind {
        "Job" | "PersistentVolume" | "StorageClass" => true,
        _ => false,
    }
}

/// Path prefixes that cannot be patched for otherwise patchable kinds.
pub fn immutable_prefixes(kind: &str) -> &'static [&'static [&'static str]] {
    match kind {
        "Service" => &[&["spec", "selector"], &["spec", "clusterIP"]],
        "Deployment" | "DaemonSet" => &[&["spec", "selector"]],
        "StatefulSet" => &[
            &["spec", "selector"],
            &["spec", "serviceName"],
            &["spec", "volumeClaimTemplates"],
            &["spec", "podManagementPolicy"],
        ],
        "PersistentVolumeClaim" => &[
            &["spec", "accessModes"],
            &["spec", "storageClassName"],
            &["spec", "volumeMode"],
            &["spec", "selector"],
        ],
        _ => &[],
    }
}

/// Server-managed fields that never participate in diff-driven decisions.
/// Only consulted for paths present on the live side alone.
const IGNORED_COMMON: &[&[&str]] = &[
    &["metadata", "creationTimestamp"],
    &["metadata", "resourceVersion"],
    &["metadata", "uid"],
    &["metadata", "generation"],
    &["metadata", "selfLink"],
    &["metadata", "managedFields"],
    &["metadata", "annotations", "kubectl.kubernetes.io/last-applied-configuration"],
    &["metadata", "annotations", "deployment.kubernetes.io/revision"],
    &["status"],
];

/// `metadata.ownerReferences` is ignored only while the desired side does
/// not set it; the comparator special-cases this entry.
pub const OWNER_REFERENCES: &[&str] = &["metadata", "ownerReferences"];

pub fn ignored_paths(kind: &str) -> Vec<&'static [&'static str]> {
    let mut paths: Vec<&'static [&'static str]> = IGNORED_COMMON.to_vec();
    match kind {
        "Service" => {
            paths.push(&["spec", "clusterIP"]);
            paths.push(&["spec", "clusterIPs"]);
            paths.push(&["spec", "ipFamilies"]);
            paths.push(&["spec", "ipFamilyPolicy"]);
        }
        "PersistentVolumeClaim" => {
            paths.push(&["spec", "volumeName"]);
            paths.push(&["metadata", "annotations", "pv.kubernetes.io/bind-completed"]);
            paths.push(&["metadata", "annotations", "pv.kubernetes.io/bound-by-controller"]);
        }
        "ServiceAccount" => {
            // token secrets injected by the controller
            paths.push(&["secrets"]);
        }
        _ => {}
    }
    paths
}

/// Known server defaults: a live-side path whose value equals the listed
/// default, with no desired-side counterpart, is `Defaulted` rather than
/// `Differing`. Unknown combinations fall through to `Differing`.
pub fn server_defaults(kind: &str) -> Vec<(&'static [&'static str], Node)> {
    match kind {
        "StorageClass" => vec![
            (&["reclaimPolicy"][..], Node::from("Delete")),
            (&["volumeBindingMode"][..], Node::from("Immediate")),
            (&["spec", "reclaimPolicy"][..], Node::from("Delete")),
            (&["spec", "volumeBindingMode"][..], Node::from("Immediate")),
        ],
        "Service" => vec![
            (&["spec", "type"][..], Node::from("ClusterIP")),
            (&["spec", "sessionAffinity"][..], Node::from("None")),
            (&["spec", "ports", "*", "protocol"][..], Node::from("TCP")),
        ],
        "Deployment" => vec![
            (&["spec", "revisionHistoryLimit"][..], Node::from(10i64)),
            (&["spec", "progressDeadlineSeconds"][..], Node::from(600i64)),
            (&["spec", "strategy", "type"][..], Node::from("RollingUpdate")),
            (
                &["spec", "strategy", "rollingUpdate", "maxSurge"][..],
                Node::from("25%"),
            ),
            (
                &["spec", "strategy", "rollingUpdate", "maxUnavailable"][..],
                Node::from("25%"),
            ),
        ]
        .into_iter()
        .chain(pod_template_defaults())
        .collect(),
        "StatefulSet" => vec![
            (&["spec", "revisionHistoryLimit"][..], Node::from(10i64)),
            (&["spec", "podManagementPolicy"][..], Node::from("OrderedReady")),
            (
                &["spec", "updateStrategy", "type"][..],
                Node::from("RollingUpdate"),
            ),
        ]
        .into_iter()
        .chain(pod_template_defaults())
        .collect(),
        "Job" => vec![
            (&["spec", "backoffLimit"][..], Node::from(6i64)),
            (&["spec", "completions"][..], Node::from(1i64)),
            (&["spec", "parallelism"][..], Node::from(1i64)),
        ]
        .into_iter()
        .chain(pod_template_defaults())
        .collect(),
        "CronJob" => vec![
            (&["spec", "concurrencyPolicy"][..], Node::from("Allow")),
            (&["spec", "suspend"][..], Node::from(false)),
            (&["spec", "successfulJobsHistoryLimit"][..], Node::from(3i64)),
            (&["spec", "failedJobsHistoryLimit"][..], Node::from(1i64)),
        ],
        "PersistentVolumeClaim" => vec![(&["spec", "volumeMode"][..], Node::from("Filesystem"))],
        "Secret" => vec![(&["type"][..], Node::from("Opaque"))],
        "Namespace" => vec![(
            &["spec", "finalizers"][..],
            Node::seq(vec![Node::from("kubernetes")]),
        )],
        _ => vec![],
    }
}

// paths below a workload's pod template the apiserver always fills in
fn pod_template_defaults() -> Vec<(&'static [&'static str], Node)> {
    vec![
        (
            &["spec", "template", "spec", "restartPolicy"][..],
            Node::from("Always"),
        ),
        (
            &["spec", "template", "spec", "dnsPolicy"][..],
            Node::from("ClusterFirst"),
        ),
        (
            &["spec", "template", "spec", "schedulerName"][..],
            Node::from("default-scheduler"),
        ),
        (
            &["spec", "template", "spec", "terminationGracePeriodSeconds"][..],
            Node::from(30i64),
        ),
        (
            &["spec", "template", "spec", "securityContext"][..],
            Node::map(vec![]),
        ),
        (
            &["spec", "template", "spec", "containers", "*", "terminationMessagePath"][..],
            Node::from("/dev/termination-log"),
        ),
        (
            &["spec", "template", "spec", "containers", "*", "terminationMessagePolicy"][..],
            Node::from("File"),
        ),
    ]
}

/// How a set-valued sequence identifies its members for comparison.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SetKey {
    /// compare as a multiset of whole values
    Value,
    /// pair members by their `name` field
    Name,
    /// pair members by `name` + `kind` (rbac subjects)
    NameKind,
}

/// Sequences that compare as multisets instead of positionally.
pub fn set_valued(kind: &str, path: &[Step]) -> Option<SetKey> {
    if path_matches(path, &["metadata", "finalizers"]) {
        return Some(SetKey::Value);
    }
    match kind {
        "RoleBinding" | "ClusterRoleBinding" => {
            if path_matches(path, &["subjects"]) {
                return Some(SetKey::NameKind);
            }
        }
        "Role" | "ClusterRole" => {
            if path_matches(path, &["rules"]) {
                return Some(SetKey::Value);
            }
        }
        "PersistentVolumeClaim" => {
            if path_matches(path, &["spec", "accessModes"]) {
                return Some(SetKey::Value);
            }
        }
        _ => {}
    }
    // container env lists, wherever the pod template sits for this kind
    if let Some(Step::Key(last)) = path.last() {
        if last == "env" && path.iter().any(|s| match s {
            Step::Key(k) => k == "containers" || k == "initContainers",
            _ => false,
        }) {
            return Some(SetKey::Name);
        }
        if last == "imagePullSecrets" {
            return Some(SetKey::Value);
        }
    }
    None
}

/// A cross-object reference discovered in a spec tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Reference {
    pub kind: String,
    pub name: String,
    /// explicit namespace if the reference carries one (rbac subjects do);
    /// otherwise resolution defaults to the referring object's namespace
    pub namespace: Option<String>,
    pub via: RefVia,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RefVia {
    RoleRef,
    Subject,
    ServiceAccount,
    ConfigMap,
    Secret,
    VolumeClaim,
    StorageClass,
    ScaleTarget,
}

/// The pod spec node of a workload, wherever its kind nests it.
pub fn pod_spec(obj: &CanonicalObject) -> Option<&Node> {
    let tree = obj.tree();
    match obj.kind() {
        "Pod" => tree.get("spec"),
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" => {
            tree.dig(&["spec", "template", "spec"])
        }
        "CronJob" => tree.dig(&["spec", "jobTemplate", "spec", "template", "spec"]),
        _ => None,
    }
}

/// Labels on a workload's pod template, used for service selector matching.
pub fn template_labels(obj: &CanonicalObject) -> Option<BTreeMap<String, String>> {
    let tree = obj.tree();
    let labels = match obj.kind() {
        "Pod" => tree.dig(&["metadata", "labels"]),
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" => {
            tree.dig(&["spec", "template", "metadata", "labels"])
        }
        "CronJob" => tree.dig(&[
            "spec",
            "jobTemplate",
            "spec",
            "template",
            "metadata",
            "labels",
        ]),
        _ => None,
    }?;
    node_string_map(labels)
}

/// A `Service`'s pod selector, if it has one.
pub fn service_selector(obj: &CanonicalObject) -> Option<BTreeMap<String, String>> {
    if obj.kind() != "Service" {
        return None;
    }
    let selector = obj.tree().dig(&["spec", "selector"])?;
    let map = node_string_map(selector)?;
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

fn node_string_map(node: &Node) -> Option<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (k, v) in node.as_map()? {
        out.insert(k.clone(), v.as_str()?.to_string());
    }
    Some(out)
}

/// Extract every cross-object reference rules 2-6 know about.
/// Rule 1 (namespace containment) and rule 7 (service selector matching)
/// need whole-set context and live in the resolver.
pub fn references(obj: &CanonicalObject) -> Vec<Reference> {
    let mut refs = Vec::new();
    match obj.kind() {
        "RoleBinding" | "ClusterRoleBinding" => rbac_references(obj, &mut refs),
        "PersistentVolumeClaim" => {
            if let Some(sc) = obj
                .tree()
                .dig(&["spec", "storageClassName"])
                .and_then(Node::as_str)
            {
                refs.push(Reference {
                    kind: "StorageClass".into(),
                    name: sc.into(),
                    namespace: None,
                    via: RefVia::StorageClass,
                });
            }
        }
        "HorizontalPodAutoscaler" | "VerticalPodAutoscaler" => {
            let target = match obj.kind() {
                "HorizontalPodAutoscaler" => obj.tree().dig(&["spec", "scaleTargetRef"]),
                _ => obj.tree().dig(&["spec", "targetRef"]),
            };
            if let Some(t) = target {
                if let (Some(kind), Some(name)) = (
                    t.get("kind").and_then(Node::as_str),
                    t.get("name").and_then(Node::as_str),
                ) {
                    refs.push(Reference {
                        kind: kind.into(),
                        name: name.into(),
                        namespace: None,
                        via: RefVia::ScaleTarget,
                    });
                }
            }
        }
        _ => {}
    }
    if is_workload(obj.kind()) {
        if let Some(spec) = pod_spec(obj) {
            workload_references(spec, &mut refs);
        }
    }
    refs
}

fn rbac_references(obj: &CanonicalObject, refs: &mut Vec<Reference>) {
    let tree = obj.tree();
    if let Some(role_ref) = tree.get("roleRef") {
        if let (Some(kind), Some(name)) = (
            role_ref.get("kind").and_then(Node::as_str),
            role_ref.get("name").and_then(Node::as_str),
        ) {
            refs.push(Reference {
                kind: kind.into(),
                name: name.into(),
                namespace: None,
                via: RefVia::RoleRef,
            });
        }
    }
    if let Some(subjects) = tree.get("subjects").and_then(Node::as_seq) {
        for subject in subjects {
            if subject.get("kind").and_then(Node::as_str) != Some("ServiceAccount") {
                continue;
            }
            if let Some(name) = subject.get("name").and_then(Node::as_str) {
                refs.push(Reference {
                    kind: "ServiceAccount".into(),
                    name: name.into(),
                    namespace: subject
                        .get("namespace")
                        .and_then(Node::as_str)
                        .map(String::from),
                    via: RefVia::Subject,
                });
            }
        }
    }
}

fn workload_references(pod_spec: &Node, refs: &mut Vec<Reference>) {
    if let Some(sa) = pod_spec.get("serviceAccountName").and_then(Node::as_str) {
        refs.push(Reference {
            kind: "ServiceAccount".into(),
            name: sa.into(),
            namespace: None,
            via: RefVia::ServiceAccount,
        });
    }
    if let Some(volumes) = pod_spec.get("volumes").and_then(Node::as_seq) {
        for volume in volumes {
            if let Some(name) = volume.dig(&["configMap", "name"]).and_then(Node::as_str) {
                push_ref(refs, "ConfigMap", name, RefVia::ConfigMap);
            }
            if let Some(name) = volume.dig(&["secret", "secretName"]).and_then(Node::as_str) {
                push_ref(refs, "Secret", name, RefVia::Secret);
            }
            if let Some(name) = volume
                .dig(&["persistentVolumeClaim", "claimName"])
                .and_then(Node::as_str)
            {
                push_ref(refs, "PersistentVolumeClaim", name, RefVia::VolumeClaim);
            }
        }
    }
    if let Some(pull) = pod_spec.get("imagePullSecrets").and_then(Node::as_seq) {
        for entry in pull {
            if let Some(name) = entry.get("name").and_then(Node::as_str) {
                push_ref(refs, "Secret", name, RefVia::Secret);
            }
        }
    }
    for field in &["containers", "initContainers"] {
        if let Some(containers) = pod_spec.get(field).and_then(Node::as_seq) {
            for container in containers {
                container_references(container, refs);
            }
        }
    }
}

fn container_references(container: &Node, refs: &mut Vec<Reference>) {
    if let Some(env_from) = container.get("envFrom").and_then(Node::as_seq) {
        for source in env_from {
            if let Some(name) = source.dig(&["configMapRef", "name"]).and_then(Node::as_str) {
                push_ref(refs, "ConfigMap", name, RefVia::ConfigMap);
            }
            if let Some(name) = source.dig(&["secretRef", "name"]).and_then(Node::as_str) {
                push_ref(refs, "Secret", name, RefVia::Secret);
            }
        }
    }
    if let Some(env) = container.get("env").and_then(Node::as_seq) {
        for var in env {
            if let Some(name) = var
                .dig(&["valueFrom", "configMapKeyRef", "name"])
                .and_then(Node::as_str)
            {
                push_ref(refs, "ConfigMap", name, RefVia::ConfigMap);
            }
            if let Some(name) = var
                .dig(&["valueFrom", "secretKeyRef", "name"])
                .and_then(Node::as_str)
            {
                push_ref(refs, "Secret", name, RefVia::Secret);
            }
        }
    }
}

fn push_ref(refs: &mut Vec<Reference>, kind: &str, name: &str, via: RefVia) {
    let candidate = Reference {
        kind: kind.into(),
        name: name.into(),
        namespace: None,
        via,
    };
    if !refs.contains(&candidate) {
        refs.push(candidate);
    }
}
