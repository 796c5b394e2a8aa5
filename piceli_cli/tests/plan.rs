extern crate piceli;

mod common;

use common::{fixture_set, set_from, setup};
use piceli::{graph, ObjectSet};

fn level_names(layered: &graph::Layered) -> Vec<Vec<String>> {
    layered
        .levels
        .iter()
        .map(|level| level.iter().map(|id| id.to_string()).collect())
        .collect()
}

#[test]
fn layered_deploy_schedule() {
    setup();
    let set = fixture_set();
    let layered = graph::plan(&set, true).unwrap();
    let names = level_names(&layered);
    assert_eq!(
        names,
        vec![
            vec![
                "Role/shop/example-role".to_string(),
                "ServiceAccount/shop/example-sa".to_string(),
                "StorageClass/resizable".to_string(),
            ],
            vec!["RoleBinding/shop/example-rb".to_string()],
            vec![
                "ConfigMap/shop/example-cm".to_string(),
                "Secret/shop/example-secret".to_string(),
            ],
            vec!["PersistentVolumeClaim/shop/example-pvc".to_string()],
            vec!["Deployment/shop/example-deploy".to_string()],
            vec!["Service/shop/example-svc".to_string()],
            vec!["CronJob/shop/example-cron".to_string()],
            vec!["HorizontalPodAutoscaler/shop/example-hpa".to_string()],
        ]
    );
}

#[test]
fn shuffled_input_gives_the_same_schedule() {
    setup();
    let forward = graph::plan(&fixture_set(), false).unwrap();

    // reload in reverse file order
    let mut objects = piceli::loader::load_folder(&common::fixtures_dir(), false).unwrap();
    objects.reverse();
    let shuffled = ObjectSet::new(objects).unwrap();
    let backward = graph::plan(&shuffled, false).unwrap();

    assert_eq!(level_names(&forward), level_names(&backward));
}

#[test]
fn levels_respect_every_dependency_path() {
    setup();
    let set = fixture_set();
    let layered = graph::plan(&set, false).unwrap();

    // spot-check the happens-before pairs the references mandate
    let level = |name: &str| {
        layered
            .levels
            .iter()
            .position(|l| l.iter().any(|id| id.to_string().contains(name)))
            .unwrap()
    };
    assert!(level("example-role") < level("example-rb"));
    assert!(level("example-sa") < level("example-rb"));
    assert!(level("resizable") < level("example-pvc"));
    assert!(level("example-cm") < level("example-deploy"));
    assert!(level("example-secret") < level("example-deploy"));
    assert!(level("example-pvc") < level("example-deploy"));
    assert!(level("example-sa") < level("example-deploy"));
    assert!(level("example-deploy") < level("example-svc"));
    assert!(level("example-deploy") < level("example-hpa"));
}

#[test]
fn cycle_detection_reports_a_witness() {
    setup();
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
    let err = graph::plan(&set, false).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("cycle"), "unexpected error: {}", msg);
    assert!(msg.contains("alpha"));
    assert!(msg.contains("beta"));
}

#[test]
fn dangling_subject_fails_only_under_validation() {
    setup();
    let raw = r#"---
apiVersion: rbac.authorization.k8s.io/v1
kind: RoleBinding
metadata:
  name: example-rb
  namespace: shop
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: admin
  # the cluster role pre-exists everywhere
subjects:
- kind: ServiceAccount
  name: ghost-sa
"#;
    // without validation the binding is planned as-is
    let set = set_from(raw);
    assert!(graph::plan(&set, false).is_ok());

    // with validation the unresolved subject is rejected
    let err = graph::plan(&set, true).unwrap_err();
    assert!(err.to_string().contains("admin") || err.to_string().contains("ghost-sa"));

    // annotating the references as external restores the plan
    let annotated = set_from(
        r#"---
apiVersion: rbac.authorization.k8s.io/v1
kind: RoleBinding
metadata:
  name: example-rb
  namespace: shop
  annotations:
    piceli.dev/external: "ClusterRole/admin, ServiceAccount/ghost-sa"
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: admin
subjects:
- kind: ServiceAccount
  name: ghost-sa
"#,
    );
    assert!(graph::plan(&annotated, true).is_ok());
}

#[test]
fn unknown_kinds_schedule_after_known_ones() {
    setup();
    let set = set_from(
        r#"---
apiVersion: example.dev/v1
kind: Widget
metadata:
  name: widget
  namespace: shop
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: cm
  namespace: shop
"#,
    );
    let layered = graph::plan(&set, false).unwrap();
    let names = level_names(&layered);
    assert_eq!(names[0], vec!["ConfigMap/shop/cm".to_string()]);
    assert_eq!(names[1], vec!["Widget/shop/widget".to_string()]);
}
