#![recursion_limit = "1024"]
#![allow(renamed_and_removed_lints)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate serde_yaml;

extern crate chrono;
extern crate futures;
extern crate futures_timer;
extern crate k8s_openapi;
extern crate petgraph;
extern crate tokio;
extern crate which;

#[macro_use]
extern crate log;

#[macro_use]
extern crate error_chain;
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {
        Defs(piceli_definitions::Error, piceli_definitions::ErrorKind);
    }
    foreign_links {
        Fmt(::std::fmt::Error);
        Io(::std::io::Error);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
    }
    errors {
        KubectlMissing {
            description("kubectl not found on PATH")
            display("kubectl not found on PATH - piceli drives the cluster through kubectl")
        }
        CycleDetected(cycle: Vec<String>) {
            description("dependency cycle detected")
            display("dependency cycle detected: {}", cycle.join(" -> "))
        }
        DanglingReference(from: String, to: String) {
            description("reference to an object outside the input set")
            display("{} references {} which is neither in the input set nor marked external", from, to)
        }
        ReplaceBlocked(id: String) {
            description("object could not be replaced")
            display("replacement of {} is blocked on the cluster", id)
        }
        TransientTransport(op: String, msg: String) {
            description("transient cluster error")
            display("transient failure during {}: {}", op, msg)
        }
        TerminalTransport(op: String, msg: String) {
            description("terminal cluster error")
            display("cluster rejected {}: {}", op, msg)
        }
        DeployTimeout(secs: u64) {
            description("deploy budget exhausted")
            display("deploy did not complete within {}s", secs)
        }
        ReadinessTimeout(id: String, secs: u64) {
            description("readiness wait timed out")
            display("{} did not become ready within {}s", id, secs)
        }
        WorkloadFailed(id: String, reason: String) {
            description("workload reached a terminal failure")
            display("{} failed: {}", id, reason)
        }
        ApplyFailed(id: String) {
            description("an object could not be applied")
            display("applying {} failed", id)
        }
        RollbackStepFailed(id: String, msg: String) {
            description("a rollback step failed")
            display("rollback of {} failed: {}", id, msg)
        }
    }
}

pub use piceli_definitions::{kinds, loader, node, object};
pub use piceli_definitions::{CanonicalObject, Identity, Node, ObjectSet, Origin};

/// Dependency resolver: reference and kind-rule edges, level schedule
pub mod graph;

/// Semantic comparator between live and desired objects
pub mod diff;

/// Per-object reconciliation planner
pub mod plan;

/// Reversible pre-image journal for aborted deploys
pub mod journal;

/// Cluster transport trait consumed by the executor
pub mod kube;

/// kubectl-backed live transport
pub mod kubectl;

/// Readiness tracking for workloads
pub mod track;

/// Level-by-level apply executor
pub mod apply;

/// Identity and origin listers
pub mod list;
