//! kubectl-backed implementation of `ClusterTransport`.
//!
//! Drives the cluster through the `kubectl` binary rather than a direct
//! apiserver client: `get -o json` for reads, stdin-fed `create` /
//! `replace --force` for bodies, `patch --type=merge` for merge patches.
//! stderr is classified into transient vs terminal failures.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::kube::ClusterTransport;
use super::node::Node;
use super::{CanonicalObject, Identity, Origin};
use super::{ErrorKind, Result, ResultExt};

/// Verify kubectl exists before any cluster work starts.
pub fn ensure_installed() -> Result<()> {
    which::which("kubectl").map_err(|_| ErrorKind::KubectlMissing)?;
    Ok(())
}

/// CLI way to resolve the active kube context.
pub async fn current_context() -> Result<String> {
    let (out, _, success) = kout(vec!["config".into(), "current-context".into()]).await?;
    if !success {
        bail!("failed to get kubectl current-context - is kubectl configured?");
    }
    Ok(out.trim().to_string())
}

async fn kout(args: Vec<String>) -> Result<(String, String, bool)> {
    debug!("kubectl {}", args.join(" "));
    let s = Command::new("kubectl").args(&args).output().await?;
    let out: String = String::from_utf8_lossy(&s.stdout).into();
    let err: String = String::from_utf8_lossy(&s.stderr).trim().to_string();
    if !err.is_empty() {
        debug!("kubectl {} stderr: {}", args.join(" "), err);
    }
    Ok((out, err, s.status.success()))
}

/// Run kubectl with a body piped to stdin.
async fn kin(args: Vec<String>, body: String) -> Result<(String, String, bool)> {
    debug!("kubectl {} <- {} bytes", args.join(" "), body.len());
    let mut child = Command::new("kubectl")
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    match child.stdin.take() {
        Some(mut stdin) => {
            stdin.write_all(body.as_bytes()).await?;
        }
        None => bail!("kubectl did not expose stdin"),
    }
    let out = child.wait_with_output().await?;
    let stdout: String = String::from_utf8_lossy(&out.stdout).into();
    let stderr: String = String::from_utf8_lossy(&out.stderr).trim().to_string();
    Ok((stdout, stderr, out.status.success()))
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("(NotFound)") || stderr.contains("not found")
}

const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "no route to host",
    "i/o timeout",
    "timed out",
    "timeout",
    "temporarily unavailable",
    "too many requests",
    "429",
    "conflict",
    "etcdserver",
    "tls handshake",
    "eof",
    "service unavailable",
];

fn classify(op: &str, id: &Identity, stderr: &str) -> super::Error {
    let lowered = stderr.to_lowercase();
    let what = format!("{} {}", op, id);
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        ErrorKind::TransientTransport(what, stderr.to_string()).into()
    } else {
        ErrorKind::TerminalTransport(what, stderr.to_string()).into()
    }
}

/// The live transport; holds the optional kube context override.
#[derive(Default)]
pub struct KubectlTransport {
    context: Option<String>,
}

impl KubectlTransport {
    pub fn new() -> KubectlTransport {
        KubectlTransport::default()
    }

    pub fn with_context(context: &str) -> KubectlTransport {
        KubectlTransport {
            context: Some(context.to_string()),
        }
    }

    /// kubectl resource spelling: `kind[.version.group]`.
    fn resource_arg(id: &Identity) -> String {
        if id.group.is_empty() {
            id.kind.to_lowercase()
        } else {
            format!("{}.{}.{}", id.kind.to_lowercase(), id.version, id.group)
        }
    }

    fn base_args(&self, id: &Identity) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ctx) = &self.context {
            args.push(format!("--context={}", ctx));
        }
        if !id.namespace.is_empty() {
            args.push(format!("-n={}", id.namespace));
        }
        args
    }
}

#[async_trait]
impl ClusterTransport for KubectlTransport {
    async fn get(&self, id: &Identity) -> Result<Option<CanonicalObject>> {
        let mut args = self.base_args(id);
        args.extend(vec![
            "get".into(),
            Self::resource_arg(id),
            id.name.clone(),
            "-o".into(),
            "json".into(),
        ]);
        let (out, err, success) = kout(args).await?;
        if !success {
            if is_not_found(&err) {
                return Ok(None);
            }
            return Err(classify("get", id, &err));
        }
        let tree: Node = serde_json::from_str(&out)
            .chain_err(|| format!("unparseable live object for {}", id))?;
        let obj = CanonicalObject::from_wire(tree, Origin::Literal(format!("live:{}", id)))?;
        Ok(Some(obj))
    }

    async fn create(&self, id: &Identity, body: &Node) -> Result<()> {
        let mut args = self.base_args(id);
        args.extend(vec!["create".into(), "-f".into(), "-".into()]);
        let (_, err, success) = kin(args, serde_json::to_string(body)?).await?;
        if !success {
            return Err(classify("create", id, &err));
        }
        Ok(())
    }

    async fn patch(&self, id: &Identity, patch: &Node) -> Result<()> {
        let mut args = self.base_args(id);
        args.extend(vec![
            "patch".into(),
            Self::resource_arg(id),
            id.name.clone(),
            "--type=merge".into(),
            "-p".into(),
            serde_json::to_string(patch)?,
        ]);
        let (_, err, success) = kout(args).await?;
        if !success {
            return Err(classify("patch", id, &err));
        }
        Ok(())
    }

    async fn replace(&self, id: &Identity, body: &Node) -> Result<()> {
        // --force gives the delete-then-create semantics replacement needs
        let mut args = self.base_args(id);
        args.extend(vec![
            "replace".into(),
            "--force".into(),
            "-f".into(),
            "-".into(),
        ]);
        let (_, err, success) = kin(args, serde_json::to_string(body)?).await?;
        if !success {
            let lowered = err.to_lowercase();
            // deletion withheld by finalizers or a terminating owner
            if lowered.contains("finalizer") || lowered.contains("being deleted") {
                return Err(ErrorKind::ReplaceBlocked(id.to_string()).into());
            }
            return Err(classify("replace", id, &err));
        }
        Ok(())
    }

    async fn delete(&self, id: &Identity) -> Result<()> {
        let mut args = self.base_args(id);
        args.extend(vec![
            "delete".into(),
            Self::resource_arg(id),
            id.name.clone(),
            "--ignore-not-found=true".into(),
        ]);
        let (_, err, success) = kout(args).await?;
        if !success {
            return Err(classify("delete", id, &err));
        }
        Ok(())
    }
}
