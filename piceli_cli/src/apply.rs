//! The level-by-level apply executor.
//!
//! Levels run strictly in order; objects within a level fan out over a
//! bounded set of concurrent workers. Each object is re-read from the
//! cluster just before mutation (the journal pre-image), planned against
//! its live state, submitted with transient-error backoff and then polled
//! to readiness. Any terminal failure stops admission for the level,
//! drains in-flight work and replays the journal in reverse.

use futures::stream::{FuturesUnordered, StreamExt};
use futures_timer::Delay;
use std::fmt;
use std::time::{Duration, Instant};

use super::graph;
use super::journal::{ActionKind, Journal};
use super::kube::{is_transient, ClusterTransport};
use super::node::Node;
use super::plan::{self, Action};
use super::track;
use super::{CanonicalObject, Identity, ObjectSet};
use super::{ErrorKind, Result, ResultExt};

/// Deploy lifecycle; `Completed`, `RolledBack` and `RollbackFailed` are
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum DeployState {
    Pending,
    Running,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeployState::Pending => "Pending",
            DeployState::Running => "Running",
            DeployState::Completed => "Completed",
            DeployState::Failed => "Failed",
            DeployState::RollingBack => "RollingBack",
            DeployState::RolledBack => "RolledBack",
            DeployState::RollbackFailed => "RollbackFailed",
        };
        f.write_str(s)
    }
}

/// Tunables for one deploy invocation.
#[derive(Clone, Debug)]
pub struct ApplyOptions {
    /// concurrent workers per level; 0 means one per object
    pub parallelism: usize,
    /// transient-error attempts per object before giving up
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// per-object readiness budget
    pub readiness_timeout: Duration,
    pub poll_interval: Duration,
    /// overall deploy budget; exceeded means abort + rollback
    pub deploy_timeout: Option<Duration>,
    /// create missing target namespaces before level 0
    pub create_namespace: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        ApplyOptions {
            parallelism: 8,
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            readiness_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            deploy_timeout: None,
            create_namespace: false,
        }
    }
}

fn backoff(opts: &ApplyOptions, attempt: u32) -> Duration {
    // exponential, attempt is 1-based
    let factor: u32 = 1u32 << (attempt - 1).min(8);
    opts.backoff_base * factor
}

/// What a finished deploy looks like to the caller.
#[derive(Debug)]
pub struct DeployReport {
    pub state: DeployState,
    /// mutations that were submitted, in completion order
    pub applied: Vec<(Identity, ActionKind)>,
    pub failures: Vec<String>,
    pub rollback_failures: Vec<String>,
}

impl DeployReport {
    pub fn exit_code(&self) -> i32 {
        match self.state {
            DeployState::Completed => 0,
            DeployState::RollbackFailed => 3,
            _ => 2,
        }
    }
}

fn remaining(deadline: Option<Instant>, opts: &ApplyOptions) -> Result<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                let total = opts.deploy_timeout.map(|t| t.as_secs()).unwrap_or(0);
                Err(ErrorKind::DeployTimeout(total).into())
            } else {
                Ok(Some(d - now))
            }
        }
    }
}

async fn get_with_retries<T: ClusterTransport + ?Sized>(
    transport: &T,
    id: &Identity,
    opts: &ApplyOptions,
    attempts: &mut u32,
) -> Result<Option<CanonicalObject>> {
    loop {
        match transport.get(id).await {
            Ok(live) => return Ok(live),
            Err(ref e) if is_transient(e) && *attempts + 1 < opts.max_attempts => {
                *attempts += 1;
                let wait = backoff(opts, *attempts);
                warn!("{}: transient read failure, retrying in {:?}: {}", id, wait, e);
                Delay::new(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn submit_with_retries<T: ClusterTransport + ?Sized>(
    transport: &T,
    id: &Identity,
    action: &Action,
    opts: &ApplyOptions,
    attempts: &mut u32,
) -> Result<()> {
    loop {
        let outcome = match action {
            Action::NoAction => return Ok(()),
            Action::Create(body) => transport.create(id, body).await,
            Action::Patch(patch) => transport.patch(id, patch).await,
            Action::Replace(body) => transport.replace(id, body).await,
        };
        match outcome {
            Ok(()) => return Ok(()),
            Err(ref e) if is_transient(e) && *attempts + 1 < opts.max_attempts => {
                *attempts += 1;
                let wait = backoff(opts, *attempts);
                warn!(
                    "{}: transient {} failure, retrying in {:?}: {}",
                    id, action, wait, e
                );
                Delay::new(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reconcile and apply one object: fresh read, journal, submit, readiness.
async fn apply_object<T: ClusterTransport>(
    obj: &CanonicalObject,
    transport: &T,
    journal: &Journal,
    opts: &ApplyOptions,
    deadline: Option<Instant>,
) -> Result<(Identity, Option<ActionKind>)> {
    let id = obj.identity().clone();
    let mut attempts = 0u32;

    let live = get_with_retries(transport, &id, opts, &mut attempts)
        .await
        .chain_err(|| ErrorKind::ApplyFailed(id.to_string()))?;

    let planned = plan::decide(obj, live.as_ref());
    let kind = match &planned.action {
        Action::NoAction => {
            debug!("{}: already in sync", id);
            return Ok((id, None));
        }
        Action::Create(_) => ActionKind::Create,
        Action::Patch(_) => ActionKind::Patch,
        Action::Replace(_) => ActionKind::Replace,
    };
    info!("{}: {}", id, planned.action);
    journal.append(id.clone(), live, kind);

    submit_with_retries(transport, &id, &planned.action, opts, &mut attempts)
        .await
        .chain_err(|| ErrorKind::ApplyFailed(id.to_string()))?;

    let mut budget = opts.readiness_timeout;
    if let Some(left) = remaining(deadline, opts)? {
        budget = budget.min(left);
    }
    track::await_ready(transport, &id, budget, opts.poll_interval)
        .await
        .chain_err(|| ErrorKind::ApplyFailed(id.to_string()))?;

    Ok((id, Some(kind)))
}

/// Create any target namespace the set expects but the cluster lacks.
async fn ensure_namespaces<T: ClusterTransport>(
    set: &ObjectSet,
    transport: &T,
    opts: &ApplyOptions,
) -> Result<()> {
    for ns in set.namespaces() {
        let id = Identity::new("v1", "Namespace", "", &ns);
        if set.get(&id).is_some() {
            // planned as part of level 0 anyway
            continue;
        }
        if transport.get(&id).await?.is_some() {
            continue;
        }
        info!("creating missing namespace {}", ns);
        let body = Node::map(vec![
            ("apiVersion".into(), Node::from("v1")),
            ("kind".into(), Node::from("Namespace")),
            (
                "metadata".into(),
                Node::map(vec![("name".into(), Node::from(ns.as_str()))]),
            ),
        ]);
        transport.create(&id, &body).await?;
        track::await_ready(transport, &id, opts.readiness_timeout, opts.poll_interval).await?;
    }
    Ok(())
}

/// Execute the layered plan against the cluster.
///
/// Plan-time errors (cycles, duplicates) surface as `Err`; apply-time
/// failures are folded into the returned report after rollback has run.
pub async fn run<T: ClusterTransport>(
    set: &ObjectSet,
    transport: &T,
    opts: &ApplyOptions,
) -> Result<DeployReport> {
    let layered = graph::plan(set, false)?;
    let journal = Journal::new();
    let mut report = DeployReport {
        state: DeployState::Pending,
        applied: Vec::new(),
        failures: Vec::new(),
        rollback_failures: Vec::new(),
    };
    let deadline = opts.deploy_timeout.map(|d| Instant::now() + d);
    report.state = DeployState::Running;
    debug!("deploy state: {}", report.state);

    if opts.create_namespace {
        if let Err(e) = ensure_namespaces(set, transport, opts).await {
            error!("namespace preparation failed: {}", e);
            report.failures.push(e.to_string());
            report.state = DeployState::Failed;
        }
    }

    if report.state == DeployState::Running {
        'levels: for (i, level) in layered.levels.iter().enumerate() {
            if let Err(e) = remaining(deadline, opts) {
                report.failures.push(e.to_string());
                report.state = DeployState::Failed;
                break 'levels;
            }
            info!("level {}: applying {} objects", i, level.len());

            let objects: Vec<&CanonicalObject> =
                level.iter().filter_map(|id| set.get(id)).collect();
            let cap = if opts.parallelism == 0 {
                objects.len().max(1)
            } else {
                opts.parallelism
            };

            let mut queue = objects.into_iter();
            let mut inflight = FuturesUnordered::new();
            let mut failed = false;
            loop {
                while !failed && inflight.len() < cap {
                    match queue.next() {
                        Some(obj) => {
                            inflight.push(apply_object(obj, transport, &journal, opts, deadline))
                        }
                        None => break,
                    }
                }
                match inflight.next().await {
                    Some(Ok((id, Some(kind)))) => {
                        info!("{}: {} complete", id, kind);
                        report.applied.push((id, kind));
                    }
                    Some(Ok((_, None))) => {}
                    Some(Err(e)) => {
                        error!("level {} failure: {}", i, e);
                        for cause in e.iter().skip(1) {
                            debug!("caused by: {}", cause);
                        }
                        report.failures.push(e.to_string());
                        failed = true;
                    }
                    None => break,
                }
            }
            if failed {
                report.state = DeployState::Failed;
                break 'levels;
            }
        }
    }

    if report.state == DeployState::Running {
        report.state = DeployState::Completed;
        info!(
            "deploy complete: {} mutations, {} objects in plan",
            report.applied.len(),
            set.len()
        );
        return Ok(report);
    }

    // abort path
    report.state = DeployState::RollingBack;
    warn!("deploy failed, rolling back {} journaled mutations", journal.entries().len());
    let rollback_failures = journal.replay(transport).await;
    if rollback_failures.is_empty() {
        report.state = DeployState::RolledBack;
        warn!("rollback complete, cluster restored to pre-deploy state");
    } else {
        for (id, e) in &rollback_failures {
            error!("rollback step failed for {}: {}", id, e);
            report
                .rollback_failures
                .push(format!("{}: {}", id, e));
        }
        report.state = DeployState::RollbackFailed;
    }
    Ok(report)
}

/// The `deploy detail` driver: plan, read live state, print per-object
/// actions with their diff classifications.
pub async fn detail<T: ClusterTransport>(
    set: &ObjectSet,
    transport: &T,
    hide_no_action: bool,
) -> Result<()> {
    use super::diff;
    let layered = graph::plan(set, false)?;
    for (i, level) in layered.levels.iter().enumerate() {
        for id in level {
            let obj = match set.get(id) {
                Some(o) => o,
                None => continue,
            };
            let live = transport.get(id).await?;
            let planned = plan::decide(obj, live.as_ref());
            if hide_no_action && !planned.action.is_mutation() {
                continue;
            }
            println!("level {} {} {}", i, planned.action, id);
            if let Some(result) = &planned.diff {
                print!("{}", diff::render_entries(result));
            }
        }
    }
    Ok(())
}
