//! Supervised subprocess manager.
//!
//! Worker programs (sensor drivers, planners, anything with a shell
//! command) are registered by name, started and stopped, and watched
//! for exit. A restart policy decides what an exit means:
//!
//! - [`RestartPolicy::RunOnce`]: record the exit code and halt.
//! - [`RestartPolicy::RestartOnCrash`]: relaunch after a nonzero exit,
//!   unless the process was deliberately stopped.
//!
//! Stopping is graceful-then-forceful: SIGTERM, a grace period, then
//! SIGKILL. The `killed` mark set by [`Supervisor::stop`] is what keeps
//! a crash-restarting entry down.
//!
//! Attach the supervisor to a mesh [`Member`] and remote peers can
//! drive it over request endpoints (`createProcess`, `start`, `stop`).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use rovermesh_network::Member;

/// Grace period used by [`Supervisor::shutdown`] and the remote `stop`
/// endpoint when the caller does not name one.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);

/// What to do when a managed process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Record the exit and do nothing.
    RunOnce,
    /// Relaunch on nonzero exit, unless the process was stopped.
    RestartOnCrash,
}

impl RestartPolicy {
    pub fn tag(&self) -> &'static str {
        match self {
            RestartPolicy::RunOnce => "RunOnce",
            RestartPolicy::RestartOnCrash => "RestartOnCrash",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "RunOnce" => Some(RestartPolicy::RunOnce),
            "RestartOnCrash" => Some(RestartPolicy::RestartOnCrash),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `create` with a name that is already taken; nothing is mutated.
    #[error("process name already exists: {0}")]
    NameConflict(String),
    #[error("no such process: {0}")]
    UnknownProcess(String),
    #[error("command is empty or unparseable: {0}")]
    BadCommand(String),
    /// The child could not be spawned; the caller may retry.
    #[error("failed to start process: {0}")]
    StartFailed(#[from] std::io::Error),
}

struct ProcessEntry {
    command: String,
    policy: RestartPolicy,
    pid: Option<u32>,
    exit_code: Option<i32>,
    killed: bool,
    /// Flips to true whenever no child is running; `stop` waits on it.
    done: watch::Sender<bool>,
}

/// Snapshot of one managed process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub name: String,
    pub command: String,
    pub policy: String,
    pub running: bool,
    pub pid: Option<u32>,
    /// Exit code of the most recent termination (`None` while running,
    /// or when the child died to a signal).
    pub exit_code: Option<i32>,
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<String, ProcessEntry>>,
}

/// Manages named worker processes.
#[derive(Clone, Default)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process entry. Names are unique.
    pub async fn create(
        &self,
        name: &str,
        command: &str,
        policy: RestartPolicy,
    ) -> Result<(), SupervisorError> {
        let mut entries = self.inner.entries.lock().await;
        if entries.contains_key(name) {
            return Err(SupervisorError::NameConflict(name.to_string()));
        }
        entries.insert(
            name.to_string(),
            ProcessEntry {
                command: command.to_string(),
                policy,
                pid: None,
                exit_code: None,
                killed: false,
                done: watch::channel(true).0,
            },
        );
        Ok(())
    }

    /// Start one entry. Starting a running entry is a no-op; an
    /// explicit start clears the `killed` mark of an earlier stop.
    pub async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        launch(&self.inner, name, true).await
    }

    /// Start every registered entry.
    pub async fn start_all(&self) -> Result<(), SupervisorError> {
        let names: Vec<String> = self.inner.entries.lock().await.keys().cloned().collect();
        for name in names {
            launch(&self.inner, &name, true).await?;
        }
        Ok(())
    }

    /// Stop one entry: SIGTERM, wait up to `grace`, then SIGKILL.
    /// Marks the entry killed so a crash policy will not restart it.
    pub async fn stop(&self, name: &str, grace: Duration) -> Result<(), SupervisorError> {
        let (pid, mut done) = {
            let mut entries = self.inner.entries.lock().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;
            entry.killed = true;
            (entry.pid, entry.done.subscribe())
        };
        let Some(pid) = pid else {
            return Ok(());
        };
        info!("stopping process {name} (pid {pid})");
        signal(pid, libc::SIGTERM);
        if tokio::time::timeout(grace, done.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!("process {name} ignored SIGTERM, sending SIGKILL");
            signal(pid, libc::SIGKILL);
            let _ = done.wait_for(|done| *done).await;
        }
        Ok(())
    }

    /// Stop every entry.
    pub async fn stop_all(&self, grace: Duration) {
        let names: Vec<String> = self.inner.entries.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(err) = self.stop(&name, grace).await {
                warn!("stopping {name} failed: {err}");
            }
        }
    }

    /// Stop everything with the default grace period.
    pub async fn shutdown(&self) {
        self.stop_all(DEFAULT_STOP_GRACE).await;
    }

    pub async fn status(&self, name: &str) -> Option<ProcessStatus> {
        let entries = self.inner.entries.lock().await;
        entries.get(name).map(|entry| status_of(name, entry))
    }

    pub async fn list(&self) -> Vec<ProcessStatus> {
        let entries = self.inner.entries.lock().await;
        entries
            .iter()
            .map(|(name, entry)| status_of(name, entry))
            .collect()
    }

    /// Expose remote control through a mesh member.
    ///
    /// Request endpoints, all replying `"ok"` or `{"error": ...}`:
    /// - `createProcess` with `{name, command, policy}` (policy tag
    ///   optional, default `RunOnce`); creates and starts the entry.
    /// - `start` with zero or more entry names (none means all).
    /// - `stop` with zero or more entry names and an optional `timeout`
    ///   kwarg in seconds.
    pub fn attach(&self, member: &Member) {
        let supervisor = self.clone();
        member.on_request("createProcess", move |args, _kwargs| {
            let supervisor = supervisor.clone();
            async move { remote_create(supervisor, args).await }
        });
        let supervisor = self.clone();
        member.on_request("start", move |args, _kwargs| {
            let supervisor = supervisor.clone();
            async move { remote_start(supervisor, args).await }
        });
        let supervisor = self.clone();
        member.on_request("stop", move |args, kwargs| {
            let supervisor = supervisor.clone();
            async move { remote_stop(supervisor, args, kwargs).await }
        });
    }
}

fn status_of(name: &str, entry: &ProcessEntry) -> ProcessStatus {
    ProcessStatus {
        name: name.to_string(),
        command: entry.command.clone(),
        policy: entry.policy.tag().to_string(),
        running: entry.pid.is_some(),
        pid: entry.pid,
        exit_code: entry.exit_code,
    }
}

fn signal(pid: u32, sig: libc::c_int) {
    // the child may already be gone; nothing useful to do about errors
    let _ = unsafe { libc::kill(pid as libc::pid_t, sig) };
}

/// Spawn the entry's command and attach a waiter task.
///
/// Boxed because the waiter re-enters `launch` when the restart policy
/// fires.
fn launch<'a>(
    inner: &'a Arc<Inner>,
    name: &'a str,
    explicit: bool,
) -> Pin<Box<dyn Future<Output = Result<(), SupervisorError>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = inner.entries.lock().await;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;
        if entry.pid.is_some() {
            return Ok(());
        }
        if explicit {
            entry.killed = false;
        } else if entry.killed {
            // stop() won the race against a pending policy restart
            return Ok(());
        }
        let argv = shlex::split(&entry.command)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| SupervisorError::BadCommand(entry.command.clone()))?;
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        let child = command.spawn()?;
        let pid = child.id();
        entry.pid = pid;
        entry.exit_code = None;
        entry.done.send_replace(false);
        info!("started process {name} (pid {pid:?})");
        drop(entries);
        tokio::spawn(wait_for_exit(inner.clone(), name.to_string(), child));
        Ok(())
    })
}

/// Block on the child's exit, record it, and apply the restart policy.
async fn wait_for_exit(inner: Arc<Inner>, name: String, mut child: Child) {
    let status = child.wait().await;
    let code = match &status {
        Ok(status) => status.code(),
        Err(_) => None,
    };
    let restart = {
        let mut entries = inner.entries.lock().await;
        let Some(entry) = entries.get_mut(&name) else {
            return;
        };
        entry.pid = None;
        entry.exit_code = code;
        entry.done.send_replace(true);
        match entry.policy {
            RestartPolicy::RunOnce => false,
            RestartPolicy::RestartOnCrash => !entry.killed && code != Some(0),
        }
    };
    match status {
        Ok(status) => info!("process {name} exited: {status}"),
        Err(ref err) => warn!("waiting on process {name} failed: {err}"),
    }
    if restart {
        info!("restarting crashed process {name}");
        if let Err(err) = launch(&inner, &name, false).await {
            warn!("restart of {name} failed: {err}");
        }
    }
}

async fn remote_create(supervisor: Supervisor, args: Vec<Value>) -> Value {
    let Some(spec) = args.first().and_then(Value::as_object) else {
        return json!({"error": "createProcess expects {name, command, policy}"});
    };
    let (Some(name), Some(command)) = (
        spec.get("name").and_then(Value::as_str),
        spec.get("command").and_then(Value::as_str),
    ) else {
        return json!({"error": "name and command are required"});
    };
    let policy = match spec.get("policy").and_then(Value::as_str) {
        None => RestartPolicy::RunOnce,
        Some(tag) => match RestartPolicy::from_tag(tag) {
            Some(policy) => policy,
            None => return json!({"error": format!("unknown policy: {tag}")}),
        },
    };
    if let Err(err) = supervisor.create(name, command, policy).await {
        return json!({"error": err.to_string()});
    }
    if let Err(err) = supervisor.start(name).await {
        return json!({"error": err.to_string()});
    }
    json!("ok")
}

async fn remote_start(supervisor: Supervisor, args: Vec<Value>) -> Value {
    let names: Vec<String> = args
        .iter()
        .filter_map(|value| value.as_str().map(str::to_string))
        .collect();
    let result = if names.is_empty() {
        supervisor.start_all().await
    } else {
        let mut result = Ok(());
        for name in &names {
            if let Err(err) = supervisor.start(name).await {
                result = Err(err);
                break;
            }
        }
        result
    };
    match result {
        Ok(()) => json!("ok"),
        Err(err) => json!({"error": err.to_string()}),
    }
}

async fn remote_stop(supervisor: Supervisor, args: Vec<Value>, kwargs: rovermesh_network::Kwargs) -> Value {
    let grace = kwargs
        .get("timeout")
        .and_then(Value::as_f64)
        .map(Duration::from_secs_f64)
        .unwrap_or(DEFAULT_STOP_GRACE);
    let names: Vec<String> = args
        .iter()
        .filter_map(|value| value.as_str().map(str::to_string))
        .collect();
    if names.is_empty() {
        supervisor.stop_all(grace).await;
        return json!("ok");
    }
    for name in &names {
        if let Err(err) = supervisor.stop(name, grace).await {
            return json!({"error": err.to_string()});
        }
    }
    json!("ok")
}
