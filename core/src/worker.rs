// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The worker process: launches jobs in their own session/process group,
//! answers `job_status` queries, and serves allow-listed files over HTTP.
//! See spec §4.4.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::error::WorkerError;
use crate::rpc::wire::{
    JobStatusRequest, JobStatusResponse, KillJobRequest, KillJobResponse, LaunchJobRequest,
    LaunchJobResponse,
};

struct TrackedProcess {
    child: Mutex<Child>,
    /// Equal to the child's own pid: launched with its own session/group via
    /// `process_group(0)` (spec §9: "process-group kill semantics").
    pgid: i32,
    /// The process's start time as reported by the OS at launch, used to
    /// detect pid/pgid reuse (spec §4.4 `job_status` step 3: "validate
    /// `create_time` still matches"). `None` on platforms where it cannot be
    /// read, in which case the staleness check is skipped.
    create_time: Option<u64>,
}

/// Shared worker state: tracked child processes and the append-only
/// allow-list of paths servable over `/files`.
pub struct WorkerState {
    processes: Mutex<std::collections::HashMap<i64, TrackedProcess>>,
    allow_list: Mutex<HashSet<PathBuf>>,
}

impl WorkerState {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processes: Mutex::new(std::collections::HashMap::new()),
            allow_list: Mutex::new(HashSet::new()),
        })
    }

    fn allow(&self, paths: impl IntoIterator<Item = PathBuf>) {
        let mut allow_list = self.allow_list.lock();
        allow_list.extend(paths);
    }

    fn is_allowed(&self, path: &Path) -> bool {
        self.allow_list.lock().contains(path)
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            processes: Mutex::new(std::collections::HashMap::new()),
            allow_list: Mutex::new(HashSet::new()),
        }
    }
}

/// Builds the worker's RPC router (`launch_job`/`kill_job`/`job_status`),
/// served on `--port`.
#[must_use]
pub fn rpc_router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/rpc/launch_job", post(launch_job))
        .route("/rpc/kill_job", post(kill_job))
        .route("/rpc/job_status", post(job_status))
        .with_state(state)
}

/// Builds the worker's allow-listed file server, served on
/// `--file-server-port` (spec §4.4/§6: the worker's RPC port and file-server
/// port are distinct listeners).
#[must_use]
pub fn file_router(state: Arc<WorkerState>) -> Router {
    Router::new().route("/files", get(serve_file)).with_state(state)
}

/// Convenience combined router (both RPC and `/files` on one listener),
/// used by tests that only care about handler behavior, not port layout.
#[must_use]
pub fn router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/rpc/launch_job", post(launch_job))
        .route("/rpc/kill_job", post(kill_job))
        .route("/rpc/job_status", post(job_status))
        .route("/files", get(serve_file))
        .with_state(state)
}

async fn launch_job(
    State(state): State<Arc<WorkerState>>,
    Json(req): Json<LaunchJobRequest>,
) -> Json<LaunchJobResponse> {
    match do_launch_job(&state, req) {
        Ok(pid) => Json(LaunchJobResponse { pid }),
        Err(err) => {
            tracing::warn!(error = %err, "job launch failed");
            Json(LaunchJobResponse { pid: -1 })
        }
    }
}

fn do_launch_job(state: &WorkerState, req: LaunchJobRequest) -> std::io::Result<i64> {
    std::fs::create_dir_all(&req.outdir)?;
    let stdout_path = req.outdir.join("stdout");
    let stderr_path = req.outdir.join("stderr");
    let stdout = File::create(&stdout_path)?;
    let stderr = File::create(&stderr_path)?;

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&req.command)
        .current_dir(&req.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New session + process group so the shell wrapper and every
        // descendant it spawns can be killed together via killpg.
        command.process_group(0);
    }

    let child = command.spawn()?;
    let pid = i64::from(child.id());
    let create_time = process_start_time(pid);

    for (label, content, path) in &req.optional_dump {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content).map_err(|e| {
            tracing::warn!(%label, path = %path.display(), error = %e, "optional_dump write failed");
            e
        })?;
    }

    let mut newly_allowed: Vec<PathBuf> = vec![stdout_path, stderr_path];
    newly_allowed.extend(req.aux_paths.iter().map(|(_, p)| p.clone()));
    newly_allowed.extend(req.optional_dump.iter().map(|(_, _, p)| p.clone()));
    state.allow(newly_allowed);

    state.processes.lock().insert(
        pid,
        TrackedProcess {
            child: Mutex::new(child),
            pgid: child_pid_as_pgid(pid),
            create_time,
        },
    );

    Ok(pid)
}

fn child_pid_as_pgid(pid: i64) -> i32 {
    // process_group(0) makes the child its own group leader: pgid == pid.
    pid as i32
}

/// Reads a process's start time from `/proc/<pid>/stat`, field 22
/// (`starttime`, in clock ticks since boot). Used to tell a still-alive
/// process from an unrelated one that was assigned the same pid after the
/// original exited. Linux-only; other platforms have no equivalent of this
/// file and the staleness check is skipped there.
#[cfg(target_os = "linux")]
fn process_start_time(pid: i64) -> Option<u64> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // `comm` (field 2) is parenthesized and may itself contain spaces or
    // parens, so split on the last ')' rather than whitespace.
    let after_comm = content.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // `state` is field 3, the first field after `comm`; `starttime` is field
    // 22, so its index here is 22 - 3 = 19.
    fields.get(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn process_start_time(_pid: i64) -> Option<u64> {
    None
}

async fn kill_job(
    State(state): State<Arc<WorkerState>>,
    Json(req): Json<KillJobRequest>,
) -> Json<KillJobResponse> {
    Json(KillJobResponse {
        killed: do_kill_job(&state, req.pid, req.signum),
    })
}

#[cfg(unix)]
fn do_kill_job(state: &WorkerState, pid: i64, signum: i32) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if pid <= 1 {
        return false;
    }

    let pgid = state
        .processes
        .lock()
        .get(&pid)
        .map_or(pid as i32, |p| p.pgid);

    let Ok(signal) = Signal::try_from(signum) else {
        return false;
    };

    killpg(Pid::from_raw(pgid), signal).is_ok()
}

#[cfg(not(unix))]
fn do_kill_job(_state: &WorkerState, pid: i64, _signum: i32) -> bool {
    pid > 1
}

async fn job_status(
    State(state): State<Arc<WorkerState>>,
    Json(req): Json<JobStatusRequest>,
) -> Json<JobStatusResponse> {
    Json(JobStatusResponse {
        status: do_job_status(&state, req.pid).to_string(),
    })
}

enum Status {
    Running,
    Exited,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Exited => "EXITED",
        };
        write!(f, "{s}")
    }
}

fn do_job_status(state: &WorkerState, pid: i64) -> Status {
    let processes = state.processes.lock();
    let Some(tracked) = processes.get(&pid) else {
        // Not recorded locally (e.g. after a worker restart): fall back to
        // a raw OS liveness probe.
        return if raw_pid_alive(pid) {
            Status::Running
        } else {
            Status::Exited
        };
    };

    let mut child = tracked.child.lock();
    match child.try_wait() {
        Ok(None) => Status::Running,
        Ok(Some(_exit_status)) => {
            // The shell wrapper exited, but descendants in its process group
            // may still be running. The group leader's pid equals the
            // original pid, which the OS can reassign to an unrelated
            // process once ours is fully reaped; validate that the pid we
            // see now still has the start time we recorded at launch before
            // trusting its liveness.
            if process_group_alive(tracked.pgid) && start_time_matches(tracked.pgid, tracked.create_time) {
                Status::Running
            } else {
                Status::Exited
            }
        }
        Err(_) => Status::Exited,
    }
}

/// `true` if `recorded` is unknown (nothing to compare against) or matches
/// the current process occupying `pgid`'s start time.
fn start_time_matches(pgid: i32, recorded: Option<u64>) -> bool {
    match recorded {
        None => true,
        Some(recorded) => process_start_time(i64::from(pgid)) == Some(recorded),
    }
}

#[cfg(unix)]
fn raw_pid_alive(pid: i64) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn raw_pid_alive(_pid: i64) -> bool {
    false
}

#[cfg(unix)]
fn process_group_alive(pgid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // Signalling the negated pgid with no signal (0) checks existence of
    // any process in the group without actually signalling it.
    kill(Pid::from_raw(-pgid), None).is_ok()
}

#[cfg(not(unix))]
fn process_group_alive(_pgid: i32) -> bool {
    false
}

#[derive(Debug, Deserialize)]
struct FilesQuery {
    path: Option<String>,
}

async fn serve_file(
    State(state): State<Arc<WorkerState>>,
    Query(query): Query<FilesQuery>,
) -> Result<Response, WorkerError> {
    let raw_path = query
        .path
        .ok_or_else(|| WorkerError::BadRequest("missing 'path' query parameter".to_string()))?;
    let path = PathBuf::from(&raw_path);

    if !path.is_absolute() {
        return Err(WorkerError::BadRequest("'path' must be absolute".to_string()));
    }
    if !state.is_allowed(&path) {
        return Err(WorkerError::Forbidden(format!("'{raw_path}' is not in the allow-list")));
    }
    if !path.exists() {
        return Err(WorkerError::NotFound(format!("'{raw_path}' does not exist")));
    }

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| WorkerError::Internal(e.to_string()))?;
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_job_rejects_pid_at_or_below_one() {
        let state = WorkerState::default();
        assert!(!do_kill_job(&state, 1, 15));
        assert!(!do_kill_job(&state, 0, 15));
        assert!(!do_kill_job(&state, -5, 15));
    }

    #[test]
    fn job_status_of_unknown_pid_falls_back_to_raw_probe() {
        let state = WorkerState::default();
        // pid 1 (init) is virtually always alive in a real OS; this merely
        // exercises the fallback path rather than asserting its result.
        let _ = do_job_status(&state, 1);
    }

    #[test]
    fn start_time_matches_is_trivially_true_when_nothing_was_recorded() {
        assert!(start_time_matches(1, None));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_start_time_is_stable_for_the_current_process() {
        let pid = std::process::id() as i64;
        let first = process_start_time(pid);
        assert!(first.is_some());
        assert_eq!(first, process_start_time(pid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn start_time_matches_detects_mismatch() {
        let pid = std::process::id();
        let real = process_start_time(pid as i64);
        assert!(start_time_matches(pid as i32, real));
        assert!(!start_time_matches(pid as i32, real.map(|t| t + 1)));
    }

    #[tokio::test]
    async fn serve_file_rejects_relative_paths() {
        let state = WorkerState::new();
        let result = serve_file(
            State(state),
            Query(FilesQuery {
                path: Some("relative/path".to_string()),
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn serve_file_rejects_paths_outside_allow_list() {
        let state = WorkerState::new();
        let result = serve_file(
            State(state),
            Query(FilesQuery {
                path: Some("/etc/passwd".to_string()),
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn serve_file_streams_allow_listed_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("stdout");
        std::fs::write(&file_path, b"hello").unwrap();

        let state = WorkerState::new();
        state.allow(vec![file_path.clone()]);

        let result = serve_file(
            State(state),
            Query(FilesQuery {
                path: Some(file_path.to_string_lossy().to_string()),
            }),
        )
        .await;
        assert!(result.is_ok());
    }
}
