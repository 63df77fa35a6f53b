// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Job / Experiment / Host data model and the `Result` tagged variant used
//! at every RPC boundary.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Not yet launched.
    None,
    /// Launched, worker has not yet confirmed a running process.
    Pending,
    /// Confirmed running on a worker.
    Running,
    /// Process exited on its own.
    Exited,
    /// Process was signalled and killed by the scheduler.
    Killed,
    /// Launch failed on the worker side (worker returned pid = -1).
    Failed,
}

impl JobStatus {
    /// A job is schedulable only in its initial state.
    #[must_use]
    pub fn schedulable(self) -> bool {
        matches!(self, Self::None)
    }

    /// A job counts as "running" (occupying host capacity) in these states.
    #[must_use]
    pub fn running(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// A job has reached a terminal state and will never transition again.
    #[must_use]
    pub fn terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Killed | Self::Failed)
    }

    /// Dashboard swatch color for this status.
    #[must_use]
    pub fn color(self) -> &'static str {
        match self {
            Self::None => "#FAFAFA",
            Self::Pending => "#F59E0B",
            Self::Running => "#10B981",
            Self::Exited => "#6B7280",
            Self::Killed => "#090A0D",
            Self::Failed => "#EF4444",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Exited => "EXITED",
            Self::Killed => "KILLED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// A single command to execute on one host, with an integer demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    id: String,
    experiment_name: String,
    cwd: PathBuf,
    command: String,
    shorthand_command: String,
    outdir: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
    aux_file_io: Vec<(String, PathBuf)>,
    optional_dump: Vec<(String, String, PathBuf)>,
    demand: u32,
    pid: i64,
    host_name: String,
    links: Vec<(String, String)>,
    status: JobStatus,
}

impl Job {
    /// Construct a new, unlaunched job. `id` is expected to already be a
    /// stable content-addressed identifier (e.g. a hash of the defining
    /// parameters); this type does not compute it.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        experiment_name: impl Into<String>,
        cwd: PathBuf,
        command: impl Into<String>,
        shorthand_command: impl Into<String>,
        outdir: PathBuf,
        demand: u32,
        aux_file_io: Vec<(String, PathBuf)>,
        optional_dump: Vec<(String, String, PathBuf)>,
    ) -> Self {
        let stdout = outdir.join("stdout");
        let stderr = outdir.join("stderr");
        Self {
            id: id.into(),
            experiment_name: experiment_name.into(),
            cwd,
            command: command.into(),
            shorthand_command: shorthand_command.into(),
            outdir,
            stdout,
            stderr,
            aux_file_io,
            optional_dump,
            demand,
            pid: -1,
            host_name: "TBD".to_string(),
            links: Vec::new(),
            status: JobStatus::None,
        }
    }

    /// Stable string identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Back-reference to the owning experiment, by name.
    #[must_use]
    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    #[must_use]
    pub fn cwd(&self) -> &PathBuf {
        &self.cwd
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn shorthand_command(&self) -> &str {
        &self.shorthand_command
    }

    #[must_use]
    pub fn outdir(&self) -> &PathBuf {
        &self.outdir
    }

    #[must_use]
    pub fn demand(&self) -> u32 {
        self.demand
    }

    #[must_use]
    pub fn pid(&self) -> i64 {
        self.pid
    }

    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status
    }

    #[must_use]
    pub fn aux_file_io(&self) -> &[(String, PathBuf)] {
        &self.aux_file_io
    }

    #[must_use]
    pub fn optional_dump(&self) -> &[(String, String, PathBuf)] {
        &self.optional_dump
    }

    /// `[("stdout", ...), ("stderr", ...)] ++ aux_file_io`, in that order.
    #[must_use]
    pub fn file_io(&self) -> Vec<(String, PathBuf)> {
        let mut out = vec![
            ("stdout".to_string(), self.stdout.clone()),
            ("stderr".to_string(), self.stderr.clone()),
        ];
        out.extend(self.aux_file_io.iter().cloned());
        out
    }

    #[must_use]
    pub fn links(&self) -> &[(String, String)] {
        &self.links
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
    }

    pub fn set_pid(&mut self, pid: i64) {
        self.pid = pid;
    }

    pub fn set_host_name(&mut self, host_name: impl Into<String>) {
        self.host_name = host_name.into();
    }

    pub fn set_links(&mut self, links: Vec<(String, String)>) {
        self.links = links;
    }

    /// `true` iff `status == NONE`.
    #[must_use]
    pub fn schedulable(&self) -> bool {
        self.status.schedulable()
    }

    /// `true` iff `status ∈ {PENDING, RUNNING}`.
    #[must_use]
    pub fn running(&self) -> bool {
        self.status.running()
    }

    /// Reset a non-running job back to its pre-launch state. Returns `false`
    /// without mutating anything if the job is currently running.
    pub fn clear(&mut self) -> bool {
        if self.running() {
            return false;
        }
        self.pid = -1;
        self.host_name = "TBD".to_string();
        self.links.clear();
        self.status = JobStatus::None;
        true
    }

    /// Dashboard-facing projection of this job.
    #[must_use]
    pub fn view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            pid: self.pid,
            experiment: self.experiment_name.clone(),
            command: self.shorthand_command.clone(),
            links: self
                .links
                .iter()
                .map(|(label, href)| JobLink {
                    label: label.clone(),
                    href: href.clone(),
                })
                .collect(),
            host: self.host_name.clone(),
            status: self.status.to_string(),
            status_color: self.status.color().to_string(),
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Job(id={}, command={}, status={}, pid={})",
            self.id, self.shorthand_command, self.status, self.pid
        )
    }
}

/// Dashboard projection of a single [`Job`] (`/api/state` response shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,
    pub pid: i64,
    pub experiment: String,
    pub command: String,
    pub links: Vec<JobLink>,
    pub host: String,
    pub status: String,
    pub status_color: String,
}

/// One entry of [`JobView::links`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLink {
    pub label: String,
    pub href: String,
}

/// A named collection of jobs submitted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    name: String,
    outdir: PathBuf,
    jobs: Vec<Job>,
    safe_to_remove: bool,
}

impl Experiment {
    #[must_use]
    pub fn new(name: impl Into<String>, outdir: PathBuf) -> Self {
        Self {
            name: name.into(),
            outdir,
            jobs: Vec::new(),
            safe_to_remove: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn outdir(&self) -> &PathBuf {
        &self.outdir
    }

    pub fn register_job(&mut self, job: Job) {
        self.jobs.push(job);
    }

    /// Jobs sorted by descending demand. Re-sorts on every access.
    #[must_use]
    pub fn jobs(&self) -> Vec<&Job> {
        let mut refs: Vec<&Job> = self.jobs.iter().collect();
        refs.sort_by(|a, b| b.demand.cmp(&a.demand));
        refs
    }

    #[must_use]
    pub fn jobs_mut(&mut self) -> &mut Vec<Job> {
        &mut self.jobs
    }

    #[must_use]
    pub fn safe_to_remove(&self) -> bool {
        self.safe_to_remove
    }

    pub fn set_safe_to_remove(&mut self, value: bool) {
        self.safe_to_remove = value;
    }

    /// Best-fitting schedulable job with `demand <= capacity`: the eligible
    /// job with the largest demand (best-fit among this experiment's own
    /// jobs; ties broken arbitrarily since they are equally good fits).
    #[must_use]
    pub fn candidate(&self, capacity: u32) -> Option<&Job> {
        self.jobs
            .iter()
            .filter(|j| j.schedulable() && j.demand() <= capacity)
            .max_by_key(|j| j.demand())
    }
}

impl fmt::Display for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Experiment(name={}, outdir={})", self.name, self.outdir.display())
    }
}

/// A lightweight placement record: which job (by id) a [`Host`] believes it
/// is running, and how much capacity it occupies. The [`Job`] entity itself
/// always lives in its owning [`Experiment`]; a host never owns one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPlacement {
    job_id: String,
    demand: u32,
}

impl JobPlacement {
    #[must_use]
    pub fn new(job_id: impl Into<String>, demand: u32) -> Self {
        Self {
            job_id: job_id.into(),
            demand,
        }
    }

    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn demand(&self) -> u32 {
        self.demand
    }
}

/// A remote worker advertising a `max_capacity` and reachable via RPC + HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    name: String,
    domain: String,
    port: u16,
    file_server_port: u16,
    file_domain: String,
    max_capacity: u32,
    running_jobs: HashMap<String, Vec<JobPlacement>>,
    finished_jobs: HashMap<String, Vec<JobPlacement>>,
    #[serde(skip)]
    connected: bool,
    failed: bool,
}

impl Host {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        domain: impl Into<String>,
        max_capacity: u32,
        port: u16,
        file_server_port: u16,
    ) -> Self {
        let domain = domain.into();
        let file_domain = format!("{domain}:{file_server_port}");
        Self {
            name: name.into(),
            domain,
            port,
            file_server_port,
            file_domain,
            max_capacity,
            running_jobs: HashMap::new(),
            finished_jobs: HashMap::new(),
            connected: false,
            failed: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn file_domain(&self) -> &str {
        &self.file_domain
    }

    #[must_use]
    pub fn max_capacity(&self) -> u32 {
        self.max_capacity
    }

    /// Raise this host's capacity ceiling at runtime.
    pub fn upgrade(&mut self, additional_capacity: u32) {
        self.max_capacity += additional_capacity;
    }

    /// `max_capacity - Σ demand(running_jobs)`.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        let used: u32 = self
            .running_jobs
            .values()
            .flat_map(|placements| placements.iter())
            .map(JobPlacement::demand)
            .sum();
        self.max_capacity.saturating_sub(used)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Sticky failure flag: once set, no further network I/O is attempted.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// No running jobs on any experiment.
    #[must_use]
    pub fn idle(&self) -> bool {
        self.running_jobs.values().all(Vec::is_empty)
    }

    pub(crate) fn running_jobs_mut(&mut self, experiment: &str) -> &mut Vec<JobPlacement> {
        self.running_jobs.entry(experiment.to_string()).or_default()
    }

    pub(crate) fn finished_jobs_mut(&mut self, experiment: &str) -> &mut Vec<JobPlacement> {
        self.finished_jobs.entry(experiment.to_string()).or_default()
    }

    #[must_use]
    pub fn running_jobs(&self) -> &HashMap<String, Vec<JobPlacement>> {
        &self.running_jobs
    }

    #[must_use]
    pub fn finished_jobs(&self) -> &HashMap<String, Vec<JobPlacement>> {
        &self.finished_jobs
    }

    /// Plain-data serialization used by the operator script loader.
    #[must_use]
    pub fn serialize(&self) -> HostSpec {
        HostSpec {
            name: self.name.clone(),
            domain: self.domain.clone(),
            max_capacity: self.max_capacity,
            port: self.port,
            file_server_port: self.file_server_port,
        }
    }

    #[must_use]
    pub fn deserialize(spec: &HostSpec) -> Self {
        Self::new(
            spec.name.clone(),
            spec.domain.clone(),
            spec.max_capacity,
            spec.port,
            spec.file_server_port,
        )
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Host(name={}, capacity={})", self.name, self.capacity())
    }
}

/// Plain-data shape of a [`Host`], as read from (and written to) a script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,
    pub domain: String,
    pub max_capacity: u32,
    pub port: u16,
    pub file_server_port: u16,
}

/// The site name and captured detail of a failed RPC-bearing operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    site: String,
    cause: String,
    traceback: String,
}

impl Failure {
    #[must_use]
    pub fn new(site: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        let cause = cause.to_string();
        Self {
            site: site.into(),
            traceback: cause.clone(),
            cause,
        }
    }

    #[must_use]
    pub fn message(&self) -> String {
        format!("{} raised at {}", self.cause, self.site)
    }

    #[must_use]
    pub fn traceback(&self) -> &str {
        &self.traceback
    }
}

/// Tagged `Success(value) | Failure(site, cause, traceback)` variant used at
/// every RPC-bearing call site instead of propagating exceptions across
/// thread boundaries. See spec §3/§9.
#[derive(Debug, Clone)]
pub enum OpOutcome<T> {
    Success(T),
    Failure(Failure),
}

impl<T> OpOutcome<T> {
    #[must_use]
    pub fn ok(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Human-readable failure message; only meaningful when `!ok()`.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Success(_) => None,
            Self::Failure(f) => Some(f.message()),
        }
    }

    #[must_use]
    pub fn value(self) -> Option<T> {
        match self {
            Self::Success(v) => Some(v),
            Self::Failure(_) => None,
        }
    }
}

/// `Result` here is the tagged `Success`/`Failure` variant, not
/// `std::result::Result`.
pub type Result<T> = OpOutcome<T>;

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job(id: &str, demand: u32) -> Job {
        Job::new(
            id,
            "exp",
            PathBuf::from("/tmp"),
            "echo hi",
            "echo hi",
            PathBuf::from("/tmp/out"),
            demand,
            vec![],
            vec![],
        )
    }

    #[test]
    fn job_starts_schedulable_with_sentinel_fields() {
        let job = make_job("j1", 3);
        assert!(job.schedulable());
        assert_eq!(job.pid(), -1);
        assert_eq!(job.host_name(), "TBD");
        assert_eq!(job.status(), JobStatus::None);
    }

    #[test]
    fn clear_rejects_running_job() {
        let mut job = make_job("j1", 3);
        job.set_status(JobStatus::Running);
        job.set_pid(42);
        assert!(!job.clear());
        assert_eq!(job.pid(), 42);
    }

    #[test]
    fn clear_resets_non_running_job() {
        let mut job = make_job("j1", 3);
        job.set_status(JobStatus::Exited);
        job.set_pid(42);
        job.set_host_name("h1");
        assert!(job.clear());
        assert_eq!(job.pid(), -1);
        assert_eq!(job.host_name(), "TBD");
        assert_eq!(job.status(), JobStatus::None);
    }

    #[test]
    fn experiment_candidate_picks_largest_eligible_demand() {
        let mut exp = Experiment::new("e1", PathBuf::from("/tmp"));
        exp.register_job(make_job("small", 2));
        exp.register_job(make_job("big", 4));
        exp.register_job(make_job("toobig", 10));

        let candidate = exp.candidate(5).expect("a candidate should fit");
        assert_eq!(candidate.id(), "big");
    }

    #[test]
    fn experiment_candidate_skips_non_schedulable_jobs() {
        let mut exp = Experiment::new("e1", PathBuf::from("/tmp"));
        let mut running = make_job("running", 4);
        running.set_status(JobStatus::Running);
        exp.register_job(running);
        exp.register_job(make_job("idle", 2));

        let candidate = exp.candidate(5).expect("a candidate should fit");
        assert_eq!(candidate.id(), "idle");
    }

    #[test]
    fn host_capacity_invariant_holds_after_placement() {
        let mut host = Host::new("h1", "localhost", 4, 9100, 9101);
        host.running_jobs_mut("e1").push(JobPlacement::new("j1", 3));
        assert_eq!(host.capacity(), 1);
    }

    #[test]
    fn host_idle_iff_no_running_jobs() {
        let mut host = Host::new("h1", "localhost", 4, 9100, 9101);
        assert!(host.idle());
        host.running_jobs_mut("e1").push(JobPlacement::new("j1", 1));
        assert!(!host.idle());
    }

    #[test]
    fn op_outcome_failure_message_includes_site() {
        let outcome: OpOutcome<()> = OpOutcome::Failure(Failure::new("h1::launch_job", "boom"));
        assert!(!outcome.ok());
        assert_eq!(outcome.message().unwrap(), "boom raised at h1::launch_job");
    }
}
