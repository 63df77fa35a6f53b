// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The operator console: a line REPL (`process`, `list`, `kill`, `stop`) and
//! the declarative manifest loader it dispatches to. See spec §4.6/§9 and
//! AMBIENT-6/AMBIENT-7 in `SPEC_FULL.md`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ConsoleError;
use crate::model::{Experiment, Host, HostSpec, Job};
use crate::state::SchedulerState;

/// The console thread sleeps this long on startup so other threads log
/// their banners first.
pub const START_DELAY: Duration = Duration::from_secs(2);

/// Top-level manifest shape: `process <path>` loads a file with exactly
/// this shape (TOML or JSON, auto-detected by extension).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub experiments: Vec<ExperimentSpec>,
}

/// Plain-data shape of an [`Experiment`], as read from a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub name: String,
    pub outdir: PathBuf,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

/// Plain-data shape of a [`Job`], as read from a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub cwd: PathBuf,
    pub command: String,
    #[serde(default)]
    pub shorthand_command: Option<String>,
    pub outdir: PathBuf,
    pub demand: u32,
    #[serde(default)]
    pub aux_file_io: Vec<(String, PathBuf)>,
    #[serde(default)]
    pub optional_dump: Vec<(String, String, PathBuf)>,
}

/// Errors raised while loading and validating a manifest file, following
/// `FleetManifestError`'s shape (one variant per failure site).
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse JSON manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse TOML manifest: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unsupported manifest extension: {0}")]
    UnsupportedExtension(String),

    #[error("manifest validation failed: {0}")]
    Validation(String),
}

impl Manifest {
    /// Loads a manifest from `path`, auto-detecting TOML vs. JSON by
    /// extension, and validates it. Grounded in
    /// `FleetManifest::load_from_file`'s extension-sniffing dispatch.
    pub fn load_from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        let manifest = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::from_str::<Manifest>(&content)?,
            Some("json") | _ => serde_json::from_str::<Manifest>(&content)?,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        for host in &self.hosts {
            if host.name.trim().is_empty() {
                return Err(ManifestError::Validation("host name cannot be empty".to_string()));
            }
            if host.max_capacity == 0 {
                return Err(ManifestError::Validation(format!(
                    "host '{}' must have a positive max_capacity",
                    host.name
                )));
            }
        }
        for experiment in &self.experiments {
            if experiment.name.trim().is_empty() {
                return Err(ManifestError::Validation("experiment name cannot be empty".to_string()));
            }
            for job in &experiment.jobs {
                if job.demand == 0 {
                    return Err(ManifestError::Validation(format!(
                        "job '{}' in experiment '{}' must have a positive demand",
                        job.id, experiment.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Converts the manifest's plain-data shapes into live [`Host`]/
    /// [`Experiment`] entities, in manifest order. Duplicate-name rejection
    /// is deliberately left to [`SchedulerState`], not here: extraction and
    /// dedupe are kept as separate concerns.
    #[must_use]
    pub fn into_entities(self) -> (Vec<Host>, Vec<Experiment>) {
        let hosts = self.hosts.iter().map(Host::deserialize).collect();
        let experiments = self
            .experiments
            .into_iter()
            .map(|spec| {
                let mut experiment = Experiment::new(spec.name, spec.outdir);
                for job in spec.jobs {
                    let shorthand = job.shorthand_command.unwrap_or_else(|| job.command.clone());
                    experiment.register_job(Job::new(
                        job.id,
                        experiment.name().to_string(),
                        job.cwd,
                        job.command,
                        shorthand,
                        job.outdir,
                        job.demand,
                        job.aux_file_io,
                        job.optional_dump,
                    ));
                }
                experiment
            })
            .collect();
        (hosts, experiments)
    }
}

/// One argv line of the operator console grammar (spec §4.6): `process`,
/// `list`, `kill`, `stop`, each with a single-letter alias where the
/// original supports one.
#[derive(Debug, Parser)]
#[command(name = "", no_binary_name = true, disable_help_flag = false)]
pub struct ConsoleCommand {
    #[command(subcommand)]
    pub command: ConsoleSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum ConsoleSubcommand {
    /// Load a manifest file, collecting its hosts and experiments.
    #[command(alias = "p")]
    Process { script: String },

    /// Print the active and pending-removal lists for a kind of entity.
    #[command(alias = "l")]
    List { kind: EntityKind },

    /// Mark a named entity for removal.
    #[command(alias = "k")]
    Kill { kind: EntityKind, name: String },

    /// Signal graceful shutdown.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EntityKind {
    Experiment,
    Host,
}

/// Parses one REPL line (already shlex-tokenized) into a [`ConsoleCommand`].
/// Empty lines return `Ok(None)`; otherwise any parse failure is reported as
/// a [`ConsoleError::ParseError`] rather than propagated: the REPL never
/// terminates on user input errors.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ConsoleError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let argv = shlex::split(trimmed).ok_or_else(|| ConsoleError::ParseError("unbalanced quotes".to_string()))?;
    ConsoleCommand::try_parse_from(argv)
        .map(Some)
        .map_err(|e| ConsoleError::ParseError(e.to_string()))
}

/// A structured projection of the experiments/hosts lists, for the console's
/// `list` command and any future caller that wants this as data rather than
/// printed text (supplemented feature, see `SPEC_FULL.md`).
#[derive(Debug, Clone, Serialize)]
pub struct ListingView {
    pub active: Vec<String>,
    pub pending_removal: Vec<String>,
}

/// Load a manifest file and add its hosts/experiments to `state`, connecting
/// each host first and skipping (with a logged warning) any that fail to
/// connect, matching `_process`/`_add_hosts`'s exact behavior.
pub fn process_script(
    state: &SchedulerState,
    client: &crate::rpc::HostClient,
    path: &str,
) -> Result<(), ConsoleError> {
    let manifest =
        Manifest::load_from_file(Path::new(path)).map_err(|e| ConsoleError::ScriptError(e.to_string()))?;
    let (mut hosts, experiments) = manifest.into_entities();

    tracing::info!(path, hosts = hosts.len(), experiments = experiments.len(), "processed manifest");

    let mut connected_hosts = Vec::with_capacity(hosts.len());
    for mut host in hosts.drain(..) {
        let outcome = client.connect(&mut host);
        if outcome.ok() {
            connected_hosts.push(host);
        } else {
            tracing::error!(
                host = host.name(),
                error = %outcome.message().unwrap_or_default(),
                "connecting to host failed, skipping"
            );
        }
    }

    state.with_hosts_lock(|hosts_guard| {
        for warning in hosts_guard.add_hosts(connected_hosts) {
            tracing::warn!("{warning}");
        }
    });
    state.with_experiments_lock(|experiments_guard| {
        for warning in experiments_guard.add_experiments(experiments) {
            tracing::warn!("{warning}");
        }
    });

    Ok(())
}

/// `list experiment` / `list host`.
#[must_use]
pub fn list_experiments(state: &SchedulerState) -> ListingView {
    state.with_experiments_lock(|experiments| ListingView {
        active: experiments.active().iter().map(ToString::to_string).collect(),
        pending_removal: experiments.pending_removal().iter().map(ToString::to_string).collect(),
    })
}

#[must_use]
pub fn list_hosts(state: &SchedulerState) -> ListingView {
    state.with_hosts_lock(|hosts| ListingView {
        active: hosts.active().iter().map(ToString::to_string).collect(),
        pending_removal: hosts.pending_removal().iter().map(ToString::to_string).collect(),
    })
}

/// `kill experiment <name>` / `kill host <name>`.
pub fn kill_experiment(state: &SchedulerState, name: &str) {
    state.with_experiments_lock(|experiments| {
        if let Err(e) = experiments.kill_experiment(name) {
            tracing::error!("{e}");
        }
    });
}

pub fn kill_host(state: &SchedulerState, name: &str) {
    state.with_hosts_lock(|hosts| {
        if let Err(e) = hosts.kill_host(name) {
            tracing::error!("{e}");
        }
    });
}

/// Dispatches a parsed [`ConsoleCommand`]. Returns `true` iff `stop` was
/// issued, so the caller can break out of its REPL loop.
pub fn dispatch(state: &SchedulerState, client: &crate::rpc::HostClient, command: ConsoleCommand) -> bool {
    match command.command {
        ConsoleSubcommand::Process { script } => {
            if let Err(e) = process_script(state, client, &script) {
                tracing::error!("{e}");
                println!("error: {e}");
            }
            false
        }
        ConsoleSubcommand::List { kind } => {
            let view = match kind {
                EntityKind::Experiment => list_experiments(state),
                EntityKind::Host => list_hosts(state),
            };
            println!("{view:#?}");
            false
        }
        ConsoleSubcommand::Kill { kind, name } => {
            match kind {
                EntityKind::Experiment => kill_experiment(state, &name),
                EntityKind::Host => kill_host(state, &name),
            }
            false
        }
        ConsoleSubcommand::Stop => {
            state.signal_stop();
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_ignores_blank_input() {
        assert!(parse_line("   ").unwrap().is_none());
    }

    #[test]
    fn parse_line_accepts_stop() {
        let cmd = parse_line("stop").unwrap().expect("should parse");
        assert!(matches!(cmd.command, ConsoleSubcommand::Stop));
    }

    #[test]
    fn parse_line_accepts_process_alias() {
        let cmd = parse_line("p manifest.toml").unwrap().expect("should parse");
        match cmd.command {
            ConsoleSubcommand::Process { script } => assert_eq!(script, "manifest.toml"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parse_line_accepts_kill_host() {
        let cmd = parse_line("kill host h1").unwrap().expect("should parse");
        match cmd.command {
            ConsoleSubcommand::Kill { kind, name } => {
                assert_eq!(kind, EntityKind::Host);
                assert_eq!(name, "h1");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parse_line_rejects_unknown_command() {
        assert!(parse_line("frobnicate").unwrap_err().to_string().len() > 0);
    }

    #[test]
    fn manifest_loads_toml_and_converts_entities() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("manifest.toml");
        std::fs::write(
            &manifest_path,
            r#"
[[hosts]]
name = "h1"
domain = "localhost"
max_capacity = 4
port = 9100
file_server_port = 9101

[[experiments]]
name = "e1"
outdir = "/tmp/e1"

[[experiments.jobs]]
id = "j1"
cwd = "/tmp"
command = "echo hi"
outdir = "/tmp/e1/j1"
demand = 2
"#,
        )
        .unwrap();

        let manifest = Manifest::load_from_file(&manifest_path).unwrap();
        let (hosts, experiments) = manifest.into_entities();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name(), "h1");
        assert_eq!(experiments.len(), 1);
        assert_eq!(experiments[0].jobs().len(), 1);
    }

    #[test]
    fn manifest_validation_rejects_zero_demand_job() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("manifest.json");
        std::fs::write(
            &manifest_path,
            r#"{"hosts":[],"experiments":[{"name":"e1","outdir":"/tmp","jobs":[{"id":"j1","cwd":"/tmp","command":"x","outdir":"/tmp","demand":0}]}]}"#,
        )
        .unwrap();

        let result = Manifest::load_from_file(&manifest_path);
        assert!(matches!(result, Err(ManifestError::Validation(_))));
    }
}
