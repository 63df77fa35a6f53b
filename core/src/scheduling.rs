// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The scheduling loop: the seven-step tick described in spec §4.2.
//!
//! Runs on its own blocking thread (`std::thread`, not a tokio task) because
//! each tick holds both of [`SchedulerState`]'s reentrant locks across RPC
//! round trips by design (spec §5); an async task would need to hold a
//! `parking_lot` guard across an `.await`, which this sidesteps entirely.

use std::time::Duration;

use crate::model::{Experiment, Host, Job};
use crate::rpc::HostClient;
use crate::state::{DashboardSignal, JobSignal, SchedulerState};

/// Runs the scheduling loop until [`SchedulerState::should_stop`] is set.
/// Blocking: intended to be the body of a dedicated OS thread.
pub fn run(state: &SchedulerState, client: &HostClient, polling_secs: u64, mark_abandoned_jobs_failed: bool) {
    let mut signal_rx = state
        .take_signal_receiver()
        .expect("scheduling loop should be the sole consumer of the signal queue");

    while !state.should_stop() {
        tick(state, client, &mut signal_rx, mark_abandoned_jobs_failed);
        std::thread::sleep(Duration::from_secs(polling_secs));
    }
}

fn tick(
    state: &SchedulerState,
    client: &HostClient,
    signal_rx: &mut tokio::sync::mpsc::UnboundedReceiver<DashboardSignal>,
    mark_abandoned_jobs_failed: bool,
) {
    state.with_both_locks(|experiments, hosts| {
        // Step 1: drain the dashboard signal queue.
        while let Ok(signal) = signal_rx.try_recv() {
            handle_signal(state, client, experiments.active_mut(), hosts.active_mut(), signal);
        }

        // Step 2: poll hosts (active + draining).
        for host in hosts.active_mut().iter_mut().filter(|h| !h.failed()) {
            let (active, draining) = experiments.active_and_pending_removal_mut();
            let _ = client.update(host, active, draining);
        }
        for host in hosts.pending_removal_mut().iter_mut().filter(|h| !h.failed()) {
            let (active, draining) = experiments.active_and_pending_removal_mut();
            let _ = client.update(host, active, draining);
        }

        // Step 3: drain dying experiments.
        for experiment in experiments.pending_removal_mut().iter_mut() {
            let mut safe_to_remove = true;
            for host in hosts.active_mut().iter_mut().filter(|h| !h.failed()) {
                let outcome = client.kill_experiment(host, experiment);
                if !outcome.ok() {
                    tracing::warn!(
                        experiment = experiment.name(),
                        host = host.name(),
                        error = ?outcome.message(),
                        "killing experiment on host failed"
                    );
                    safe_to_remove = false;
                } else {
                    tracing::info!(experiment = experiment.name(), host = host.name(), "killed experiment on host");
                }
            }
            for host in hosts.pending_removal_mut().iter_mut().filter(|h| !h.failed()) {
                let outcome = client.kill_experiment(host, experiment);
                safe_to_remove &= outcome.ok();
            }
            experiment.set_safe_to_remove(safe_to_remove);
        }
        experiments.retain_pending_removal(|e| !e.safe_to_remove());

        // Step 4: retire idle draining hosts.
        hosts.pending_removal_mut().retain_mut(|host| {
            if host.failed() {
                return true;
            }
            if host.idle() {
                let _ = client.disconnect(host);
                false
            } else {
                true
            }
        });

        // Step 5: placement loop.
        place_jobs(client, experiments.active_mut(), hosts.active_mut());

        // Step 6: reap failed hosts.
        reap_failed_hosts(hosts.active_mut(), mark_abandoned_jobs_failed);
        hosts.pending_removal_mut().retain(|h| !h.failed());
    });
}

fn handle_signal(
    state: &SchedulerState,
    client: &HostClient,
    experiments: &mut [Experiment],
    hosts: &mut [Host],
    signal: DashboardSignal,
) {
    let parsed_signal = JobSignal::parse(&signal.signal);

    let experiment_idx = experiments.iter().position(|e| e.name() == signal.experiment);
    let host_idx = hosts.iter().position(|h| h.name() == signal.host);

    let job_pid = experiment_idx.and_then(|idx| {
        experiments[idx]
            .jobs_mut()
            .iter()
            .find(|j| j.id() == signal.job_id)
            .map(Job::pid)
    });

    if experiment_idx.is_none() || host_idx.is_none() || parsed_signal.is_none() || job_pid != Some(signal.pid) {
        let message = format!(
            "Couldn't handle signal for experiment {}, job {}, host {} with pid {} and signal {}.",
            signal.experiment, signal.job_id, signal.host, signal.pid, signal.signal
        );
        tracing::warn!("{message}");
        state.push_message(message);
        return;
    }

    let experiment_idx = experiment_idx.unwrap();
    let host_idx = host_idx.unwrap();
    let job_signal = parsed_signal.unwrap();

    let message = match job_signal {
        JobSignal::Reset => {
            let job = experiments[experiment_idx]
                .jobs_mut()
                .iter_mut()
                .find(|j| j.id() == signal.job_id)
                .expect("resolved above");
            if job.clear() {
                format!("Success clearing {} ({})", job.id(), job.shorthand_command())
            } else {
                format!("Failed to clear job {} ({})", job.id(), job.shorthand_command())
            }
        }
        other => {
            let signum = other.signal_number().expect("non-RESET signals carry a signal number");
            let shorthand = experiments[experiment_idx]
                .jobs_mut()
                .iter()
                .find(|j| j.id() == signal.job_id)
                .map(|j| j.shorthand_command().to_string())
                .unwrap_or_default();
            let outcome = client.kill_job(&mut hosts[host_idx], &mut experiments[experiment_idx], &signal.job_id, signum);
            if outcome.ok() {
                format!(
                    "Success sending signal {signum} to {} ({shorthand}) running on {}",
                    signal.job_id,
                    hosts[host_idx].name()
                )
            } else {
                format!(
                    "Sending signal {signum} to {} ({shorthand}) on {} raised {}",
                    signal.job_id,
                    hosts[host_idx].name(),
                    outcome.message().unwrap_or_default()
                )
            }
        }
    };

    tracing::info!("{message}");
    state.push_message(message);
}

/// Step 5: repeat the candidate-selection/launch pass until a full pass over
/// every host finds no schedulable job, matching `_run_scheduler`'s
/// `while found_work` loop.
///
/// The candidate job is never removed from its experiment, only found by
/// id and launched in place, so a failed launch attempt (transport error or
/// worker-side rejection) leaves the job exactly where the rest of the
/// system expects to find it.
fn place_jobs(client: &HostClient, experiments: &mut [Experiment], hosts: &mut [Host]) {
    loop {
        let mut found_work = false;
        hosts.sort_by(|a, b| b.capacity().cmp(&a.capacity()));

        for host in hosts.iter_mut().filter(|h| !h.failed()) {
            let Some((experiment_idx, job_id)) = best_candidate(experiments, host.capacity()) else {
                continue;
            };
            found_work = true;

            let jobs = experiments[experiment_idx].jobs_mut();
            let job = jobs
                .iter_mut()
                .find(|j| j.id() == job_id)
                .expect("candidate just selected");
            let job_display = job.to_string();

            let outcome = client.launch_job(host, job);
            match outcome {
                crate::model::OpOutcome::Success(()) => {
                    tracing::info!(host = host.name(), job = %job_display, "launched job");
                }
                crate::model::OpOutcome::Failure(ref f) => {
                    tracing::warn!(host = host.name(), job = %job_display, error = %f.message(), "launching job failed");
                }
            }
        }

        if !found_work {
            break;
        }
    }
}

/// Among every experiment's own best-fitting candidate for `capacity`,
/// return the one with the largest demand overall (spec §4.2 step 5).
fn best_candidate(experiments: &[Experiment], capacity: u32) -> Option<(usize, String)> {
    experiments
        .iter()
        .enumerate()
        .filter_map(|(idx, experiment)| experiment.candidate(capacity).map(|job| (idx, job.id().to_string(), job.demand())))
        .max_by_key(|(_, _, demand)| *demand)
        .map(|(idx, id, _)| (idx, id))
}

/// Step 6: drop hosts whose `failed` flag is set. Per spec §7/§9's open
/// question, their abandoned jobs are left at their last observed status
/// unless `mark_abandoned_jobs_failed` is set.
fn reap_failed_hosts(hosts: &mut Vec<Host>, mark_abandoned_jobs_failed: bool) {
    hosts.retain_mut(|host| {
        if !host.failed() {
            return true;
        }
        if mark_abandoned_jobs_failed {
            for placements in host.running_jobs().values() {
                for placement in placements {
                    tracing::warn!(host = host.name(), job = placement.job_id(), "abandoning job on failed host");
                }
            }
        }
        false
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn make_job(id: &str, demand: u32) -> Job {
        Job::new(
            id,
            "e1",
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
    fn best_candidate_picks_largest_demand_across_experiments() {
        let mut e1 = Experiment::new("e1", PathBuf::from("/tmp"));
        e1.register_job(make_job("small", 1));
        let mut e2 = Experiment::new("e2", PathBuf::from("/tmp"));
        e2.register_job(make_job("big", 3));
        let experiments = vec![e1, e2];

        let (idx, id) = best_candidate(&experiments, 4).expect("a candidate should fit");
        assert_eq!(idx, 1);
        assert_eq!(id, "big");
    }

    #[test]
    fn best_candidate_none_when_nothing_fits() {
        let mut e1 = Experiment::new("e1", PathBuf::from("/tmp"));
        e1.register_job(make_job("big", 10));
        let experiments = vec![e1];
        assert!(best_candidate(&experiments, 2).is_none());
    }

    #[test]
    fn reap_failed_hosts_removes_only_failed() {
        let mut hosts = vec![
            Host::new("ok", "localhost", 4, 9100, 9101),
            Host::new("bad", "localhost", 4, 9102, 9103),
        ];
        hosts[1].mark_failed();
        reap_failed_hosts(&mut hosts, false);
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name(), "ok");
    }

    #[test]
    fn place_jobs_retries_candidate_on_transport_failure() {
        let client = HostClient::new();
        let mut e1 = Experiment::new("e1", PathBuf::from("/tmp"));
        e1.register_job(make_job("j1", 2));
        let mut experiments = vec![e1];
        let mut hosts = vec![Host::new("h1", "localhost", 4, 19999, 19998)];

        // No real worker is listening, so launch_job fails over the network.
        // The job is never removed from its experiment up front, so a failed
        // launch leaves it right where it started: still present, still
        // schedulable, ready to retry next tick (possibly on another host).
        place_jobs(&client, &mut experiments, &mut hosts);
        assert_eq!(experiments[0].jobs().len(), 1);
        assert!(experiments[0].jobs()[0].schedulable());
        assert!(hosts[0].failed());
    }
}
