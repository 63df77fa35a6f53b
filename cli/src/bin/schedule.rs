// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! `schedule`: the scheduler process entry point (spec §6). The three
//! cooperating threads (operator console, scheduling loop, dashboard HTTP
//! server) sharing one [`SchedulerState`].

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use scheduler_cli::{default_scheduler_name, exit_codes, CliError};
use scheduler_core::config::ConfigLoader;
use scheduler_core::console::{self, START_DELAY};
use scheduler_core::dashboard::{self, DashboardState};
use scheduler_core::rpc::HostClient;
use scheduler_core::{scheduling, SchedulerState};

/// Starts the scheduler process.
#[derive(Parser, Debug)]
#[command(name = "schedule", author, version, about = "Scheduler process: placement, reconciliation, dashboard")]
struct Args {
    /// Scheduler instance name; defaults to the local hostname. Used in log
    /// file names (`<name>.dashboard.log`, `<name>.scheduler.log`) and the
    /// dashboard title.
    #[arg(long)]
    name: Option<String>,

    /// Port the dashboard HTTP server listens on. Defaults to 9200 via
    /// config/env if not given explicitly.
    #[arg(long = "dashboard-port")]
    dashboard_port: Option<u16>,

    /// Scheduling loop tick interval, in seconds. Defaults to 1 via
    /// config/env if not given explicitly.
    #[arg(long = "polling-secs")]
    polling_secs: Option<u64>,

    /// Print shell completions for this binary and exit, instead of starting
    /// the scheduler.
    #[arg(long, value_enum)]
    completions: Option<clap_complete::Shell>,
}

fn main() {
    let args = Args::parse();

    if let Some(shell) = args.completions {
        let mut cmd = Args::command();
        let bin_name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        return;
    }

    if let Err(err) = run(args) {
        err.print_error();
        process::exit(exit_codes::STARTUP_FAILURE);
    }
}

fn run(args: Args) -> Result<(), CliError> {
    let config = ConfigLoader::new()
        .load()
        .map_err(|e| CliError::configuration_error(e.to_string(), "check your config.toml / SCHEDULER__* env vars"))?;

    let name = args
        .name
        .or_else(|| config.scheduler.name.clone())
        .map_or_else(default_scheduler_name, Ok)?;
    let dashboard_port = args.dashboard_port.unwrap_or(config.scheduler.dashboard_port);
    let polling_secs = args.polling_secs.unwrap_or(config.scheduler.polling_secs);

    let _logging_guard = scheduler_core::logging::init_scheduler(&name, &config.logging.log_dir)
        .map_err(|e| CliError::configuration_error(e.to_string(), "check --name and the log directory are writable"))?;

    let title = format!("Scheduler Dashboard {name}:{dashboard_port}");
    tracing::info!(%title, "starting scheduler");

    let state = Arc::new(SchedulerState::new());

    let dashboard_addr = SocketAddr::from(([127, 0, 0, 1], dashboard_port));
    let tokio_rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::configuration_error(e.to_string(), "check system resource limits"))?;
    let listener = tokio_rt
        .block_on(tokio::net::TcpListener::bind(dashboard_addr))
        .map_err(|e| CliError::port_bind_failed(dashboard_addr.to_string(), e))?;

    let scheduler_thread = {
        let state = Arc::clone(&state);
        std::thread::Builder::new()
            .name(format!("{name}.scheduler"))
            .spawn(move || {
                let client = HostClient::new();
                scheduling::run(&state, &client, polling_secs, config.scheduler.mark_abandoned_jobs_failed);
            })
            .expect("failed to spawn scheduling loop thread")
    };

    let console_thread = {
        let state = Arc::clone(&state);
        std::thread::Builder::new()
            .name(format!("{name}.console"))
            .spawn(move || run_console(&state))
            .expect("failed to spawn console thread")
    };

    let dashboard_state = Arc::new(DashboardState {
        scheduler: Arc::clone(&state),
        title,
    });
    tokio_rt.block_on(async move {
        let app = dashboard::router(dashboard_state);
        let shutdown_state = Arc::clone(&state);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown_state.should_stop() {
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
            })
            .await
    }).map_err(|e| CliError::configuration_error(e.to_string(), "dashboard server exited unexpectedly"))?;

    state.signal_stop();
    let _ = scheduler_thread.join();
    let _ = console_thread.join();

    Ok(())
}

/// Runs the operator console REPL on the calling (dedicated) thread.
/// Blocking: reads lines from stdin via `rustyline` until `stop` is issued
/// or stdin is closed.
fn run_console(state: &SchedulerState) {
    std::thread::sleep(START_DELAY);

    let client = HostClient::new();
    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            tracing::error!(error = %e, "failed to start console editor");
            return;
        }
    };

    while !state.should_stop() {
        match editor.readline("> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                match console::parse_line(&line) {
                    Ok(Some(command)) => {
                        if console::dispatch(state, &client, command) {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{e}"),
                }
            }
            Err(rustyline::error::ReadlineError::Eof | rustyline::error::ReadlineError::Interrupted) => {
                state.signal_stop();
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "console readline error");
                break;
            }
        }
    }
}
