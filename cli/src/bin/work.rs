// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! `work`: the worker process entry point (spec §6). Launches, signals,
//! and reports on local processes over RPC, and serves their output files
//! over an allow-listed HTTP file server.

use std::net::SocketAddr;
use std::process;

use clap::{CommandFactory, Parser};
use scheduler_cli::{exit_codes, CliError};
use scheduler_core::worker::{file_router, rpc_router, WorkerState};

/// Starts the worker process.
#[derive(Parser, Debug)]
#[command(name = "work", author, version, about = "Worker process: launches and supervises local jobs")]
struct Args {
    /// Port the RPC service (launch_job/kill_job/job_status) listens on.
    #[arg(long, default_value_t = 9100)]
    port: u16,

    /// Port the allow-listed file server listens on.
    #[arg(long = "file-server-port", default_value_t = 9101)]
    file_server_port: u16,

    /// Print shell completions for this binary and exit, instead of starting
    /// the worker.
    #[arg(long, value_enum)]
    completions: Option<clap_complete::Shell>,
}

#[tokio::main]
async fn main() {
    let _logging_guard = scheduler_core::logging::init_console();
    let args = Args::parse();

    if let Some(shell) = args.completions {
        let mut cmd = Args::command();
        let bin_name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        return;
    }

    if let Err(err) = run(args).await {
        err.print_error();
        process::exit(exit_codes::STARTUP_FAILURE);
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    let state = WorkerState::new();

    let rpc_addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let file_addr = SocketAddr::from(([0, 0, 0, 0], args.file_server_port));

    let rpc_listener = tokio::net::TcpListener::bind(rpc_addr)
        .await
        .map_err(|e| CliError::port_bind_failed(rpc_addr.to_string(), e))?;
    let file_listener = tokio::net::TcpListener::bind(file_addr)
        .await
        .map_err(|e| CliError::port_bind_failed(file_addr.to_string(), e))?;

    tracing::info!(port = args.port, file_server_port = args.file_server_port, "worker listening");

    let rpc_server = axum::serve(rpc_listener, rpc_router(state.clone()));
    let file_server = axum::serve(file_listener, file_router(state));

    tokio::select! {
        result = rpc_server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "rpc server exited");
            }
        }
        result = file_server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "file server exited");
            }
        }
    }

    Ok(())
}
