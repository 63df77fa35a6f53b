// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use assert_cmd::Command;
use predicates::prelude::*;
use std::net::TcpListener;
use std::time::Duration;

fn schedule() -> Command {
    Command::cargo_bin("schedule").unwrap()
}

fn work() -> Command {
    Command::cargo_bin("work").unwrap()
}

/// Reserves an OS-assigned port and returns it, keeping the listener alive
/// for the caller so the port stays occupied.
fn reserved_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

// ============================================================================
// `schedule`: help / version
// ============================================================================

#[test]
fn schedule_help() {
    schedule()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Scheduler process"));
}

#[test]
fn schedule_version() {
    schedule()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

// ============================================================================
// `schedule`: fatal startup failure (port already bound)
// ============================================================================

#[test]
fn schedule_exits_nonzero_when_dashboard_port_is_taken() {
    let (_listener, port) = reserved_port();

    schedule()
        .arg("--dashboard-port")
        .arg(port.to_string())
        .timeout(Duration::from_secs(5))
        .assert()
        .failure()
        .code(1);
}

// ============================================================================
// `work`: help / version
// ============================================================================

#[test]
fn work_help() {
    work()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Worker process"));
}

#[test]
fn work_version() {
    work()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

// ============================================================================
// `work`: fatal startup failure (port already bound)
// ============================================================================

#[test]
fn work_exits_nonzero_when_rpc_port_is_taken() {
    let (_listener, port) = reserved_port();

    work()
        .arg("--port")
        .arg(port.to_string())
        .timeout(Duration::from_secs(5))
        .assert()
        .failure()
        .code(1);
}

#[test]
fn work_exits_nonzero_when_file_server_port_is_taken() {
    let (_listener, port) = reserved_port();

    work()
        .arg("--file-server-port")
        .arg(port.to_string())
        .timeout(Duration::from_secs(5))
        .assert()
        .failure()
        .code(1);
}
