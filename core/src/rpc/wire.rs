// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Wire types shared by the host RPC client (`rpc::HostClient`) and the
//! worker RPC service (`worker`). Three methods, matching spec §4.4: argument
//! types are primitives and lists of primitive tuples; absolute paths travel
//! as strings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchJobRequest {
    pub cwd: PathBuf,
    pub command: String,
    pub outdir: PathBuf,
    /// `(label, path)` pairs to add to the allow-list alongside stdout/stderr.
    pub aux_paths: Vec<(String, PathBuf)>,
    /// `(label, content, path)` triples to be written verbatim before launch.
    pub optional_dump: Vec<(String, String, PathBuf)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchJobResponse {
    /// The spawned process's pid, or -1 on failure.
    pub pid: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillJobRequest {
    pub pid: i64,
    pub signum: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillJobResponse {
    pub killed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusRequest {
    pub pid: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    /// One of `"RUNNING"` or `"EXITED"`.
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub error: String,
}
