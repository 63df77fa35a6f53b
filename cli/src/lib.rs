// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Shared CLI plumbing for the `schedule` and `work` binaries.

pub mod error;

pub use error::{exit_codes, CliError};

/// Resolve the default scheduler name: the local hostname, matching spec §6
/// (`--name <str=hostname>`).
pub fn default_scheduler_name() -> Result<String, CliError> {
    gethostname::gethostname()
        .into_string()
        .map_err(|_| CliError::HostnameUnavailable {
            reason: "hostname is not valid UTF-8".to_string(),
        })
}
