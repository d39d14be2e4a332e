//! Stable exit codes for `review-runner` commands.

use crate::error::RunnerError;

/// Review produced (possibly degraded), or maintenance command succeeded.
pub const OK: i32 = 0;
/// Infrastructure failure: config, workspace, capabilities, missing binary.
pub const INFRA: i32 = 1;
/// The analysis subprocess or its upstream API failed, including retry exhaustion.
pub const SUBPROCESS: i32 = 2;
/// A deadline elapsed outside the retry loop.
pub const TIMEOUT: i32 = 101;
/// A resource budget (e.g. prompt size) was exceeded.
pub const RESOURCE_LIMIT: i32 = 102;

/// Exit code for an error that escaped fallback handling.
pub fn exit_code_for(err: &RunnerError) -> i32 {
    match err {
        RunnerError::MaxRetriesExceeded { .. } | RunnerError::Subprocess { .. } => SUBPROCESS,
        RunnerError::Timeout { .. } => TIMEOUT,
        RunnerError::ResourceLimit(_) => RESOURCE_LIMIT,
        _ => INFRA,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn retry_exhaustion_is_a_subprocess_failure_even_for_timeouts() {
        let err = RunnerError::MaxRetriesExceeded {
            attempts: 4,
            source: Box::new(RunnerError::Timeout {
                after: Some(Duration::from_secs(1)),
            }),
        };
        assert_eq!(exit_code_for(&err), SUBPROCESS);
    }

    #[test]
    fn deadline_and_budget_have_dedicated_codes() {
        assert_eq!(exit_code_for(&RunnerError::Timeout { after: None }), TIMEOUT);
        assert_eq!(
            exit_code_for(&RunnerError::ResourceLimit("prompt".into())),
            RESOURCE_LIMIT
        );
    }

    #[test]
    fn infrastructure_errors_map_to_one() {
        assert_eq!(
            exit_code_for(&RunnerError::BinaryNotFound {
                binary: "claude".into()
            }),
            INFRA
        );
        assert_eq!(exit_code_for(&RunnerError::Config("bad".into())), INFRA);
    }
}
