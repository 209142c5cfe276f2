//! Error taxonomy and the runtime status check.
//!
//! Every call into the accelerator runtime goes through [`cl_check!`], which
//! turns a non-success status into [`BenchError::Accelerator`] tagged with the
//! `file:line` of the call. The first failure aborts the pipeline.

use std::fmt;

use thiserror::Error;

use crate::runtime::status;

pub type Result<T> = std::result::Result<T, BenchError>;

/// Source location of a runtime call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("accelerator error code {code} ({}) encountered at {site}", status::name(*code))]
    Accelerator { code: i32, site: CallSite },

    #[error("kernel program build failed:\n{log}")]
    BuildFailed { log: String },

    #[error("kernel program build did not complete within {timeout_secs}s")]
    BuildTimeout { timeout_secs: u64 },

    #[error("no usable compute device: {reason}")]
    NoDeviceAvailable { reason: String },

    #[error(
        "device result differs from host reference at index {index}: device={device}, host={host} ({mismatches} mismatching element(s))"
    )]
    ResultMismatch {
        index: usize,
        device: f32,
        host: f32,
        mismatches: usize,
    },

    #[error("kernel source is missing or empty: {path}")]
    EmptySource { path: String },

    #[error("no timing samples were recorded")]
    NoSamples,

    #[error("accelerator backend '{backend}' is not available in this build")]
    BackendUnavailable { backend: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Map a runtime result onto [`BenchError::Accelerator`] with the given call site.
pub fn check<T>(result: std::result::Result<T, i32>, site: CallSite) -> Result<T> {
    result.map_err(|code| BenchError::Accelerator { code, site })
}

/// Wrap an accelerator runtime call, recording the call site on failure.
#[macro_export]
macro_rules! cl_check {
    ($call:expr) => {
        $crate::error::check(
            $call,
            $crate::error::CallSite {
                file: file!(),
                line: line!(),
            },
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_passes_value_through() {
        let value = cl_check!(Ok::<_, i32>(42)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_failure_carries_code_and_site() {
        let err = cl_check!(Err::<(), _>(-30)).unwrap_err();
        match &err {
            BenchError::Accelerator { code, site } => {
                assert_eq!(*code, -30);
                assert!(site.file.ends_with("error.rs"));
                assert!(site.line > 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        let msg = err.to_string();
        assert!(msg.contains("-30"));
        assert!(msg.contains("CL_INVALID_VALUE"));
        assert!(msg.contains("error.rs:"));
    }

    #[test]
    fn test_build_failed_message_contains_log() {
        let err = BenchError::BuildFailed {
            log: "aplusb.cl:3: error: expected ';'".to_string(),
        };
        assert!(err.to_string().contains("expected ';'"));
    }
}
