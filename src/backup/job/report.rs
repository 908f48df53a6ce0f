use crate::backup::job::JobPhase;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use getset::{CopyGetters, Getters};
use std::time::Duration;

/// Why a run failed: the phase it stopped in, every producer that failed, and
/// the first error seen.
#[derive(Debug)]
pub struct JobFailure {
    pub phase: JobPhase,
    pub failed_producers: Vec<String>,
    pub cause: Error,
}

impl JobFailure {
    pub fn new(phase: JobPhase, cause: Error) -> Self {
        Self {
            phase,
            failed_producers: Vec::new(),
            cause,
        }
    }

    pub fn into_error(self) -> Error {
        Error::job_failed(self.phase, self.failed_producers, self.cause)
    }
}

/// Outcome of one job run.
#[derive(Debug, Getters, CopyGetters)]
pub struct JobReport {
    #[getset(get_copy = "pub")]
    phase: JobPhase,
    #[getset(get = "pub")]
    failure: Option<JobFailure>,
    #[getset(get_copy = "pub")]
    artifact_count: usize,
    #[getset(get_copy = "pub")]
    uploaded_bytes: u64,
    #[getset(get_copy = "pub")]
    cleanup_errors: usize,
    #[getset(get_copy = "pub")]
    elapsed: Duration,
}

impl JobReport {
    pub(crate) fn new(
        failure: Option<JobFailure>,
        artifact_count: usize,
        uploaded_bytes: u64,
        cleanup_errors: usize,
        elapsed: Duration,
    ) -> Self {
        let phase = match failure {
            Some(_) => JobPhase::Failed,
            None => JobPhase::Succeeded,
        };
        Self {
            phase,
            failure,
            artifact_count,
            uploaded_bytes,
            cleanup_errors,
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Names of the producers that failed, sorted.
    pub fn failed_producers(&self) -> &[String] {
        self.failure
            .as_ref()
            .map(|f| f.failed_producers.as_slice())
            .unwrap_or_default()
    }

    pub fn log(&self) {
        match &self.failure {
            None => tracing::info!(
                "Backup job succeeded in {:?}: {} artifacts, {} bytes uploaded",
                self.elapsed,
                self.artifact_count,
                self.uploaded_bytes
            ),
            Some(failure) => tracing::error!(
                "Backup job failed during {} after {:?}: {}",
                failure.phase,
                self.elapsed,
                failure.cause
            ),
        }
        if self.cleanup_errors > 0 {
            tracing::warn!("Cleanup reported {} errors", self.cleanup_errors);
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.failure {
            None => Ok(()),
            Some(failure) => Err(failure.into_error()),
        }
    }
}
