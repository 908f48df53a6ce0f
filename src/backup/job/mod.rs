//! One backup run, from producing artifacts to removing its workspace.
//!
//! A [`Job`] moves through [`JobPhase`]s in a fixed order and is consumed by
//! [`Job::run`], so a phase is never entered twice. Producers run
//! concurrently and are all awaited even when one fails; every later phase
//! is skipped after the first failure, while cleanup always runs.

pub mod report;
pub mod workspace;

use crate::backup::cancel::CancellationToken;
use crate::backup::codec::{Archive, Codec};
use crate::backup::job::report::{JobFailure, JobReport};
use crate::backup::job::workspace::Workspace;
use crate::backup::producer::{Artifact, ProduceContext, Producer};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::AddMsg;
use crate::backup::upload::uploader::StreamingUploader;
use bon::Builder;
use chrono::{DateTime, Utc};
use crossbeam::channel;
use derive_more::Display;
use itertools::Itertools;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum JobPhase {
    #[display("workspace setup")]
    Idle,
    #[display("producing artifacts")]
    ProducingArtifacts,
    #[display("compressing")]
    Compressing,
    #[display("uploading")]
    Uploading,
    #[display("cleaning up")]
    CleaningUp,
    #[display("succeeded")]
    Succeeded,
    #[display("failed")]
    Failed,
}

/// Everything a run leaves behind that cleanup must remove.
#[derive(Debug)]
struct RunState {
    phase: JobPhase,
    artifacts: Vec<Artifact>,
    archive: Option<Archive>,
    uploaded_bytes: u64,
}

impl RunState {
    fn enter(&mut self, phase: JobPhase) {
        tracing::info!("Backup job: {} -> {}", self.phase, phase);
        self.phase = phase;
    }
}

#[derive(Debug, Builder)]
pub struct Job {
    producers: Vec<Arc<dyn Producer>>,
    /// No codec means every artifact is uploaded on its own.
    codec: Option<Arc<dyn Codec>>,
    uploader: StreamingUploader,
    #[builder(into)]
    workspace_root: PathBuf,
    #[builder(default)]
    cancel: CancellationToken,
    #[builder(default = Utc::now())]
    run_time: DateTime<Utc>,
}

impl Job {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn run(self) -> JobReport {
        let started = Instant::now();
        tracing::info!(
            "Starting backup job with {} producers at {}",
            self.producers.len(),
            self.run_time
        );

        let workspace = match Workspace::create(&self.workspace_root) {
            Ok(workspace) => workspace,
            Err(e) => {
                let report = JobReport::new(
                    Some(JobFailure::new(JobPhase::Idle, e)),
                    0,
                    0,
                    0,
                    started.elapsed(),
                );
                report.log();
                return report;
            }
        };

        let mut state = RunState {
            phase: JobPhase::Idle,
            artifacts: Vec::new(),
            archive: None,
            uploaded_bytes: 0,
        };
        let outcome = self.run_phases(workspace.path(), &mut state);
        if let Err(failure) = &outcome {
            tracing::error!("Backup job failed during {}: {}", failure.phase, failure.cause);
        }

        state.enter(JobPhase::CleaningUp);
        let cleanup_errors = Self::clean_up(workspace, &state);
        let report = JobReport::new(
            outcome.err(),
            state.artifacts.len(),
            state.uploaded_bytes,
            cleanup_errors,
            started.elapsed(),
        );
        state.enter(report.phase());
        report.log();
        report
    }

    fn run_phases(&self, workspace: &Path, state: &mut RunState) -> Result<(), JobFailure> {
        state.enter(JobPhase::ProducingArtifacts);
        let (artifacts, failures) = self.produce_artifacts(workspace);
        state.artifacts = artifacts;
        state
            .artifacts
            .sort_by(|a, b| a.source_name().cmp(b.source_name()));
        if !failures.is_empty() {
            let failed_producers = failures
                .iter()
                .map(|(name, _)| name.clone())
                .sorted()
                .collect_vec();
            let (name, cause) = failures
                .into_iter()
                .next()
                .ok_or_else(|| JobFailure::new(JobPhase::ProducingArtifacts, Error::cancelled()))?;
            return Err(JobFailure {
                phase: JobPhase::ProducingArtifacts,
                failed_producers,
                cause: Error::producer(name, cause),
            });
        }
        self.cancel
            .check()
            .map_err(|e| JobFailure::new(JobPhase::ProducingArtifacts, e))?;

        match &self.codec {
            Some(codec) => {
                state.enter(JobPhase::Compressing);
                let archive = codec
                    .compress(&self.cancel, &state.artifacts, workspace)
                    .map_err(|e| JobFailure::new(JobPhase::Compressing, Error::codec(e)))?;
                let size = archive.size();
                let path = archive.path().clone();
                state.archive = Some(archive);

                state.enter(JobPhase::Uploading);
                self.uploader
                    .upload_file(&self.cancel, &path)
                    .map_err(|e| JobFailure::new(JobPhase::Uploading, e))?;
                state.uploaded_bytes = size;
            }
            None => {
                state.enter(JobPhase::Uploading);
                for artifact in &state.artifacts {
                    let uploader = self.uploader.scoped(artifact.source_name());
                    let res = if artifact.is_dir() {
                        uploader.upload_directory(&self.cancel, artifact.path())
                    } else {
                        uploader.upload_file(&self.cancel, artifact.path())
                    };
                    res.map_err(|e| JobFailure::new(JobPhase::Uploading, e))?;
                }
                state.uploaded_bytes = state.artifacts.iter().map(Artifact::size).sum();
            }
        }
        Ok(())
    }

    /// Runs every producer on its own thread and waits for all of them.
    /// Failures come back in the order they happened.
    fn produce_artifacts(&self, workspace: &Path) -> (Vec<Artifact>, Vec<(String, Error)>) {
        let artifacts = Mutex::new(Vec::with_capacity(self.producers.len()));
        let (err_tx, err_rx) = channel::bounded(self.producers.len().max(1));
        let ctx = ProduceContext::new(workspace, &self.cancel, self.run_time);

        std::thread::scope(|s| {
            let handles = self
                .producers
                .iter()
                .map(|producer| {
                    let err_tx = err_tx.clone();
                    let artifacts = &artifacts;
                    let ctx = &ctx;
                    let handle = s.spawn(move || {
                        let name = producer.name();
                        tracing::info!("Producer {:?} started", name);
                        let res = producer
                            .produce(ctx)
                            .and_then(|path| Artifact::inspect(name, path));
                        match res {
                            Ok(artifact) => {
                                tracing::info!(
                                    "Producer {:?} finished: {:?} ({} bytes)",
                                    name,
                                    artifact.path(),
                                    artifact.size()
                                );
                                artifacts
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .push(artifact);
                            }
                            Err(e) => {
                                tracing::error!("Producer {:?} failed: {}", name, e);
                                if let Err(send_err) = err_tx.send((name.to_string(), e)) {
                                    tracing::error!(
                                        "Lost producer error: {}",
                                        Error::from(send_err)
                                    );
                                }
                            }
                        }
                    });
                    (producer.name(), handle)
                })
                .collect_vec();

            for (name, handle) in handles {
                if handle.join().is_err() {
                    tracing::error!("Producer {:?} panicked", name);
                    let cause = Error::from(std::io::Error::other("producer thread panicked"));
                    if let Err(send_err) = err_tx.send((name.to_string(), cause)) {
                        tracing::error!("Lost producer error: {}", Error::from(send_err));
                    }
                }
            }
        });
        drop(err_tx);

        let failures = err_rx.try_iter().collect_vec();
        let artifacts = artifacts.into_inner().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(
            "{} producers succeeded, {} failed",
            artifacts.len(),
            failures.len()
        );
        (artifacts, failures)
    }

    /// Removes everything the run created. Errors are logged and counted,
    /// never returned.
    fn clean_up(workspace: Workspace, state: &RunState) -> usize {
        let mut errors = Vec::new();
        for artifact in &state.artifacts {
            if !artifact.path().starts_with(workspace.path()) {
                tracing::debug!("Leaving {:?} in place, not in workspace", artifact.path());
                continue;
            }
            let res = if artifact.is_dir() {
                std::fs::remove_dir_all(artifact.path())
            } else {
                std::fs::remove_file(artifact.path())
            };
            if let Err(e) = res {
                errors.push(
                    Error::from(e).add_msg(format!("Removing artifact {:?}", artifact.path())),
                );
            }
        }
        if let Some(archive) = &state.archive {
            if let Err(e) = std::fs::remove_file(archive.path()) {
                errors.push(
                    Error::from(e).add_msg(format!("Removing archive {:?}", archive.path())),
                );
            }
        }
        if let Err(e) = workspace.remove() {
            errors.push(e);
        }

        let count = errors.len();
        if count > 0 {
            tracing::warn!("{}", Error::cleanup(Error::from(errors)));
        }
        count
    }
}
