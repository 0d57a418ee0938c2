/*
 * Copyright 2025 Oxide Computer Company
 */

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use gantry_types::{JobHandle, JobSpec, JobState, LifecycleState, RunError};
use slog::{debug, info, warn, Logger};

use crate::logtail::LogSource;

/**
 * One remote job service backend.  Backends differ only in how they render
 * a JobSpec into the service's native job template and in how native
 * statuses fold onto LifecycleState; everything that polls, tails, cancels,
 * or cleans up is written against this trait and is never duplicated per
 * backend.
 */
pub trait JobEngine: Send + Sync {
    type Logs: LogSource;

    /**
     * Create a new remote job for this spec and return its handle.
     */
    fn create(
        &self,
        log: &Logger,
        spec: &JobSpec,
    ) -> impl Future<Output = Result<JobHandle>> + Send;

    /**
     * Look for an existing job carrying exactly this spec's label set.
     * Used for resumption; the in-memory handle does not survive a restart
     * of the controlling process, so labels are the only durable key.
     */
    fn find(
        &self,
        log: &Logger,
        spec: &JobSpec,
    ) -> impl Future<Output = Result<Option<(JobHandle, JobState)>>> + Send;

    fn state(
        &self,
        handle: &JobHandle,
    ) -> impl Future<Output = Result<JobState>> + Send;

    /**
     * Ask the service to stop a job that is still running.  Asynchronous
     * and idempotent: cancelling a job that already terminated must be
     * harmless, because the kill path can race the main path here.
     */
    fn cancel(
        &self,
        log: &Logger,
        handle: &JobHandle,
    ) -> impl Future<Output = Result<()>> + Send;

    /**
     * Remove the remote job record after a successful run.  Best-effort
     * cleanup; never required for the correctness of the run's result.
     */
    fn delete(
        &self,
        log: &Logger,
        handle: &JobHandle,
    ) -> impl Future<Output = Result<()>> + Send;

    fn open_logs(
        &self,
        handle: &JobHandle,
    ) -> impl Future<Output = Result<Self::Logs>> + Send;

    /**
     * Submit this spec, or adopt an existing job that matches its labels.
     * With resumption enabled, a found job in any state outside the
     * terminal failure family is adopted: a running job is picked up where
     * it left off, and a finished one just has its outputs harvested.  Two
     * concurrent submitters with the same labels resolve as first creates,
     * second adopts.
     */
    fn submit(
        &self,
        log: &Logger,
        spec: &JobSpec,
        resume: bool,
    ) -> impl Future<Output = Result<JobHandle>> + Send {
        async move {
            if resume {
                if let Some((handle, st)) = self.find(log, spec).await? {
                    if !st.state.is_failure() {
                        info!(
                            log,
                            "resuming existing job {} ({})",
                            handle.job,
                            st.native,
                        );
                        return Ok(handle);
                    }

                    info!(
                        log,
                        "ignoring failed prior job {} ({})",
                        handle.job,
                        st.native,
                    );
                }
            }

            self.create(log, spec).await
        }
    }
}

/**
 * Poll the engine until the job reaches a terminal state, or until the
 * deadline elapses, whichever comes first.  The deadline is checked before
 * each query, so a wait whose deadline has exactly elapsed times out even
 * if the job has meanwhile finished.
 *
 * A backend that has not yet assigned the job a recognizable status reports
 * Unknown; treating that as terminal on sight would fail freshly-created
 * jobs spuriously, so Unknown is only trusted once it has been observed on
 * two consecutive polls.
 */
pub async fn await_terminal<E: JobEngine>(
    log: &Logger,
    engine: &E,
    handle: &JobHandle,
    poll_interval: Duration,
    deadline: Duration,
) -> Result<JobState, RunError> {
    if poll_interval.is_zero() {
        return Err(RunError::Configuration(
            "poll interval must be strictly positive".to_string(),
        ));
    }

    let start = tokio::time::Instant::now();
    let mut seen_unknown = false;

    loop {
        if start.elapsed() >= deadline {
            warn!(log, "job {} did not finish in time", handle.job;
                "waited" => ?deadline);
            return Err(RunError::Timeout { limit: deadline });
        }

        let st = engine.state(handle).await.map_err(RunError::Backend)?;

        match st.state {
            LifecycleState::Unknown => {
                if seen_unknown {
                    return Ok(st);
                }
                seen_unknown = true;
                warn!(log, "job {} has no reported status yet", handle.job;
                    "native" => &st.native);
            }
            s if s.is_terminal() => {
                debug!(log, "job {} reached terminal state", handle.job;
                    "native" => &st.native);
                return Ok(st);
            }
            _ => {
                seen_unknown = false;
                debug!(log, "job {} not yet terminal", handle.job;
                    "native" => &st.native);
            }
        }

        tokio::time::sleep(poll_interval).await;
    }
}
