/*
 * Copyright 2025 Oxide Computer Company
 */

use std::path::PathBuf;
use std::time::Duration;

use gantry_types::{
    JobSpec, RunError, RunResult, StagingPlan, VolumeMount,
};
use slog::{info, warn, Logger};

use crate::cancel::Canceler;
use crate::lifecycle::{await_terminal, JobEngine};
use crate::logtail::LogTail;
use crate::store::{
    delete_prefix, download_outputs, upload_inputs, ObjectStore,
};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub bucket: Option<String>,
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub upload: Vec<String>,
    pub download: Vec<String>,
    pub output_dir: bool,
    pub max_wait: Duration,
    pub poll_interval: Duration,
    pub log_grace: Duration,
    pub delete_job: bool,
    pub delete_staged: bool,
    pub resume: bool,
}

impl RunOptions {
    fn needs_files(&self) -> bool {
        !self.upload.is_empty() || !self.download.is_empty()
            || self.output_dir
    }
}

/**
 * Execute one containerized command remotely, start to finish: stage
 * inputs, submit or resume the job, tail its logs while polling for a
 * terminal state, harvest outputs, and tear down.  The canceler is armed
 * as soon as a handle exists, so an external kill signal can reach the
 * job at any point after submission.
 *
 * The staged storage is released on every exit path: normal return, any
 * raised error, and the cancellation path (which the run observes as a
 * terminal state through its own polling).  Cleanup failures are logged
 * and swallowed so they never mask the primary outcome.
 */
pub async fn run<E, K, S>(
    log: &Logger,
    engine: &E,
    store: &S,
    canceler: &Canceler<K>,
    spec: JobSpec,
    opts: &RunOptions,
    timeout: Option<Duration>,
) -> Result<RunResult, RunError>
where
    E: JobEngine,
    K: JobEngine,
    S: ObjectStore,
{
    if opts.poll_interval.is_zero() {
        return Err(RunError::Configuration(
            "poll interval must be strictly positive".to_string(),
        ));
    }

    let plan = match (&opts.bucket, opts.needs_files()) {
        (Some(bucket), _) => Some(StagingPlan::new(bucket, opts.output_dir)),
        (None, true) => {
            return Err(RunError::Configuration(
                "a staging bucket must be configured when input or output \
                files are declared"
                    .to_string(),
            ));
        }
        (None, false) => None,
    };

    let res =
        run_staged(log, engine, store, canceler, spec, opts, timeout, &plan)
            .await;

    /*
     * Release the staged storage no matter how the run ended.
     */
    if let Some(plan) = &plan {
        if opts.delete_staged {
            if let Err(e) =
                delete_prefix(log, store, &plan.bucket, &plan.prefix).await
            {
                warn!(log, "staging cleanup failed: {e}");
            }
        }
    }

    res
}

async fn run_staged<E, K, S>(
    log: &Logger,
    engine: &E,
    store: &S,
    canceler: &Canceler<K>,
    mut spec: JobSpec,
    opts: &RunOptions,
    timeout: Option<Duration>,
    plan: &Option<StagingPlan>,
) -> Result<RunResult, RunError>
where
    E: JobEngine,
    K: JobEngine,
    S: ObjectStore,
{
    if let Some(plan) = plan {
        upload_inputs(
            log,
            store,
            plan,
            &opts.input_root,
            &opts.upload,
            opts.output_dir,
        )
        .await?;

        /*
         * The job sees the staged files through the working directory
         * mount; the paths are also exported so the command can locate
         * them without knowing the run id.
         */
        spec.volumes.push(VolumeMount {
            bucket: plan.bucket.clone(),
            prefix: plan.prefix.clone(),
            container_path: plan.work_dir.clone(),
        });
        spec.env
            .insert("GANTRY_WORKDIR".to_string(), plan.work_dir.clone());
        if let Some(od) = &plan.output_dir {
            spec.env.insert("GANTRY_OUTDIR".to_string(), od.clone());
        }
    }

    let handle =
        engine.submit(log, &spec, opts.resume).await.map_err(RunError::Backend)?;
    info!(log, "job submitted"; "job" => &handle.job,
        "execution" => handle.execution.as_deref().unwrap_or("-"));

    canceler.arm(handle.clone());

    /*
     * Logs are best-effort observability: a tail that cannot be opened
     * degrades diagnostics but never fails the run.
     */
    let tail = match engine.open_logs(&handle).await {
        Ok(source) => Some(LogTail::start(log, source)),
        Err(e) => {
            warn!(log, "could not open log stream: {e:?}");
            None
        }
    };

    let deadline =
        timeout.map(|t| t.min(opts.max_wait)).unwrap_or(opts.max_wait);
    let outcome =
        await_terminal(log, engine, &handle, opts.poll_interval, deadline)
            .await;

    /*
     * Flush the tail before acting on the outcome, so the line counts in
     * a failure report are complete.
     */
    let (stdout_lines, stderr_lines) = match tail {
        Some(tail) => tail.close(opts.log_grace).await,
        None => (0, 0),
    };

    let st = outcome?;

    if st.state.is_failure() {
        return Err(RunError::RemoteExecution {
            native: st.native,
            exit_code: st.exit_code,
            stdout_lines,
            stderr_lines,
        });
    }

    info!(log, "job finished"; "native" => &st.native,
        "exit_code" => st.exit_code.unwrap_or(0),
        "stdout_lines" => stdout_lines, "stderr_lines" => stderr_lines);

    if opts.delete_job {
        if let Err(e) = engine.delete(log, &handle).await {
            warn!(log, "job deletion failed: {e:?}");
        }
    }

    if let Some(plan) = plan {
        download_outputs(
            log,
            store,
            plan,
            &opts.output_root,
            &opts.download,
            opts.output_dir,
        )
        .await?;
    }

    Ok(RunResult {
        exit_code: st.exit_code.unwrap_or(0),
        stdout_lines,
        stderr_lines,
    })
}
