/*
 * Copyright 2025 Oxide Computer Company
 */

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use gantry_common::*;
use gantry_runner::backend::{BatchEngine, FargateEngine};
use gantry_runner::{Canceler, JobEngine, RunOptions, S3Store};
use gantry_types::config::ConfigFile;
use gantry_types::{JobSpec, RunError, RunResult};
use getopts::Options;
use slog::{info, o, Logger};

#[tokio::main]
async fn main() -> Result<()> {
    let mut opts = Options::new();

    opts.optopt("f", "", "configuration file", "CONFIG");
    opts.optopt("t", "", "wait at most this many seconds", "SECONDS");

    let p = match opts.parse(std::env::args().skip(1)) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("ERROR: usage: {}", e);
            eprintln!("       {}", opts.usage("usage"));
            std::process::exit(1);
        }
    };

    let log = make_log("gantry");
    let config: ConfigFile = if let Some(f) = p.opt_str("f").as_deref() {
        read_toml(f)?
    } else {
        bail!("must specify configuration file (-f)");
    };
    let timeout = p
        .opt_str("t")
        .map(|s| s.parse::<u64>())
        .transpose()?
        .map(Duration::from_secs);

    let spec = config.job.job_spec(&config.run.labels)?;

    let region = match &spec.region {
        Some(r) => aws_config::Region::new(r.clone()),
        None => config.aws.region()?,
    };

    /*
     * Two independently-owned client sessions: one shared by the run path,
     * and one dedicated to the kill path, which may outlive the first.
     */
    let shared = sdk_config(&config, region.clone()).await?;
    let killside = sdk_config(&config, region.clone()).await?;

    let run_opts = RunOptions {
        bucket: config.storage.as_ref().map(|s| s.bucket()).transpose()?,
        input_root: std::env::current_dir()?,
        output_root: match &config.run.output_root {
            Some(p) => p.clone(),
            None => std::env::current_dir()?,
        },
        upload: config.job.upload.clone(),
        download: config.job.download.clone(),
        output_dir: config.job.output_dir,
        max_wait: config.run.max_wait(),
        poll_interval: config.run.poll_interval(),
        log_grace: config.run.log_grace(),
        delete_job: config.run.delete_job,
        delete_staged: config.run.delete_staged,
        resume: config.run.resume,
    };

    let store = S3Store::new(aws_sdk_s3::Client::new(&shared));

    let start = Instant::now();
    let res = match (&config.batch, &config.fargate) {
        (Some(b), None) => {
            let engine = BatchEngine::new(
                aws_sdk_batch::Client::new(&shared),
                aws_sdk_cloudwatchlogs::Client::new(&shared),
                b,
            )?;
            let kill = BatchEngine::new(
                aws_sdk_batch::Client::new(&killside),
                aws_sdk_cloudwatchlogs::Client::new(&killside),
                b,
            )?;

            execute(&log, engine, kill, store, spec, &run_opts, timeout)
                .await
        }
        (None, Some(f)) => {
            let engine = FargateEngine::new(
                aws_sdk_ecs::Client::new(&shared),
                aws_sdk_cloudwatchlogs::Client::new(&shared),
                f,
                region.as_ref(),
            )?;
            let kill = FargateEngine::new(
                aws_sdk_ecs::Client::new(&killside),
                aws_sdk_cloudwatchlogs::Client::new(&killside),
                f,
                region.as_ref(),
            )?;

            execute(&log, engine, kill, store, spec, &run_opts, timeout)
                .await
        }
        _ => bail!("exactly one of [batch] or [fargate] must be configured"),
    };

    let dur = Instant::now().saturating_duration_since(start);
    match res {
        Ok(r) => {
            info!(log, "remote command succeeded";
                "exit_code" => r.exit_code,
                "stdout_lines" => r.stdout_lines,
                "stderr_lines" => r.stderr_lines,
                "duration" => dur.render());
            Ok(())
        }
        Err(e) => bail!("run failed after {}: {e}", dur.render()),
    }
}

async fn sdk_config(
    config: &ConfigFile,
    region: aws_config::Region,
) -> Result<aws_config::SdkConfig, RunError> {
    Ok(aws_config::ConfigLoader::default()
        .region(region)
        .credentials_provider(config.aws.creds()?)
        .behavior_version(aws_config::BehaviorVersion::v2023_11_09())
        .load()
        .await)
}

async fn execute<E: JobEngine + 'static>(
    log: &Logger,
    engine: E,
    kill_engine: E,
    store: S3Store,
    spec: JobSpec,
    opts: &RunOptions,
    timeout: Option<Duration>,
) -> Result<RunResult, RunError> {
    let canceler = Arc::new(Canceler::new(log, kill_engine));

    /*
     * Wire the interrupt signal to the cancellation handler.  The handler
     * holds its own client session, so it remains usable even while the
     * run path is tearing down.
     */
    tokio::task::spawn({
        let log = log.new(o!("component" => "signal"));
        let canceler = Arc::clone(&canceler);
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(log, "interrupt received; cancelling remote job");
                canceler.fire().await;
            }
        }
    });

    gantry_runner::run(log, &engine, &store, &canceler, spec, opts, timeout)
        .await
}
