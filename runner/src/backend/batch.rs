/*
 * Copyright 2025 Oxide Computer Company
 */

use anyhow::{anyhow, bail, Result};
use aws_sdk_batch::types::{
    ContainerProperties, Host, JobDefinitionType, JobDetail, JobStatus,
    JobTimeout, KeyValuePair, KeyValuesPair, MountPoint, ResourceRequirement,
    ResourceType, Volume,
};
use gantry_types::config::ConfigFileBatch;
use gantry_types::{JobHandle, JobSpec, JobState, LifecycleState, RunError};
use slog::{info, Logger};

use super::sanitize_name;
use crate::lifecycle::JobEngine;
use crate::logtail::CwTail;

/**
 * The reason string attached when we terminate a job.  Batch has no native
 * "canceled" status -- a terminated job lands in FAILED -- so the reason is
 * how a cancellation we requested is told apart from an ordinary failure.
 */
const CANCEL_REASON: &str = "canceled by gantry";

/**
 * Jobs on the AWS Batch service.  Each run registers a fresh job
 * definition rendered from the JobSpec and submits it to the configured
 * queue; the label set rides along as job tags and is the resumption
 * filter.
 */
pub struct BatchEngine {
    batch: aws_sdk_batch::Client,
    logs: aws_sdk_cloudwatchlogs::Client,
    queue: String,
    log_group: String,
    job_role: Option<String>,
}

impl BatchEngine {
    pub fn new(
        batch: aws_sdk_batch::Client,
        logs: aws_sdk_cloudwatchlogs::Client,
        config: &ConfigFileBatch,
    ) -> Result<BatchEngine, RunError> {
        Ok(BatchEngine {
            batch,
            logs,
            queue: config.queue()?,
            log_group: config.log_group.clone(),
            job_role: config.job_role.clone(),
        })
    }

    async fn describe(&self, job_id: &str) -> Result<Option<JobDetail>> {
        let res = self.batch.describe_jobs().jobs(job_id).send().await?;
        Ok(res.jobs().first().cloned())
    }
}

pub(crate) fn lifecycle_for_batch(
    status: Option<&JobStatus>,
    reason: Option<&str>,
) -> LifecycleState {
    let Some(status) = status else {
        return LifecycleState::Unknown;
    };

    match status {
        JobStatus::Submitted
        | JobStatus::Pending
        | JobStatus::Runnable
        | JobStatus::Starting
        | JobStatus::Running => LifecycleState::Running,
        JobStatus::Succeeded => LifecycleState::Succeeded,
        JobStatus::Failed => {
            if reason == Some(CANCEL_REASON) {
                LifecycleState::Canceled
            } else {
                LifecycleState::Failed
            }
        }
        _ => LifecycleState::Unknown,
    }
}

fn state_of(job: &JobDetail) -> JobState {
    let native = job
        .status()
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|| "UNKNOWN".to_string());

    JobState {
        state: lifecycle_for_batch(job.status(), job.status_reason()),
        native,
        exit_code: job.container().and_then(|c| c.exit_code()),
    }
}

/**
 * Batch expresses CPU as whole or fractional vCPUs; JobSpec carries
 * millis.
 */
fn render_vcpus(cpu_millis: u64) -> String {
    if cpu_millis % 1000 == 0 {
        (cpu_millis / 1000).to_string()
    } else {
        format!("{}", cpu_millis as f64 / 1000.0)
    }
}

impl JobEngine for BatchEngine {
    type Logs = CwTail;

    async fn create(
        &self,
        log: &Logger,
        spec: &JobSpec,
    ) -> Result<JobHandle> {
        let name = sanitize_name(&spec.name);

        let mut cp = ContainerProperties::builder()
            .image(&spec.image)
            .set_command(Some(spec.full_command()))
            .resource_requirements(
                ResourceRequirement::builder()
                    .r#type(ResourceType::Vcpu)
                    .value(render_vcpus(spec.cpu_millis))
                    .build(),
            )
            .resource_requirements(
                ResourceRequirement::builder()
                    .r#type(ResourceType::Memory)
                    .value(spec.memory_mib.to_string())
                    .build(),
            );

        if let Some(mt) = &spec.machine_type {
            cp = cp.instance_type(mt);
        }
        if let Some(role) = &self.job_role {
            cp = cp.job_role_arn(role);
        }

        for (k, v) in &spec.env {
            cp = cp
                .environment(KeyValuePair::builder().name(k).value(v).build());
        }

        /*
         * Bucket mounts become host volumes: the compute environment
         * exposes each bucket under /mnt/<bucket> and the job sees its
         * prefix at the requested container path.
         */
        for (i, vol) in spec.volumes.iter().enumerate() {
            let vname = format!("vol{}", i);
            cp = cp
                .volumes(
                    Volume::builder()
                        .name(&vname)
                        .host(
                            Host::builder()
                                .source_path(format!(
                                    "/mnt/{}/{}",
                                    vol.bucket, vol.prefix
                                ))
                                .build(),
                        )
                        .build(),
                )
                .mount_points(
                    MountPoint::builder()
                        .source_volume(&vname)
                        .container_path(&vol.container_path)
                        .build(),
                );
        }

        let reg = self
            .batch
            .register_job_definition()
            .job_definition_name(&name)
            .r#type(JobDefinitionType::Container)
            .container_properties(cp.build())
            .send()
            .await?;
        let defarn = reg
            .job_definition_arn()
            .ok_or_else(|| anyhow!("job definition registered with no ARN"))?
            .to_string();

        info!(log, "registered job definition {defarn}");

        let mut req = self
            .batch
            .submit_job()
            .job_name(&name)
            .job_queue(&self.queue)
            .job_definition(&defarn)
            .propagate_tags(true)
            .timeout(
                JobTimeout::builder()
                    .attempt_duration_seconds(
                        spec.timeout.as_secs().max(60) as i32,
                    )
                    .build(),
            );
        for (k, v) in &spec.labels {
            req = req.tags(k, v);
        }

        let res = req.send().await?;
        let job_id = res
            .job_id()
            .ok_or_else(|| anyhow!("job submission returned no job id"))?
            .to_string();

        info!(log, "created batch job {job_id} ({name})");

        Ok(JobHandle { job: job_id, execution: None })
    }

    async fn find(
        &self,
        log: &Logger,
        spec: &JobSpec,
    ) -> Result<Option<(JobHandle, JobState)>> {
        let name = sanitize_name(&spec.name);

        let res = self
            .batch
            .list_jobs()
            .job_queue(&self.queue)
            .filters(
                KeyValuesPair::builder()
                    .name("JOB_NAME")
                    .values(&name)
                    .build(),
            )
            .send()
            .await?;

        let mut summaries = res.job_summary_list().to_vec();
        summaries
            .sort_by_key(|s| std::cmp::Reverse(s.created_at().unwrap_or(0)));

        for summary in summaries {
            let Some(job_id) = summary.job_id() else {
                continue;
            };
            let Some(job) = self.describe(job_id).await? else {
                continue;
            };

            /*
             * The name filter is coarse; only a job carrying exactly our
             * label set belongs to this run identity.
             */
            let Some(tags) = job.tags() else {
                continue;
            };
            if tags.len() != spec.labels.len()
                || !spec.labels.iter().all(|(k, v)| tags.get(k) == Some(v))
            {
                continue;
            }

            let st = state_of(&job);
            info!(log, "found existing batch job {job_id}";
                "native" => &st.native);
            return Ok(Some((
                JobHandle { job: job_id.to_string(), execution: None },
                st,
            )));
        }

        Ok(None)
    }

    async fn state(&self, handle: &JobHandle) -> Result<JobState> {
        match self.describe(&handle.job).await? {
            Some(job) => Ok(state_of(&job)),
            None => {
                /*
                 * A job we submitted no longer appears: our delete request
                 * has been accepted and the record is on its way out.
                 */
                Ok(JobState::new(
                    LifecycleState::DeletionInProgress,
                    "DELETED",
                ))
            }
        }
    }

    async fn cancel(&self, log: &Logger, handle: &JobHandle) -> Result<()> {
        info!(log, "terminating batch job {}", handle.job);
        self.batch
            .terminate_job()
            .job_id(&handle.job)
            .reason(CANCEL_REASON)
            .send()
            .await?;

        Ok(())
    }

    async fn delete(&self, log: &Logger, handle: &JobHandle) -> Result<()> {
        /*
         * Batch jobs age out on their own; what we registered, and must
         * retire, is the per-run job definition.
         */
        let Some(job) = self.describe(&handle.job).await? else {
            return Ok(());
        };
        let Some(defarn) = job.job_definition() else {
            return Ok(());
        };

        info!(log, "deregistering job definition {defarn}");
        self.batch
            .deregister_job_definition()
            .job_definition(defarn)
            .send()
            .await?;

        Ok(())
    }

    async fn open_logs(&self, handle: &JobHandle) -> Result<CwTail> {
        let Some(job) = self.describe(&handle.job).await? else {
            bail!("job {} not found while opening logs", handle.job);
        };

        /*
         * Once the job has a log stream we can tail it precisely;
         * beforehand, the stream prefix the service will use is derived
         * from the job name.
         */
        let prefix = if let Some(stream) =
            job.container().and_then(|c| c.log_stream_name())
        {
            stream.to_string()
        } else if let Some(name) = job.job_name() {
            format!("{}/default/", name)
        } else {
            bail!("job {} has neither log stream nor name", handle.job);
        };

        Ok(CwTail::new(self.logs.clone(), &self.log_group, &prefix))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lifecycle_mapping_is_exhaustive() {
        let cases = vec![
            (JobStatus::Submitted, LifecycleState::Running),
            (JobStatus::Pending, LifecycleState::Running),
            (JobStatus::Runnable, LifecycleState::Running),
            (JobStatus::Starting, LifecycleState::Running),
            (JobStatus::Running, LifecycleState::Running),
            (JobStatus::Succeeded, LifecycleState::Succeeded),
            (JobStatus::Failed, LifecycleState::Failed),
        ];

        for (native, want) in cases {
            assert_eq!(
                lifecycle_for_batch(Some(&native), None),
                want,
                "status {:?}",
                native,
            );
        }

        /*
         * Anything the service reports that we do not recognize, and a
         * job with no status at all, is a failure -- never a success.
         */
        let odd = JobStatus::from("SOME_NEW_STATUS");
        assert_eq!(
            lifecycle_for_batch(Some(&odd), None),
            LifecycleState::Unknown
        );
        assert_eq!(lifecycle_for_batch(None, None), LifecycleState::Unknown);
        assert!(lifecycle_for_batch(None, None).is_failure());
    }

    #[test]
    fn test_terminated_job_maps_to_canceled() {
        assert_eq!(
            lifecycle_for_batch(Some(&JobStatus::Failed), Some(CANCEL_REASON)),
            LifecycleState::Canceled,
        );
        assert_eq!(
            lifecycle_for_batch(
                Some(&JobStatus::Failed),
                Some("Essential container in task exited"),
            ),
            LifecycleState::Failed,
        );
    }

    #[test]
    fn test_render_vcpus() {
        let cases = vec![
            (250, "0.25"),
            (500, "0.5"),
            (1000, "1"),
            (2000, "2"),
            (16000, "16"),
        ];

        for (millis, want) in cases {
            assert_eq!(render_vcpus(millis), want, "millis {}", millis);
        }
    }
}
