/*
 * Copyright 2025 Oxide Computer Company
 */

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, Compatibility, ContainerDefinition,
    DesiredStatus, EphemeralStorage, KeyValuePair, LaunchType,
    LogConfiguration, LogDriver, NetworkConfiguration, NetworkMode, Tag,
    Task, TaskField, TaskStopCode,
};
use gantry_types::config::ConfigFileFargate;
use gantry_types::{JobHandle, JobSpec, JobState, LifecycleState, RunError};
use slog::{info, Logger};

use super::sanitize_name;
use crate::lifecycle::JobEngine;
use crate::logtail::CwTail;

const CANCEL_REASON: &str = "canceled by gantry";

/*
 * Every task we run has a single container with this name, and its log
 * stream carries this prefix, so a task id is all that is needed to find
 * its logs.
 */
const CONTAINER_NAME: &str = "task";
const STREAM_PREFIX: &str = "gantry";

/**
 * Jobs on ECS with the Fargate serverless launch type.  Each run registers
 * a task definition family rendered from the JobSpec and runs a single
 * task; the handle carries the definition ARN as the job and the task ARN
 * as the derived execution.  The started-by field holds the label digest,
 * which is the durable resumption key.
 */
pub struct FargateEngine {
    ecs: aws_sdk_ecs::Client,
    logs: aws_sdk_cloudwatchlogs::Client,
    cluster: String,
    subnets: Vec<String>,
    security_groups: Vec<String>,
    assign_public_ip: bool,
    execution_role: Option<String>,
    log_group: String,
    region: String,
}

impl FargateEngine {
    pub fn new(
        ecs: aws_sdk_ecs::Client,
        logs: aws_sdk_cloudwatchlogs::Client,
        config: &ConfigFileFargate,
        region: &str,
    ) -> Result<FargateEngine, RunError> {
        Ok(FargateEngine {
            ecs,
            logs,
            cluster: config.cluster()?,
            subnets: config.subnets.clone(),
            security_groups: config.security_groups.clone(),
            assign_public_ip: config.assign_public_ip,
            execution_role: config.execution_role.clone(),
            log_group: config.log_group.clone(),
            region: region.to_string(),
        })
    }
}

pub(crate) fn lifecycle_for_task(
    last_status: Option<&str>,
    stop_code: Option<&TaskStopCode>,
    exit_code: Option<i32>,
) -> LifecycleState {
    match last_status {
        Some(
            "PROVISIONING" | "PENDING" | "ACTIVATING" | "RUNNING"
            | "DEACTIVATING" | "STOPPING" | "DEPROVISIONING",
        ) => LifecycleState::Running,
        Some("STOPPED") => match stop_code {
            Some(TaskStopCode::UserInitiated) => LifecycleState::Canceled,
            Some(TaskStopCode::EssentialContainerExited) => {
                if exit_code == Some(0) {
                    LifecycleState::Succeeded
                } else {
                    LifecycleState::Failed
                }
            }
            Some(TaskStopCode::TaskFailedToStart) => LifecycleState::Failed,
            _ => match exit_code {
                Some(0) => LifecycleState::Succeeded,
                Some(_) => LifecycleState::Failed,
                None => LifecycleState::Unknown,
            },
        },
        _ => LifecycleState::Unknown,
    }
}

fn state_of(task: &Task) -> JobState {
    let native = task.last_status().unwrap_or("UNKNOWN").to_string();
    let exit_code = task.containers().first().and_then(|c| c.exit_code());

    JobState {
        state: lifecycle_for_task(
            task.last_status(),
            task.stop_code(),
            exit_code,
        ),
        native,
        exit_code,
    }
}

/**
 * Fargate expresses CPU in units of 1/1024th of a vCPU; JobSpec carries
 * millis.  The standard sizes (250, 500, 1000, 2000... millis) land
 * exactly on the sizes Fargate accepts.
 */
fn render_cpu_units(cpu_millis: u64) -> String {
    ((cpu_millis * 1024) / 1000).to_string()
}

fn task_id(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

impl JobEngine for FargateEngine {
    type Logs = CwTail;

    async fn create(
        &self,
        log: &Logger,
        spec: &JobSpec,
    ) -> Result<JobHandle> {
        let family = sanitize_name(&spec.name);

        let mut cd = ContainerDefinition::builder()
            .name(CONTAINER_NAME)
            .image(&spec.image)
            .set_command(Some(spec.full_command()))
            .essential(true)
            .log_configuration(
                LogConfiguration::builder()
                    .log_driver(LogDriver::Awslogs)
                    .options("awslogs-group", &self.log_group)
                    .options("awslogs-region", &self.region)
                    .options("awslogs-stream-prefix", STREAM_PREFIX)
                    .build()?,
            );

        for (k, v) in &spec.env {
            cd = cd
                .environment(KeyValuePair::builder().name(k).value(v).build());
        }

        /*
         * Fargate tasks cannot mount host paths, so bucket mounts are
         * exported as environment for the image's entry wrapper to sync.
         */
        for (i, vol) in spec.volumes.iter().enumerate() {
            let suffix =
                if i == 0 { String::new() } else { format!("_{}", i) };
            for (name, value) in [
                (format!("GANTRY_BUCKET{}", suffix), &vol.bucket),
                (format!("GANTRY_PREFIX{}", suffix), &vol.prefix),
                (format!("GANTRY_MOUNT{}", suffix), &vol.container_path),
            ] {
                cd = cd.environment(
                    KeyValuePair::builder().name(name).value(value).build(),
                );
            }
        }

        let mut reg = self
            .ecs
            .register_task_definition()
            .family(&family)
            .requires_compatibilities(Compatibility::Fargate)
            .network_mode(NetworkMode::Awsvpc)
            .cpu(render_cpu_units(spec.cpu_millis))
            .memory(spec.memory_mib.to_string())
            .container_definitions(cd.build());

        if let Some(role) = &self.execution_role {
            reg = reg.execution_role_arn(role);
        }
        if let Some(disk_mib) = spec.boot_disk_mib {
            /*
             * Fargate takes whole GiB, minimum 21.
             */
            let storage = EphemeralStorage::builder()
                .size_in_gib(disk_mib.div_ceil(1024).max(21) as i32)
                .build();
            reg = reg.ephemeral_storage(storage);
        }

        let res = reg.send().await?;
        let defarn = res
            .task_definition()
            .and_then(|t| t.task_definition_arn())
            .ok_or_else(|| {
                anyhow!("task definition registered with no ARN")
            })?
            .to_string();

        info!(log, "registered task definition {defarn}");

        /*
         * The job-level network interface list overrides the configured
         * cluster subnets when present.
         */
        let subnets = if spec.network_interfaces.is_empty() {
            self.subnets.clone()
        } else {
            spec.network_interfaces.clone()
        };

        let mut req = self
            .ecs
            .run_task()
            .cluster(&self.cluster)
            .launch_type(LaunchType::Fargate)
            .task_definition(&defarn)
            .count(1)
            .started_by(spec.label_digest())
            .network_configuration(
                NetworkConfiguration::builder()
                    .awsvpc_configuration(
                        AwsVpcConfiguration::builder()
                            .set_subnets(Some(subnets))
                            .set_security_groups(
                                Some(self.security_groups.clone())
                                    .filter(|sgs| !sgs.is_empty()),
                            )
                            .assign_public_ip(if self.assign_public_ip {
                                AssignPublicIp::Enabled
                            } else {
                                AssignPublicIp::Disabled
                            })
                            .build()?,
                    )
                    .build(),
            );
        for (k, v) in &spec.labels {
            req = req.tags(Tag::builder().key(k).value(v).build());
        }

        let res = req.send().await?;
        if let Some(failure) = res.failures().first() {
            bail!(
                "task launch failed: {} ({})",
                failure.reason().unwrap_or("?"),
                failure.detail().unwrap_or("-"),
            );
        }
        let arn = res
            .tasks()
            .first()
            .and_then(|t| t.task_arn())
            .ok_or_else(|| anyhow!("run-task returned no task"))?
            .to_string();

        info!(log, "created fargate task {} ({family})", task_id(&arn));

        Ok(JobHandle { job: defarn, execution: Some(arn) })
    }

    async fn find(
        &self,
        log: &Logger,
        spec: &JobSpec,
    ) -> Result<Option<(JobHandle, JobState)>> {
        let digest = spec.label_digest();

        let mut arns = Vec::new();
        for status in [DesiredStatus::Running, DesiredStatus::Stopped] {
            let res = self
                .ecs
                .list_tasks()
                .cluster(&self.cluster)
                .started_by(&digest)
                .desired_status(status)
                .send()
                .await?;
            arns.extend(res.task_arns().iter().cloned());
        }
        if arns.is_empty() {
            return Ok(None);
        }

        let mut req = self
            .ecs
            .describe_tasks()
            .cluster(&self.cluster)
            .include(TaskField::Tags);
        for arn in &arns {
            req = req.tasks(arn);
        }
        let res = req.send().await?;

        let mut stopped: Option<(JobHandle, JobState)> = None;
        for task in res.tasks() {
            let Some(arn) = task.task_arn() else {
                continue;
            };

            /*
             * The started-by digest is a coarse filter; require the exact
             * label set before adopting anything.
             */
            let tags: BTreeMap<String, String> = task
                .tags()
                .iter()
                .filter_map(|t| {
                    Some((t.key()?.to_string(), t.value()?.to_string()))
                })
                .collect();
            if tags != spec.labels {
                continue;
            }

            let st = state_of(task);
            let handle = JobHandle {
                job: task
                    .task_definition_arn()
                    .unwrap_or_default()
                    .to_string(),
                execution: Some(arn.to_string()),
            };

            info!(log, "found existing fargate task {}", task_id(arn);
                "native" => &st.native);

            if !st.state.is_terminal() {
                return Ok(Some((handle, st)));
            }
            if stopped.is_none() {
                stopped = Some((handle, st));
            }
        }

        Ok(stopped)
    }

    async fn state(&self, handle: &JobHandle) -> Result<JobState> {
        let Some(arn) = &handle.execution else {
            bail!("fargate handle {} has no task", handle.job);
        };

        let res = self
            .ecs
            .describe_tasks()
            .cluster(&self.cluster)
            .tasks(arn)
            .send()
            .await?;

        match res.tasks().first() {
            Some(task) => Ok(state_of(task)),
            None => {
                /*
                 * Stopped tasks age out of the describe API after a while;
                 * at that point we can no longer tell what happened.
                 */
                Ok(JobState::new(LifecycleState::Unknown, "MISSING"))
            }
        }
    }

    async fn cancel(&self, log: &Logger, handle: &JobHandle) -> Result<()> {
        let Some(arn) = &handle.execution else {
            bail!("fargate handle {} has no task", handle.job);
        };

        info!(log, "stopping fargate task {}", task_id(arn));
        self.ecs
            .stop_task()
            .cluster(&self.cluster)
            .task(arn)
            .reason(CANCEL_REASON)
            .send()
            .await?;

        Ok(())
    }

    async fn delete(&self, log: &Logger, handle: &JobHandle) -> Result<()> {
        info!(log, "deregistering task definition {}", handle.job);
        self.ecs
            .deregister_task_definition()
            .task_definition(&handle.job)
            .send()
            .await?;

        Ok(())
    }

    async fn open_logs(&self, handle: &JobHandle) -> Result<CwTail> {
        let Some(arn) = &handle.execution else {
            bail!("fargate handle {} has no task", handle.job);
        };

        let stream = format!(
            "{}/{}/{}",
            STREAM_PREFIX,
            CONTAINER_NAME,
            task_id(arn)
        );

        Ok(CwTail::new(self.logs.clone(), &self.log_group, &stream))
    }
}
