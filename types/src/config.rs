/*
 * Copyright 2025 Oxide Computer Company
 */

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use gantry_common::expand_env;
use serde::Deserialize;

use crate::{JobSpec, RunError};

/**
 * Configuration values may reference environment variables as "%NAME%";
 * references are resolved when the value is read, and an unresolvable
 * reference is a configuration error.
 */
fn render(value: &str) -> Result<String, RunError> {
    expand_env(value).map_err(|e| RunError::Configuration(e.to_string()))
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub aws: ConfigFileAws,
    pub storage: Option<ConfigFileStorage>,
    pub batch: Option<ConfigFileBatch>,
    pub fargate: Option<ConfigFileFargate>,
    pub job: ConfigFileJob,
    #[serde(default)]
    pub run: ConfigFileRun,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileAws {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

impl ConfigFileAws {
    pub fn creds(
        &self,
    ) -> Result<aws_credential_types::Credentials, RunError> {
        Ok(aws_credential_types::Credentials::new(
            render(&self.access_key_id)?,
            render(&self.secret_access_key)?,
            None,
            None,
            "gantry",
        ))
    }

    pub fn region(&self) -> Result<aws_types::region::Region, RunError> {
        Ok(aws_types::region::Region::new(render(&self.region)?))
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileStorage {
    pub bucket: String,
}

impl ConfigFileStorage {
    pub fn bucket(&self) -> Result<String, RunError> {
        render(&self.bucket)
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileBatch {
    pub queue: String,
    #[serde(default = "default_batch_log_group")]
    pub log_group: String,
    pub job_role: Option<String>,
}

fn default_batch_log_group() -> String {
    /*
     * The log group the Batch service writes container output to unless a
     * job definition says otherwise.
     */
    "/aws/batch/job".to_string()
}

impl ConfigFileBatch {
    pub fn queue(&self) -> Result<String, RunError> {
        render(&self.queue)
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileFargate {
    pub cluster: String,
    pub subnets: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub assign_public_ip: bool,
    pub execution_role: Option<String>,
    pub log_group: String,
}

impl ConfigFileFargate {
    pub fn cluster(&self) -> Result<String, RunError> {
        render(&self.cluster)
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileJob {
    pub name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_cpu_millis")]
    pub cpu_millis: u64,
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u64,
    pub boot_disk_mib: Option<u64>,
    pub machine_type: Option<String>,
    pub region: Option<String>,
    #[serde(default)]
    pub network_interfaces: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub upload: Vec<String>,
    #[serde(default)]
    pub download: Vec<String>,
    #[serde(default)]
    pub output_dir: bool,
}

fn default_cpu_millis() -> u64 {
    1000
}

fn default_memory_mib() -> u64 {
    1024
}

fn default_timeout_secs() -> u64 {
    3600
}

impl ConfigFileJob {
    /**
     * Build the immutable job descriptor for one run.  The job name, when
     * not given explicitly, is derived from the label set so that a
     * restarted process arrives at the same name and can resume.
     */
    pub fn job_spec(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<JobSpec, RunError> {
        let name = if let Some(n) = &self.name {
            render(n)?
        } else if !labels.is_empty() {
            format!("gantry-{}", crate::label_digest(labels))
        } else {
            format!(
                "gantry-{}",
                rusty_ulid::Ulid::generate().to_string().to_lowercase()
            )
        };

        Ok(JobSpec {
            name,
            image: render(&self.image)?,
            command: self.command.clone(),
            entrypoint: self.entrypoint.clone(),
            env: self.env.clone(),
            cpu_millis: self.cpu_millis,
            memory_mib: self.memory_mib,
            boot_disk_mib: self.boot_disk_mib,
            machine_type: self.machine_type.clone(),
            region: self.region.clone(),
            network_interfaces: self.network_interfaces.clone(),
            volumes: Vec::new(),
            labels: labels.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileRun {
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_log_grace_ms")]
    pub log_grace_ms: u64,
    #[serde(default = "default_true")]
    pub delete_job: bool,
    #[serde(default = "default_true")]
    pub delete_staged: bool,
    #[serde(default = "default_true")]
    pub resume: bool,
    pub output_root: Option<PathBuf>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_max_wait_secs() -> u64 {
    3600
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_log_grace_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for ConfigFileRun {
    fn default() -> ConfigFileRun {
        ConfigFileRun {
            max_wait_secs: default_max_wait_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            log_grace_ms: default_log_grace_ms(),
            delete_job: true,
            delete_staged: true,
            resume: true,
            output_root: None,
            labels: BTreeMap::new(),
        }
    }
}

impl ConfigFileRun {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn log_grace(&self) -> Duration {
        Duration::from_millis(self.log_grace_ms)
    }
}
