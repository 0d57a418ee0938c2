/*
 * Copyright 2025 Oxide Computer Company
 */

use std::collections::BTreeMap;
use std::time::Duration;

use rusty_ulid::Ulid;

pub mod config;
mod error;

pub use error::RunError;

/**
 * A short deterministic digest of a label set.  Labels are digested in
 * sorted order, so two sets with the same contents always agree regardless
 * of how the maps were built, and the 32 character result fits backend
 * fields with tight length limits.
 */
pub fn label_digest(labels: &BTreeMap<String, String>) -> String {
    let mut buf = String::new();
    for (k, v) in labels {
        buf.push_str(k);
        buf.push('=');
        buf.push_str(v);
        buf.push('\n');
    }

    let h = hmac_sha256::Hash::hash(buf.as_bytes());
    hex::encode(&h[..16])
}

/**
 * The lifecycle of a remote job as gantry observes it.  Native backend
 * statuses are folded onto this enum; anything the backend reports that we
 * do not recognize, or a job for which the backend reports nothing at all,
 * is Unknown, which is treated as a failure so that a partially-failed run
 * can never masquerade as a success.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unsubmitted,
    Running,
    Succeeded,
    Failed,
    Canceled,
    DeletionInProgress,
    Unknown,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LifecycleState::Unsubmitted | LifecycleState::Running)
    }

    /**
     * Terminal states that fail the run: Failed, Canceled, and Unknown.
     */
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            LifecycleState::Failed
                | LifecycleState::Canceled
                | LifecycleState::Unknown
        )
    }

    /**
     * Terminal states that complete the run: a job that succeeded, or one
     * whose deletion we requested and which is now on its way out.
     */
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            LifecycleState::Succeeded | LifecycleState::DeletionInProgress
        )
    }
}

/**
 * A lifecycle state as mapped from one backend status query, along with the
 * native status string it was derived from and the container exit code when
 * the backend reported one.
 */
#[derive(Debug, Clone)]
pub struct JobState {
    pub state: LifecycleState,
    pub native: String,
    pub exit_code: Option<i32>,
}

impl JobState {
    pub fn new(state: LifecycleState, native: &str) -> JobState {
        JobState { state, native: native.to_string(), exit_code: None }
    }
}

/**
 * Opaque remote identifiers for a submitted job.  The job field is the
 * backend's primary identifier; serverless backends additionally derive an
 * execution identifier for the single task they run.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job: String,
    pub execution: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub bucket: String,
    pub prefix: String,
    pub container_path: String,
}

/**
 * Immutable descriptor for one remote job, built once per run.  The label
 * set doubles as the resumption filter: it is the only correlation key that
 * survives a restart of the controlling process.
 */
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Option<String>,
    pub env: BTreeMap<String, String>,
    pub cpu_millis: u64,
    pub memory_mib: u64,
    pub boot_disk_mib: Option<u64>,
    pub machine_type: Option<String>,
    pub region: Option<String>,
    pub network_interfaces: Vec<String>,
    pub volumes: Vec<VolumeMount>,
    pub labels: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl JobSpec {
    /**
     * A short deterministic digest of the label set, usable where backends
     * limit correlation values to a handful of characters.  Labels are
     * digested in sorted order, so two specs with the same labels always
     * agree regardless of how the maps were built.
     */
    pub fn label_digest(&self) -> String {
        label_digest(&self.labels)
    }

    /**
     * The full command to run in the container, with any entrypoint
     * override prepended.
     */
    pub fn full_command(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(ep) = &self.entrypoint {
            out.push(ep.to_string());
        }
        out.extend(self.command.iter().cloned());
        out
    }
}

/**
 * Where one run keeps its files: a bucket, a bucket-relative prefix that is
 * never reused by any other run, and the container-side paths derived from
 * it.  The prefix is the object store rendition of the working directory.
 */
#[derive(Debug, Clone)]
pub struct StagingPlan {
    pub bucket: String,
    pub prefix: String,
    pub work_dir: String,
    pub output_dir: Option<String>,
}

impl StagingPlan {
    pub fn new(bucket: &str, with_output_dir: bool) -> StagingPlan {
        let id = Ulid::generate().to_string().to_lowercase();

        let work_dir = format!("/gantry/{}", id);
        let output_dir =
            with_output_dir.then(|| format!("{}/outputs", work_dir));

        StagingPlan {
            bucket: bucket.to_string(),
            prefix: work_dir.trim_start_matches('/').to_string(),
            work_dir,
            output_dir,
        }
    }

    pub fn object_key(&self, relpath: &str) -> String {
        format!("{}/{}", self.prefix, relpath)
    }

    /**
     * The zero-byte object that marks the working directory itself as a
     * listable prefix.
     */
    pub fn marker_key(&self) -> String {
        format!("{}/", self.prefix)
    }

    pub fn output_prefix(&self) -> Option<String> {
        self.output_dir.as_ref().map(|_| format!("{}/outputs", self.prefix))
    }
}

/**
 * What a finished run reports back: the container exit code and how many
 * log lines of each classification the tail observed.  The line counts are
 * for failure diagnostics; output capture goes through the object store.
 */
#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout_lines: u64,
    pub stderr_lines: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec_with_labels(pairs: &[(&str, &str)]) -> JobSpec {
        JobSpec {
            name: "x".into(),
            image: "busybox".into(),
            command: vec!["true".into()],
            entrypoint: None,
            env: Default::default(),
            cpu_millis: 1000,
            memory_mib: 512,
            boot_disk_mib: None,
            machine_type: None,
            region: None,
            network_interfaces: Default::default(),
            volumes: Default::default(),
            labels: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_label_digest_deterministic() {
        let a = spec_with_labels(&[("flow", "f"), ("task", "t")]);
        let b = spec_with_labels(&[("task", "t"), ("flow", "f")]);

        assert_eq!(a.label_digest(), b.label_digest());
        assert_eq!(a.label_digest().len(), 32);

        let c = spec_with_labels(&[("flow", "f"), ("task", "other")]);
        assert_ne!(a.label_digest(), c.label_digest());
    }

    #[test]
    fn test_staging_plan_paths() {
        let p = StagingPlan::new("bkt", true);

        assert!(p.work_dir.starts_with("/gantry/"));
        assert_eq!(p.prefix, p.work_dir.trim_start_matches('/'));
        assert_eq!(p.marker_key(), format!("{}/", p.prefix));
        assert_eq!(
            p.output_prefix().unwrap(),
            format!("{}/outputs", p.prefix)
        );
        assert_eq!(
            p.object_key("sub/data.txt"),
            format!("{}/sub/data.txt", p.prefix)
        );

        /*
         * Prefixes must never repeat across runs.
         */
        let q = StagingPlan::new("bkt", true);
        assert_ne!(p.prefix, q.prefix);

        let noout = StagingPlan::new("bkt", false);
        assert!(noout.output_dir.is_none());
        assert!(noout.output_prefix().is_none());
    }

    #[test]
    fn test_full_command() {
        let mut s = spec_with_labels(&[]);
        s.command = vec!["echo".into(), "ok".into()];
        assert_eq!(s.full_command(), vec!["echo", "ok"]);

        s.entrypoint = Some("/bin/sh".into());
        assert_eq!(s.full_command(), vec!["/bin/sh", "echo", "ok"]);
    }

    #[test]
    fn test_lifecycle_families() {
        use LifecycleState::*;

        let all = [
            Unsubmitted,
            Running,
            Succeeded,
            Failed,
            Canceled,
            DeletionInProgress,
            Unknown,
        ];

        for s in all {
            /*
             * Terminal states are exactly the union of the two families, and
             * the families never overlap.
             */
            assert_eq!(s.is_terminal(), s.is_failure() || s.is_success());
            assert!(!(s.is_failure() && s.is_success()));
        }

        assert!(Unknown.is_failure());
        assert!(!Unknown.is_success());
        assert!(DeletionInProgress.is_success());
    }
}
