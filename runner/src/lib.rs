/*
 * Copyright 2025 Oxide Computer Company
 */

/*
 * gantry-runner drives one containerized command on a remote job service,
 * using an object store as the intermediary filesystem: inputs are staged
 * under a fresh per-run prefix, the job is submitted (or an equivalent
 * running job is adopted), logs are tailed while we poll for a terminal
 * state, outputs are harvested, and the staged storage is deleted on every
 * exit path.
 */

pub mod backend;
mod cancel;
mod lifecycle;
mod logtail;
#[cfg(test)]
pub(crate) mod mock;
mod run;
mod store;

pub use cancel::Canceler;
pub use lifecycle::{await_terminal, JobEngine};
pub use logtail::{CwTail, LogEntry, LogSource, LogTail, Severity};
pub use run::{run, RunOptions};
pub use store::{
    delete_prefix, download_outputs, upload_inputs, ObjectStore, S3Store,
};
