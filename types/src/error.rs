/*
 * Copyright 2025 Oxide Computer Company
 */

use std::time::Duration;

use thiserror::Error;

/**
 * The ways a run can fail.  Log tail problems and best-effort deletions are
 * deliberately absent: those degrade observability or cleanup and are only
 * logged, never raised.
 */
#[derive(Debug, Error)]
pub enum RunError {
    /**
     * The caller's configuration cannot support the requested run.  Raised
     * before any remote call is made.
     */
    #[error("configuration error: {0}")]
    Configuration(String),

    /**
     * A single object storage transfer failed.  Transfers are not retried
     * in place; the recovery path is a re-run under a fresh prefix.
     */
    #[error("staging transfer failed for {bucket}:{key}")]
    Staging {
        bucket: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /**
     * The job reached a terminal state in the failure family.  This is the
     * primary "the command failed" signal, raised only after the log tail
     * has been flushed so the line counts are complete.
     */
    #[error(
        "remote job failed with status {native:?} (exit code {exit_code:?}, \
        {stdout_lines} stdout / {stderr_lines} stderr lines)"
    )]
    RemoteExecution {
        native: String,
        exit_code: Option<i32>,
        stdout_lines: u64,
        stderr_lines: u64,
    },

    /**
     * No terminal state was observed before the deadline.  The remote job
     * may well still be running; it is left for the cancellation handler or
     * a later resumption to reconcile.
     */
    #[error("timed out after {limit:?} waiting for the job to finish")]
    Timeout { limit: Duration },

    /**
     * A job service call failed outright: submission, a state query, or a
     * resumption lookup.
     */
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
