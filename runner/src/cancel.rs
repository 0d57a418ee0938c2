/*
 * Copyright 2025 Oxide Computer Company
 */

use std::sync::OnceLock;

use gantry_types::JobHandle;
use slog::{info, o, warn, Logger};

use crate::lifecycle::JobEngine;

/**
 * The kill path for one run.  Constructed with its own engine (and thus
 * its own client session), because the shared session belongs to the run
 * path and may already be winding down when an external kill arrives.
 * Armed with the job handle as soon as one exists.
 */
pub struct Canceler<E: JobEngine> {
    log: Logger,
    engine: E,
    handle: OnceLock<JobHandle>,
}

impl<E: JobEngine> Canceler<E> {
    pub fn new(log: &Logger, engine: E) -> Canceler<E> {
        Canceler {
            log: log.new(o!("component" => "canceler")),
            engine,
            handle: OnceLock::new(),
        }
    }

    pub fn arm(&self, handle: JobHandle) {
        self.handle.set(handle).ok();
    }

    /**
     * Invoked on an external kill signal.  Re-queries the job state and
     * only issues a cancel when the job has not already terminated; for a
     * terminal job there is nothing to stop, and cleanup belongs to the
     * run path.  Outcomes are logged, never raised: this can race the run
     * path's own teardown, and both sides are idempotent against a job
     * that is already gone.
     */
    pub async fn fire(&self) {
        let Some(handle) = self.handle.get() else {
            info!(self.log, "kill before submission; nothing to cancel");
            return;
        };

        match self.engine.state(handle).await {
            Ok(st) if st.state.is_terminal() => {
                info!(
                    self.log,
                    "job {} already terminal; not cancelling", handle.job;
                    "native" => &st.native,
                );
            }
            Ok(st) => {
                info!(self.log, "cancelling job {}", handle.job;
                    "native" => &st.native);
                match self.engine.cancel(&self.log, handle).await {
                    Ok(()) => {
                        info!(self.log, "cancel requested for {}", handle.job);
                    }
                    Err(e) => {
                        warn!(self.log, "cancel of {} failed: {e:?}",
                            handle.job);
                    }
                }
            }
            Err(e) => {
                warn!(
                    self.log,
                    "state query failed during cancel of {}: {e:?}",
                    handle.job,
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::MockEngine;
    use gantry_types::{JobState, LifecycleState};

    fn testlog() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn test_fire_unarmed_is_a_noop() {
        let eng = MockEngine::default();
        let c = Canceler::new(&testlog(), eng.clone());

        c.fire().await;

        assert_eq!(eng.state_calls(), 0);
        assert_eq!(eng.cancels(), 0);
    }

    #[tokio::test]
    async fn test_fire_skips_terminal_job() {
        let eng = MockEngine::default();
        eng.script_states(vec![JobState::new(
            LifecycleState::Succeeded,
            "SUCCEEDED",
        )]);

        let c = Canceler::new(&testlog(), eng.clone());
        c.arm(JobHandle { job: "j".into(), execution: None });

        /*
         * The job already succeeded: no cancel may be issued, even if
         * fire() races a main path that is also about to delete it.
         */
        c.fire().await;

        assert_eq!(eng.cancels(), 0);
    }

    #[tokio::test]
    async fn test_fire_cancels_running_job() {
        let eng = MockEngine::default();
        eng.script_states(vec![JobState::new(
            LifecycleState::Running,
            "RUNNING",
        )]);

        let c = Canceler::new(&testlog(), eng.clone());
        c.arm(JobHandle { job: "j".into(), execution: None });

        c.fire().await;

        assert_eq!(eng.cancels(), 1);
    }
}
