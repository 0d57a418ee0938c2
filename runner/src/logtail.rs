/*
 * Copyright 2025 Oxide Computer Company
 */

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::prelude::*;
use gantry_common::sleep_ms;
use slog::{debug, error, info, o, warn, Logger};

/**
 * Severity of one tailed log line, in the shape bunyan-style records use.
 * Lines that do not parse as structured records get Default.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Default,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    /**
     * Error-family severities classify a line as stderr for counting
     * purposes.
     */
    pub fn is_error(&self) -> bool {
        matches!(self, Severity::Error | Severity::Fatal)
    }

    /**
     * Classify a log payload by its bunyan numeric level when it carries
     * one (fatal 60, error 50, warn 40, info 30, debug/trace below).
     */
    pub fn of_payload(msg: &str) -> Severity {
        let Ok(v) = serde_json::from_str::<serde_json::Value>(msg) else {
            return Severity::Default;
        };

        match v.get("level").and_then(|l| l.as_u64()) {
            Some(l) if l >= 60 => Severity::Fatal,
            Some(l) if l >= 50 => Severity::Error,
            Some(l) if l >= 40 => Severity::Warning,
            Some(l) if l >= 30 => Severity::Info,
            Some(_) => Severity::Debug,
            None => Severity::Default,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub message: String,
    pub severity: Severity,
}

/**
 * A stream of log entries scoped to exactly one job execution.  next()
 * resolves with the next entry, with None if the underlying query is
 * exhausted for good, or with an error if the stream breaks.
 */
pub trait LogSource: Send + 'static {
    fn next(
        &mut self,
    ) -> impl Future<Output = Result<Option<LogEntry>>> + Send;
}

/**
 * The tail worker: forwards every entry from a LogSource to the run's
 * logger, counting lines by classification, until the source ends or the
 * tail is closed.  A broken stream stops the forwarding but never fails
 * the run; job success is decided by the lifecycle controller, not by log
 * content.
 */
pub struct LogTail {
    task: tokio::task::JoinHandle<()>,
    stdout_lines: Arc<AtomicU64>,
    stderr_lines: Arc<AtomicU64>,
}

impl LogTail {
    pub fn start<L: LogSource>(log: &Logger, mut source: L) -> LogTail {
        let log = log.new(o!("component" => "logtail"));
        let stdout_lines = Arc::new(AtomicU64::new(0));
        let stderr_lines = Arc::new(AtomicU64::new(0));

        let task = tokio::task::spawn({
            let stdout_lines = Arc::clone(&stdout_lines);
            let stderr_lines = Arc::clone(&stderr_lines);

            async move {
                loop {
                    match source.next().await {
                        Ok(Some(entry)) => {
                            if entry.severity.is_error() {
                                stderr_lines.fetch_add(1, Ordering::Relaxed);
                                error!(log, "{}", entry.message;
                                    "stream" => "stderr");
                            } else {
                                stdout_lines.fetch_add(1, Ordering::Relaxed);
                                info!(log, "{}", entry.message;
                                    "stream" => "stdout");
                            }
                        }
                        Ok(None) => {
                            debug!(log, "log stream ended");
                            return;
                        }
                        Err(e) => {
                            warn!(log, "log stream error: {e:?}");
                            return;
                        }
                    }
                }
            }
        });

        LogTail { task, stdout_lines, stderr_lines }
    }

    /**
     * Stop the tail: wait out the grace period so entries still in flight
     * through the logging backend can arrive, then cancel the worker.
     * Returns the (stdout, stderr) line counts observed.
     */
    pub async fn close(self, grace: Duration) -> (u64, u64) {
        tokio::time::sleep(grace).await;

        self.task.abort();
        self.task.await.ok();

        (
            self.stdout_lines.load(Ordering::Relaxed),
            self.stderr_lines.load(Ordering::Relaxed),
        )
    }
}

/**
 * Log entries for one job, tailed from CloudWatch Logs.  The query is
 * scoped with a stream name prefix derived from the specific job or task,
 * never anything broader, so concurrent runs cannot interleave.
 *
 * CloudWatch has no push interface for filtered queries, so this source
 * repeats a filter-log-events query, deduplicating on event id, and dozes
 * between rounds that return nothing new.
 */
pub struct CwTail {
    logs: aws_sdk_cloudwatchlogs::Client,
    group: String,
    stream_prefix: String,
    start_time: i64,
    poll_ms: u64,
    next_token: Option<String>,
    seen: HashSet<String>,
    queue: VecDeque<LogEntry>,
}

impl CwTail {
    pub fn new(
        logs: aws_sdk_cloudwatchlogs::Client,
        group: &str,
        stream_prefix: &str,
    ) -> CwTail {
        CwTail {
            logs,
            group: group.to_string(),
            stream_prefix: stream_prefix.to_string(),
            start_time: Utc::now().timestamp_millis(),
            poll_ms: 1000,
            next_token: None,
            seen: HashSet::new(),
            queue: VecDeque::new(),
        }
    }
}

impl LogSource for CwTail {
    async fn next(&mut self) -> Result<Option<LogEntry>> {
        loop {
            if let Some(entry) = self.queue.pop_front() {
                return Ok(Some(entry));
            }

            let mut req = self
                .logs
                .filter_log_events()
                .log_group_name(&self.group)
                .log_stream_name_prefix(&self.stream_prefix)
                .start_time(self.start_time);
            if let Some(t) = &self.next_token {
                req = req.next_token(t);
            }

            let res = match req.send().await {
                Ok(res) => res,
                Err(e) => {
                    let se = e.into_service_error();
                    if se.is_resource_not_found_exception() {
                        /*
                         * The log group or stream does not exist yet; the
                         * job has likely not started writing.
                         */
                        sleep_ms(self.poll_ms).await;
                        continue;
                    }
                    return Err(se.into());
                }
            };

            for ev in res.events() {
                let Some(id) = ev.event_id() else {
                    continue;
                };
                if !self.seen.insert(id.to_string()) {
                    continue;
                }

                let ts = ev.timestamp().unwrap_or(0);
                if ts > self.start_time {
                    /*
                     * Advance the window, but keep re-reading the latest
                     * millisecond; the seen set covers the overlap.
                     */
                    self.start_time = ts;
                }

                let message =
                    ev.message().unwrap_or("").trim_end().to_string();
                let severity = Severity::of_payload(&message);

                self.queue.push_back(LogEntry {
                    time: Utc
                        .timestamp_millis_opt(ts)
                        .single()
                        .unwrap_or_else(Utc::now),
                    message,
                    severity,
                });
            }

            self.next_token = res.next_token().map(str::to_string);

            if self.queue.is_empty() && self.next_token.is_none() {
                /*
                 * Nothing new; doze before the next round.
                 */
                sleep_ms(self.poll_ms).await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::MockLogSource;

    fn testlog() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn entry(msg: &str, severity: Severity) -> LogEntry {
        LogEntry { time: Utc::now(), message: msg.to_string(), severity }
    }

    #[test]
    fn test_severity_classification() {
        let cases = vec![
            ("plain text line", Severity::Default),
            ("not json {", Severity::Default),
            (r#"{"msg":"hi"}"#, Severity::Default),
            (r#"{"level":10,"msg":"t"}"#, Severity::Debug),
            (r#"{"level":30,"msg":"i"}"#, Severity::Info),
            (r#"{"level":40,"msg":"w"}"#, Severity::Warning),
            (r#"{"level":50,"msg":"e"}"#, Severity::Error),
            (r#"{"level":60,"msg":"f"}"#, Severity::Fatal),
        ];

        for (msg, want) in cases {
            assert_eq!(Severity::of_payload(msg), want, "payload {:?}", msg);
        }

        assert!(Severity::Error.is_error());
        assert!(Severity::Fatal.is_error());
        assert!(!Severity::Warning.is_error());
        assert!(!Severity::Default.is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_counts_by_classification() {
        let src = MockLogSource::new(vec![
            entry("starting", Severity::Default),
            entry("progress", Severity::Info),
            entry("broken", Severity::Error),
            entry("done", Severity::Default),
            entry("on fire", Severity::Fatal),
        ]);

        let tail = LogTail::start(&testlog(), src);
        let (out, err) = tail.close(Duration::from_secs(5)).await;

        assert_eq!(out, 3);
        assert_eq!(err, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_survives_stream_error() {
        /*
         * A source that breaks mid-stream stops forwarding but still
         * reports what it saw before the break.
         */
        let src = MockLogSource::failing_after(vec![
            entry("one", Severity::Default),
            entry("two", Severity::Error),
        ]);

        let tail = LogTail::start(&testlog(), src);
        let (out, err) = tail.close(Duration::from_secs(1)).await;

        assert_eq!(out, 1);
        assert_eq!(err, 1);
    }
}
