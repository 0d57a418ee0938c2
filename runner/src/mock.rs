/*
 * Copyright 2025 Oxide Computer Company
 */

/*
 * In-memory stand-ins for the object store, the job engine, and the log
 * source, with call counters so tests can assert not just on outcomes but
 * on which remote calls were (or were not) made.
 */

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use chrono::Utc;
use gantry_types::{JobHandle, JobSpec, JobState, LifecycleState};
use slog::Logger;

use crate::lifecycle::JobEngine;
use crate::logtail::{LogEntry, LogSource, Severity};
use crate::store::ObjectStore;

pub(crate) fn log_entry(msg: &str, severity: Severity) -> LogEntry {
    LogEntry { time: Utc::now(), message: msg.to_string(), severity }
}

#[derive(Default)]
struct MockStoreInner {
    objects: Mutex<BTreeMap<(String, String), Bytes>>,
    puts: AtomicU64,
    gets: AtomicU64,
    lists: AtomicU64,
    deletes: AtomicU64,
}

#[derive(Clone, Default)]
pub(crate) struct MockStore {
    inner: Arc<MockStoreInner>,
}

impl MockStore {
    pub fn seed(&self, bucket: &str, key: &str, data: &[u8]) {
        self.inner.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            Bytes::copy_from_slice(data),
        );
    }

    pub fn get_object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /**
     * The first object in the bucket whose key ends with the given
     * suffix.
     */
    pub fn find_object(
        &self,
        bucket: &str,
        suffix: &str,
    ) -> Option<(String, Bytes)> {
        self.inner
            .objects
            .lock()
            .unwrap()
            .iter()
            .find(|((b, k), _)| b == bucket && k.ends_with(suffix))
            .map(|((_, k), v)| (k.to_string(), v.clone()))
    }

    pub fn object_count(&self, bucket: &str, prefix: &str) -> usize {
        self.inner
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .count()
    }

    pub fn puts(&self) -> u64 {
        self.inner.puts.load(Ordering::Relaxed)
    }

    pub fn lists(&self) -> u64 {
        self.inner.lists.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.inner.deletes.load(Ordering::Relaxed)
    }
}

impl ObjectStore for MockStore {
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.inner.puts.fetch_add(1, Ordering::Relaxed);
        self.inner
            .objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.inner.gets.fetch_add(1, Ordering::Relaxed);
        self.get_object(bucket, key)
            .ok_or_else(|| anyhow!("no such object {bucket}:{key}"))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.inner.lists.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .inner
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.to_string())
            .collect())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        self.inner.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .inner
            .objects
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), key.to_string()))
            .is_some())
    }
}

type TerminalHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct MockEngineInner {
    states: Mutex<VecDeque<JobState>>,
    existing: Mutex<Option<(JobHandle, JobState)>>,
    logs: Mutex<Vec<LogEntry>>,
    on_terminal: Mutex<Option<TerminalHook>>,
    creates: AtomicU64,
    finds: AtomicU64,
    state_calls: AtomicU64,
    cancels: AtomicU64,
    deletes: AtomicU64,
}

#[derive(Clone, Default)]
pub(crate) struct MockEngine {
    inner: Arc<MockEngineInner>,
}

impl MockEngine {
    /**
     * Script the sequence of states the engine reports.  The final entry
     * is sticky: once reached it is reported forever.
     */
    pub fn script_states(&self, states: Vec<JobState>) {
        *self.inner.states.lock().unwrap() = states.into();
    }

    pub fn script_logs(&self, entries: Vec<LogEntry>) {
        *self.inner.logs.lock().unwrap() = entries;
    }

    pub fn set_existing(&self, handle: JobHandle, state: JobState) {
        *self.inner.existing.lock().unwrap() = Some((handle, state));
    }

    /**
     * Run the given hook the first time a terminal state is reported,
     * before the caller sees it; used to emulate side effects of the
     * remote command, such as objects it wrote.
     */
    pub fn on_terminal<F: FnOnce() + Send + 'static>(&self, hook: F) {
        *self.inner.on_terminal.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn creates(&self) -> u64 {
        self.inner.creates.load(Ordering::Relaxed)
    }

    pub fn finds(&self) -> u64 {
        self.inner.finds.load(Ordering::Relaxed)
    }

    pub fn state_calls(&self) -> u64 {
        self.inner.state_calls.load(Ordering::Relaxed)
    }

    pub fn cancels(&self) -> u64 {
        self.inner.cancels.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.inner.deletes.load(Ordering::Relaxed)
    }
}

impl JobEngine for MockEngine {
    type Logs = MockLogSource;

    async fn create(&self, _log: &Logger, spec: &JobSpec) -> Result<JobHandle> {
        let n = self.inner.creates.fetch_add(1, Ordering::Relaxed);
        Ok(JobHandle {
            job: format!("mock-{}-{}", spec.name, n),
            execution: None,
        })
    }

    async fn find(
        &self,
        _log: &Logger,
        _spec: &JobSpec,
    ) -> Result<Option<(JobHandle, JobState)>> {
        self.inner.finds.fetch_add(1, Ordering::Relaxed);
        Ok(self.inner.existing.lock().unwrap().clone())
    }

    async fn state(&self, _handle: &JobHandle) -> Result<JobState> {
        self.inner.state_calls.fetch_add(1, Ordering::Relaxed);

        let st = {
            let mut q = self.inner.states.lock().unwrap();
            if q.len() > 1 {
                q.pop_front().unwrap()
            } else if let Some(last) = q.front() {
                last.clone()
            } else {
                JobState::new(LifecycleState::Unknown, "(unscripted)")
            }
        };

        if st.state.is_terminal() {
            if let Some(hook) = self.inner.on_terminal.lock().unwrap().take()
            {
                hook();
            }
        }

        Ok(st)
    }

    async fn cancel(&self, _log: &Logger, _handle: &JobHandle) -> Result<()> {
        self.inner.cancels.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, _log: &Logger, _handle: &JobHandle) -> Result<()> {
        self.inner.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn open_logs(&self, _handle: &JobHandle) -> Result<MockLogSource> {
        Ok(MockLogSource::new(self.inner.logs.lock().unwrap().clone()))
    }
}

pub(crate) struct MockLogSource {
    entries: VecDeque<LogEntry>,
    fail_at_end: bool,
}

impl MockLogSource {
    pub fn new(entries: Vec<LogEntry>) -> MockLogSource {
        MockLogSource { entries: entries.into(), fail_at_end: false }
    }

    /**
     * A source that yields its entries and then breaks, emulating a
     * transport failure mid-stream.
     */
    pub fn failing_after(entries: Vec<LogEntry>) -> MockLogSource {
        MockLogSource { entries: entries.into(), fail_at_end: true }
    }
}

impl LogSource for MockLogSource {
    async fn next(&mut self) -> Result<Option<LogEntry>> {
        match self.entries.pop_front() {
            Some(e) => Ok(Some(e)),
            None if self.fail_at_end => {
                Err(anyhow!("log stream reset by peer"))
            }
            None => Ok(None),
        }
    }
}
