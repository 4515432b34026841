//! Test doubles shared by the pipeline tests

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use trafficlog_core::{
    ActivityEvent, BackendKind, ConnectionTarget, DbStats, InsertOutcome, PassThrough,
    RequestDescriptor, Result, Sanitizer, StatsQueries, StorageBackend, StorageError,
    collect_stats,
};

/// Request-only event whose target URL doubles as its identity
pub fn event(url: &str) -> ActivityEvent {
    let request = RequestDescriptor {
        url: url.to_string(),
        method: "GET".to_string(),
        http_version: "HTTP/1.1".to_string(),
        headers: vec![("Host".to_string(), "example.com".to_string())],
        raw: format!("GET {} HTTP/1.1\r\nHost: example.com\r\n\r\n", url).into_bytes(),
        body: Vec::new(),
        content_type: None,
    };
    let sent = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    ActivityEvent::capture_at("127.0.0.1", &request, None, "Proxy", Some(sent), sent)
}

/// In-memory backend that records every call it receives
pub struct RecordingBackend {
    batches: Mutex<Vec<Vec<ActivityEvent>>>,
    failures_left: AtomicUsize,
    insert_delay: Mutex<Duration>,
    connect_calls: AtomicUsize,
    reconnect_calls: AtomicUsize,
    close_calls: AtomicUsize,
    stats_queries: Mutex<Vec<&'static str>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(0),
            insert_delay: Mutex::new(Duration::ZERO),
            connect_calls: AtomicUsize::new(0),
            reconnect_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            stats_queries: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `n` inserts fail without storing anything
    pub fn fail_next_inserts(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn set_insert_delay(&self, delay: Duration) {
        *self.insert_delay.lock().unwrap() = delay;
    }

    /// Target URLs of every committed batch, in commit order
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|batch| batch.iter().map(|e| e.target_url.clone()).collect())
            .collect()
    }

    pub fn stored(&self) -> Vec<ActivityEvent> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn reconnect_calls(&self) -> usize {
        self.reconnect_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Names of the statistics queries issued so far
    pub fn stats_queries(&self) -> Vec<&'static str> {
        self.stats_queries.lock().unwrap().clone()
    }
}

struct RecordingQueries<'a> {
    events: Vec<ActivityEvent>,
    log: &'a Mutex<Vec<&'static str>>,
}

impl RecordingQueries<'_> {
    fn note(&self, name: &'static str) {
        self.log.lock().unwrap().push(name);
    }
}

#[async_trait]
impl StatsQueries for RecordingQueries<'_> {
    async fn record_count(&mut self) -> Result<u64> {
        self.note("count");
        Ok(self.events.len() as u64)
    }

    async fn total_request_size(&mut self) -> Result<u64> {
        self.note("sum");
        Ok(self.events.iter().map(|e| e.request_size).sum())
    }

    async fn biggest_request_size(&mut self) -> Result<u64> {
        self.note("max");
        Ok(self.events.iter().map(|e| e.request_size).max().unwrap_or(0))
    }

    async fn max_hits_by_second(&mut self) -> Result<u64> {
        self.note("hits");
        let mut buckets = std::collections::HashMap::new();
        for event in &self.events {
            *buckets.entry(event.send_datetime.timestamp()).or_insert(0u64) += 1;
        }
        Ok(buckets.into_values().max().unwrap_or(0))
    }
}

#[async_trait]
impl StorageBackend for RecordingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn describe(&self) -> String {
        "recording sqlite".to_string()
    }

    fn sanitizer(&self) -> &'static dyn Sanitizer {
        &PassThrough
    }

    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_batch(&self, events: &[ActivityEvent]) -> Result<InsertOutcome> {
        let delay = *self.insert_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Write("injected failure".to_string()));
        }

        self.batches.lock().unwrap().push(events.to_vec());
        Ok(InsertOutcome {
            submitted: events.len(),
            accepted: events.len() as u64,
        })
    }

    async fn query_stats(&self) -> Result<DbStats> {
        let mut queries = RecordingQueries {
            events: self.stored(),
            log: &self.stats_queries,
        };
        collect_stats(&mut queries).await
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reconfigure(&self, _target: ConnectionTarget) -> Result<()> {
        self.connect().await
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}
