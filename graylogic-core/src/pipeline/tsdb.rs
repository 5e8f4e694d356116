//! Time-series batch writer (InfluxDB line protocol)
//!
//! Numeric and boolean state fields become `device_metrics` records, batched
//! in memory and flushed on an interval or when the batch fills. A write
//! failure drops the batch, fires the async `on_error` callback, and bumps a
//! counter; the inbound pipeline is never blocked by TSDB trouble.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::TsdbConfig;
use crate::error::{Error, Result};

/// Callback invoked (off the hot path) when a batch write fails
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Escape a measurement name: commas and spaces
fn escape_measurement(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            ',' => out.push_str("\\,"),
            ' ' => out.push_str("\\ "),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Escape a tag key or value: commas, equals, spaces, newlines, returns.
///
/// Newlines cannot be backslash-escaped in line protocol, so they are
/// rewritten to literal `\n`/`\r` sequences; the record stays a single line
/// no matter what the device id contains.
fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ',' => out.push_str("\\,"),
            '=' => out.push_str("\\="),
            ' ' => out.push_str("\\ "),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

const MEASUREMENT: &str = "device_metrics";

/// Render one record: `device_metrics,device_id=...,measurement=... value=N ts`
fn render_line(device_id: &str, field: &str, value: f64, timestamp_ns: i64) -> String {
    format!(
        "{},device_id={},measurement={} value={} {}",
        escape_measurement(MEASUREMENT),
        escape_tag(device_id),
        escape_tag(field),
        value,
        timestamp_ns
    )
}

/// Batching line-protocol writer
pub struct TsdbWriter {
    config: TsdbConfig,
    client: reqwest::Client,
    batch: Mutex<Vec<String>>,
    dropped: AtomicU64,
    on_error: Mutex<Option<ErrorCallback>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl TsdbWriter {
    #[must_use]
    pub fn new(config: TsdbConfig) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.write_timeout_secs))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            config,
            client,
            batch: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
            on_error: Mutex::new(None),
            flush_task: Mutex::new(None),
        })
    }

    /// Install the write-failure callback
    pub async fn set_on_error(&self, callback: ErrorCallback) {
        *self.on_error.lock().await = Some(callback);
    }

    /// Records dropped so far due to failed writes
    #[must_use]
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Start the interval flush loop
    pub async fn start(self: &Arc<Self>) {
        let writer = self.clone();
        let interval = Duration::from_secs(self.config.flush_interval_secs.max(1));
        *self.flush_task.lock().await = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                writer.flush().await;
            }
        }));
    }

    /// Stop the flush loop and push out whatever is pending
    pub async fn stop(&self) {
        if let Some(task) = self.flush_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        self.flush().await;
        tracing::info!(dropped = self.dropped_records(), "tsdb writer stopped");
    }

    /// Queue every numeric or boolean field of a state map
    pub async fn append_state(
        self: &Arc<Self>,
        device_id: &str,
        state: &serde_json::Map<String, serde_json::Value>,
    ) {
        let timestamp_ns = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let mut lines = Vec::new();
        for (field, value) in state {
            let numeric = match value {
                serde_json::Value::Bool(b) => Some(f64::from(u8::from(*b))),
                serde_json::Value::Number(n) => n.as_f64(),
                _ => None,
            };
            if let Some(numeric) = numeric {
                lines.push(render_line(device_id, field, numeric, timestamp_ns));
            }
        }
        if lines.is_empty() {
            return;
        }

        let should_flush = {
            let mut batch = self.batch.lock().await;
            batch.extend(lines);
            batch.len() >= self.config.batch_size
        };
        if should_flush {
            // Size-triggered flush runs off the inbound path
            let writer = self.clone();
            tokio::spawn(async move {
                writer.flush().await;
            });
        }
    }

    /// Post the pending batch; on failure the records are dropped and the
    /// callback and counter record the loss.
    pub async fn flush(&self) {
        let lines: Vec<String> = {
            let mut batch = self.batch.lock().await;
            std::mem::take(&mut *batch)
        };
        if lines.is_empty() {
            return;
        }
        let count = lines.len() as u64;
        let body = lines.join("\n");

        let result = self
            .client
            .post(format!("{}/write", self.config.url))
            .body(body)
            .send()
            .await;

        let error = match result {
            Ok(response) if response.status().is_success() => None,
            Ok(response) => Some(Error::WriteFailed(format!(
                "tsdb returned {}",
                response.status()
            ))),
            Err(e) => Some(Error::WriteFailed(format!("tsdb post: {e}"))),
        };

        if let Some(error) = error {
            self.dropped.fetch_add(count, Ordering::Relaxed);
            tracing::warn!(records = count, error = %error, "tsdb batch dropped");
            if let Some(callback) = self.on_error.lock().await.clone() {
                callback(&error);
            }
        } else {
            tracing::debug!(records = count, "tsdb batch flushed");
        }
    }

    /// Proxy a range query to the TSDB's Prometheus-compatible endpoint
    pub async fn query_range(
        &self,
        query: &str,
        start: &str,
        end: &str,
        step: &str,
    ) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}/api/v1/query_range", self.config.url))
            .timeout(Duration::from_secs(self.config.query_timeout_secs))
            .query(&[("query", query), ("start", start), ("end", end), ("step", step)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::WriteFailed(format!(
                "tsdb query returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Proxy an instant query
    pub async fn query(&self, query: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}/api/v1/query", self.config.url))
            .timeout(Duration::from_secs(self.config.query_timeout_secs))
            .query(&[("query", query)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::WriteFailed(format!(
                "tsdb query returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_covers_reserved_characters() {
        assert_eq!(escape_tag("plain"), "plain");
        assert_eq!(escape_tag("has space"), "has\\ space");
        assert_eq!(escape_tag("a,b"), "a\\,b");
        assert_eq!(escape_tag("a=b"), "a\\=b");
        assert_eq!(escape_tag("a\nb"), "a\\nb");
        assert_eq!(escape_tag("a\rb"), "a\\rb");
    }

    #[test]
    fn hostile_device_id_stays_one_record() {
        let line = render_line("evil device\nid,x=1 value=9", "on", 1.0, 42);
        // No raw newline survives: exactly one record
        assert_eq!(line.lines().count(), 1);
        assert!(line.starts_with("device_metrics,device_id=evil\\ device\\nid\\,x\\=1"));
    }

    #[test]
    fn line_format_matches_schema() {
        let line = render_line("light-living-01", "on", 1.0, 1_700_000_000_000_000_000);
        assert_eq!(
            line,
            "device_metrics,device_id=light-living-01,measurement=on value=1 1700000000000000000"
        );
    }

    #[test]
    fn measurement_escaping() {
        assert_eq!(escape_measurement("a b,c"), "a\\ b\\,c");
    }

    #[tokio::test]
    async fn append_filters_non_numeric_fields() {
        let writer = TsdbWriter::new(TsdbConfig::default());
        let mut state = serde_json::Map::new();
        state.insert("on".into(), serde_json::json!(true));
        state.insert("level".into(), serde_json::json!(75));
        state.insert("name".into(), serde_json::json!("not numeric"));
        state.insert("nested".into(), serde_json::json!({ "x": 1 }));

        writer.append_state("light-1", &state).await;
        let batch = writer.batch.lock().await;
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().any(|l| l.contains("measurement=on value=1")));
        assert!(batch.iter().any(|l| l.contains("measurement=level value=75")));
    }

    #[tokio::test]
    async fn failed_flush_drops_and_counts() {
        let mut config = TsdbConfig::default();
        // Nothing listens here
        config.url = "http://127.0.0.1:1".to_string();
        config.write_timeout_secs = 1;
        let writer = TsdbWriter::new(config);

        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();
        writer
            .set_on_error(Arc::new(move |error| {
                assert!(matches!(error, Error::WriteFailed(_)));
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let mut state = serde_json::Map::new();
        state.insert("on".into(), serde_json::json!(true));
        writer.append_state("light-1", &state).await;
        writer.flush().await;

        assert_eq!(writer.dropped_records(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Batch is empty afterwards; no double-count on recovery
        assert!(writer.batch.lock().await.is_empty());
    }
}
