//! Job tracking helpers on top of a [`Client`].
//!
//! Progress and metadata become patches. Metric rows and log text are
//! buffered and sent once per second as `job.channelData` and `job.log`
//! actions; [`JobContext::shutdown`] sends whatever is left before the
//! client's terminal status goes out.

use crate::client::Client;
use crate::error::Result;
use crate::supervisor::JobOutcome;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Interval between buffer flushes.
const BUFFER_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Log channel of the main task's first instance.
const MAIN_LOG_CHANNEL: &str = "main_0";

#[derive(Debug, Default)]
struct Buffers {
    log: String,
    /// Rows per metric channel, in insertion order.
    metrics: BTreeMap<String, Vec<Value>>,
}

impl Buffers {
    fn take(&mut self) -> (String, BTreeMap<String, Vec<Value>>) {
        (
            std::mem::take(&mut self.log),
            std::mem::take(&mut self.metrics),
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn send_buffers(client: &Client, buffers: &Mutex<Buffers>) {
    let (log, metrics) = lock(buffers).take();
    for (name, rows) in metrics {
        client.job_action_detached("channelData", vec![Value::String(name), Value::Array(rows)]);
    }
    if !log.is_empty() {
        client.job_action_detached("log", vec![json!(MAIN_LOG_CHANNEL), Value::String(log)]);
    }
}

/// Convenience facade for reporting a job's progress.
pub struct JobContext {
    client: Client,
    buffers: Arc<Mutex<Buffers>>,
    defined_metrics: Mutex<HashSet<String>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl JobContext {
    pub fn new(client: Client) -> Self {
        let buffers = Arc::new(Mutex::new(Buffers::default()));

        let flusher = {
            let client = client.clone();
            let buffers = buffers.clone();
            client.runtime().clone().spawn(async move {
                let mut tick = tokio::time::interval(BUFFER_FLUSH_INTERVAL);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    send_buffers(&client, &buffers);
                }
            })
        };

        Self {
            client,
            buffers,
            defined_metrics: Mutex::new(HashSet::new()),
            flusher: Mutex::new(Some(flusher)),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// See [`Client::wait_for_connect`].
    pub async fn wait_for_connect(&self) -> bool {
        self.client.wait_for_connect().await
    }

    pub fn iteration(&self, current: u64, total: Option<u64>) {
        self.client.patch("iteration", current);
        if let Some(total) = total {
            self.client.patch("iterations", total);
        }
    }

    /// Alias of [`JobContext::iteration`].
    pub fn epoch(&self, current: u64, total: Option<u64>) {
        self.iteration(current, total);
    }

    pub fn step(&self, current: u64, total: Option<u64>) {
        self.client.patch("step", current);
        if let Some(total) = total {
            self.client.patch("steps", total);
        }
    }

    pub fn set_title(&self, title: &str) {
        self.client.patch("title", title);
    }

    pub fn set_info(&self, name: &str, value: impl Into<Value>) {
        self.client.patch(format!("infos.{}", name), value);
    }

    pub fn set_parameter(&self, name: &str, value: impl Into<Value>) {
        self.client.patch(format!("config.parameters.{}", name), value);
    }

    /// Declare a metric channel with display options.
    pub fn define_metric(&self, name: &str, options: Value) {
        lock(&self.defined_metrics).insert(name.to_string());
        self.client
            .job_action_detached("defineMetric", vec![json!(name), options]);
    }

    /// Append a data point. Undeclared metrics are declared with empty options.
    pub fn metric(&self, name: &str, x: f64, y: &[f64]) {
        let defined = lock(&self.defined_metrics).contains(name);
        if !defined {
            self.define_metric(name, json!({}));
        }

        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let mut row = vec![json!(x), json!(now)];
        row.extend(y.iter().map(|v| json!(v)));

        lock(&self.buffers)
            .metrics
            .entry(name.to_string())
            .or_default()
            .push(Value::Array(row));
        self.client
            .patch(format!("channels.{}.lastValue", name), json!(y));
    }

    /// Append text to the job log.
    pub fn log(&self, text: impl AsRef<str>) {
        lock(&self.buffers).log.push_str(text.as_ref());
    }

    /// Send buffered metric rows and log text now.
    pub fn flush(&self) {
        send_buffers(&self.client, &self.buffers);
    }

    /// Flush buffers, then shut the client down with `outcome`.
    pub async fn shutdown(&self, outcome: JobOutcome) -> Result<()> {
        if let Some(flusher) = lock(&self.flusher).take() {
            flusher.abort();
        }
        self.flush();
        self.client.shutdown(outcome).await
    }

    /// Blocking form of [`JobContext::shutdown`].
    pub fn shutdown_blocking(&self, outcome: JobOutcome) -> Result<()> {
        futures::executor::block_on(self.shutdown(outcome))
    }
}

impl Drop for JobContext {
    fn drop(&mut self) {
        // The flusher holds a client handle and would keep the worker alive
        if let Some(flusher) = lock(&self.flusher).take() {
            flusher.abort();
        }
    }
}
