// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use log::info;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;
use metrics::Key;
use metrics::KeyName;
use metrics::Metadata;
use metrics::Recorder;
use metrics::SharedString;
use metrics::Unit;
use metrics_util::registry::AtomicStorage;
use metrics_util::registry::Registry;

use crate::crew::sleep_unless_shutdown;

/// Builds a [`LogRecorder`] and installs it as the global metrics recorder.
///
/// ```rust,ignore
/// LogRecorderBuilder::new()
///     .with_reporting_interval(Duration::from_secs(3))
///     .with_shutdown(shutdown.clone())
///     .install()?;
/// ```
pub struct LogRecorderBuilder {
    reporting_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl LogRecorderBuilder {
    pub fn new() -> LogRecorderBuilder {
        Self {
            reporting_interval: Duration::from_secs(3),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_reporting_interval(mut self, interval: Duration) -> Self {
        self.reporting_interval = interval;
        self
    }

    /// Stop reporting once `shutdown` is set.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn install(self) -> Result<()> {
        let recorder = LogRecorder {
            registry: Arc::new(Registry::<Key, AtomicStorage>::atomic()),
        };
        recorder.start(self.reporting_interval, self.shutdown)?;
        metrics::set_global_recorder(recorder)
            .context("Failed to install the log recorder")?;
        Ok(())
    }
}

impl Default for LogRecorderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A metrics recorder that periodically logs every metric it holds.
struct LogRecorder {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl Recorder for LogRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry
            .get_or_create_counter(key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |g| g.clone().into())
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.registry
            .get_or_create_histogram(key, |h: &Arc<metrics_util::AtomicBucket<f64>>| {
                h.clone().into()
            })
    }
}

impl LogRecorder {
    fn start(&self, reporting_interval: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
        let registry = self.registry.clone();

        thread::Builder::new()
            .name("log-recorder".to_string())
            .spawn(move || {
                let mut prev_counter_values: HashMap<Key, u64> = HashMap::new();
                let mut prev_instant = Instant::now();

                while sleep_unless_shutdown(&shutdown, reporting_interval) {
                    let period_secs = prev_instant.elapsed().as_secs_f64();
                    prev_instant = Instant::now();

                    for line in counter_lines(&registry, &mut prev_counter_values, period_secs) {
                        info!("{}", line);
                    }
                    for line in gauge_lines(&registry) {
                        info!("{}", line);
                    }
                    for line in histogram_lines(&registry) {
                        info!("{}", line);
                    }
                    info!("---");
                }
            })
            .context("Failed to spawn the log recorder")?;
        Ok(())
    }
}

fn label_suffix(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|l| format!("{}={}", l.key(), l.value()))
        .collect();
    if labels.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", labels.join(","))
    }
}

fn group_keys_by_name(keys: Vec<Key>) -> HashMap<String, Vec<Key>> {
    let mut grouped_keys: HashMap<String, Vec<Key>> = HashMap::new();
    for key in keys {
        grouped_keys
            .entry(key.name().to_string())
            .or_default()
            .push(key);
    }
    grouped_keys
}

fn counter_lines(
    registry: &Registry<Key, AtomicStorage>,
    prev_counter_values: &mut HashMap<Key, u64>,
    period_secs: f64,
) -> Vec<String> {
    let handles = registry.get_counter_handles();
    let grouped_keys = group_keys_by_name(handles.keys().cloned().collect());

    let mut totals: Vec<(String, u64, Vec<(Key, u64)>)> = grouped_keys
        .into_iter()
        .map(|(name, keys)| {
            let values: Vec<(Key, u64)> = keys
                .into_iter()
                .filter_map(|key| {
                    let value = handles.get(&key)?.load(Relaxed);
                    Some((key, value))
                })
                .collect();
            let total = values.iter().map(|(_, v)| *v).sum();
            (name, total, values)
        })
        .collect();

    // Largest first, then by name.
    totals.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let rate = |key: &Key, value: u64, prev: &HashMap<Key, u64>| -> f64 {
        let prev = prev.get(key).cloned().unwrap_or(0);
        if period_secs > 0.0 {
            value.saturating_sub(prev) as f64 / period_secs
        } else {
            0.0
        }
    };

    let mut lines = vec![];
    if !totals.is_empty() {
        lines.push("Counters:".to_string());
    }
    for (name, total, mut values) in totals {
        let total_rate: f64 = values
            .iter()
            .map(|(k, v)| rate(k, *v, prev_counter_values))
            .sum();
        lines.push(format!("  {}: {} [{:.1}/s]", name, total, total_rate));

        if values.len() > 1 || values.iter().any(|(k, _)| k.labels().next().is_some()) {
            values.sort_by(|a, b| b.1.cmp(&a.1));
            for (key, value) in values.iter() {
                let pct = if total == 0 {
                    0.0
                } else {
                    (*value as f64 / total as f64) * 100.0
                };
                lines.push(format!(
                    "    {}: {} ({:.1}%) [{:.1}/s]",
                    label_suffix(key),
                    value,
                    pct,
                    rate(key, *value, prev_counter_values)
                ));
            }
        }
        for (key, value) in values {
            prev_counter_values.insert(key, value);
        }
    }
    lines
}

fn gauge_lines(registry: &Registry<Key, AtomicStorage>) -> Vec<String> {
    let handles = registry.get_gauge_handles();
    let mut keys: Vec<&Key> = handles.keys().collect();
    keys.sort();

    let mut lines = vec![];
    if !keys.is_empty() {
        lines.push("Gauges:".to_string());
    }
    for key in keys {
        if let Some(gauge) = handles.get(key) {
            // Gauges are stored as f64 bits.
            let value = f64::from_bits(gauge.load(Relaxed));
            lines.push(format!("  {}{}: {:.2}", key.name(), label_suffix(key), value));
        }
    }
    lines
}

fn histogram_lines(registry: &Registry<Key, AtomicStorage>) -> Vec<String> {
    let handles = registry.get_histogram_handles();
    let mut keys: Vec<&Key> = handles.keys().collect();
    keys.sort();

    let mut lines = vec![];
    if !keys.is_empty() {
        lines.push("Histograms:".to_string());
    }
    for key in keys {
        let histogram = match handles.get(key) {
            Some(h) => h,
            None => continue,
        };
        let mut sum = 0.0;
        let mut count = 0u64;
        let mut max = f64::MIN;
        histogram.clear_with(|values| {
            for v in values {
                sum += *v;
                count += 1;
                max = max.max(*v);
            }
        });
        if count == 0 {
            lines.push(format!("  {}: no samples", key.name()));
        } else {
            lines.push(format!(
                "  {}: avg={:.2} max={:.2} count={}",
                key.name(),
                sum / count as f64,
                max,
                count
            ));
        }
    }
    lines
}
