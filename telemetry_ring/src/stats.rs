//! Online statistics over assembled records.

use crate::record::Object;
use crate::sink::Sink;
use serde::Serialize;

/// Running count, total, extrema, mean and standard deviation of a stream
/// of samples, updated in O(1) per sample (Welford).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatStream {
    count: u64,
    total: f64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
}

impl Default for StatStream {
    fn default() -> Self {
        Self {
            count: 0,
            total: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            m2: 0.0,
        }
    }
}

impl StatStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sample: f64) {
        self.count += 1;
        self.total += sample;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (sample - self.mean);
    }

    /// Folds `other` in as if its samples had been fed to `self`.
    pub fn merge(&mut self, other: &StatStream) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        let (a, b) = (self.count as f64, other.count as f64);
        self.mean += delta * b / count as f64;
        self.m2 += other.m2 + delta * delta * a * b / count as f64;
        self.count = count;
        self.total += other.total;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn avg(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation, 0 for fewer than two samples.
    pub fn sd(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / self.count as f64).sqrt()
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }
}

type ReportFn = Box<dyn FnOnce(&StatStream) + Send>;

/// Throughput meter over `{name, time, <count>}` records.
///
/// Keeps the records whose `name` matches, pairs each with the previous one
/// and feeds `count / elapsed_seconds` (count taken from the earlier record,
/// `time` in nanoseconds) into a [`StatStream`]. The stream is handed to the
/// report callback when the sink completes.
pub struct RateMeter {
    name: String,
    count_field: String,
    previous: Option<(f64, f64)>,
    rates: StatStream,
    report: Option<ReportFn>,
}

impl RateMeter {
    pub fn new(name: impl Into<String>, count_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count_field: count_field.into(),
            previous: None,
            rates: StatStream::new(),
            report: None,
        }
    }

    pub fn on_complete(mut self, report: impl FnOnce(&StatStream) + Send + 'static) -> Self {
        self.report = Some(Box::new(report));
        self
    }

    pub fn rates(&self) -> &StatStream {
        &self.rates
    }

    fn sample(&self, object: &Object) -> Option<(f64, f64)> {
        if object.get("name")?.as_str()? != self.name {
            return None;
        }
        let time = object.get("time")?.as_f64()?;
        let count = object.get(&self.count_field)?.as_f64()?;
        Some((time, count))
    }
}

impl Sink for RateMeter {
    fn push(&mut self, object: &Object) -> anyhow::Result<()> {
        let Some((time, count)) = self.sample(object) else {
            return Ok(());
        };
        if let Some((start, batch)) = self.previous.replace((time, count)) {
            let elapsed = (time - start) * 1e-9;
            if elapsed > 0.0 {
                let rate = batch / elapsed;
                log::debug!("{} rate={:.4} elapsed={:.6}s", self.name, rate, elapsed);
                self.rates.update(rate);
            } else {
                log::debug!("{} skipped pair with non-positive elapsed time", self.name);
            }
        }
        Ok(())
    }

    fn complete(&mut self) -> anyhow::Result<()> {
        if let Some(report) = self.report.take() {
            report(&self.rates);
        }
        Ok(())
    }
}
