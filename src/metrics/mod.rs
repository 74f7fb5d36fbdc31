//! Process-local metrics, queried by the monitoring collaborator.
//!
//! Call sites use the `incr!`/`count!`/`gauge_add!`/`time!` macros; values
//! accumulate in a global drain keyed by metric name and optional backend
//! name. Time metrics keep an hdrhistogram so percentiles survive
//! aggregation.

use std::{
    collections::BTreeMap,
    sync::OnceLock,
    time::Instant,
};

use hdrhistogram::Histogram;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Gauge(usize),
    GaugeAdd(i64),
    Count(i64),
    /// Milliseconds.
    Time(u64),
}

#[derive(thiserror::Error, Debug)]
pub enum MetricError {
    #[error("could not create histogram for {0}: {1}")]
    HistogramCreation(&'static str, String),
    #[error("incompatible update for metric {0}")]
    IncompatibleUpdate(&'static str),
}

#[derive(Debug, Clone)]
pub enum AggregatedMetric {
    Gauge(usize),
    Count(i64),
    Time(Histogram<u32>),
}

impl AggregatedMetric {
    fn new(key: &'static str, value: MetricValue) -> Result<AggregatedMetric, MetricError> {
        match value {
            MetricValue::Gauge(v) => Ok(AggregatedMetric::Gauge(v)),
            MetricValue::GaugeAdd(v) => Ok(AggregatedMetric::Gauge(v.max(0) as usize)),
            MetricValue::Count(v) => Ok(AggregatedMetric::Count(v)),
            MetricValue::Time(v) => {
                let mut histogram = Histogram::new(3)
                    .map_err(|e| MetricError::HistogramCreation(key, e.to_string()))?;
                let _ = histogram.record(v);
                Ok(AggregatedMetric::Time(histogram))
            }
        }
    }

    fn update(&mut self, key: &'static str, value: MetricValue) -> Result<(), MetricError> {
        match (self, value) {
            (AggregatedMetric::Gauge(current), MetricValue::Gauge(v)) => *current = v,
            (AggregatedMetric::Gauge(current), MetricValue::GaugeAdd(v)) => {
                *current = (*current as i64 + v).max(0) as usize;
            }
            (AggregatedMetric::Count(current), MetricValue::Count(v)) => *current += v,
            (AggregatedMetric::Time(histogram), MetricValue::Time(v)) => {
                if let Err(e) = histogram.record(v) {
                    error!("could not record time metric {key}: {e}");
                }
            }
            _ => return Err(MetricError::IncompatibleUpdate(key)),
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FilteredMetric {
    Gauge(usize),
    Count(i64),
    Percentiles {
        samples: u64,
        p_50: u64,
        p_99: u64,
        p_100: u64,
    },
}

#[derive(Default)]
struct MetricsMap {
    map: BTreeMap<&'static str, AggregatedMetric>,
}

impl MetricsMap {
    fn receive(&mut self, key: &'static str, value: MetricValue) {
        let result = match self.map.get_mut(key) {
            Some(existing) => existing.update(key, value),
            None => AggregatedMetric::new(key, value).map(|metric| {
                self.map.insert(key, metric);
            }),
        };
        if let Err(e) = result {
            error!("could not receive metric: {e}");
        }
    }

    fn filtered(&self) -> BTreeMap<String, FilteredMetric> {
        self.map
            .iter()
            .map(|(name, metric)| {
                let filtered = match metric {
                    AggregatedMetric::Gauge(v) => FilteredMetric::Gauge(*v),
                    AggregatedMetric::Count(v) => FilteredMetric::Count(*v),
                    AggregatedMetric::Time(hist) => FilteredMetric::Percentiles {
                        samples: hist.len(),
                        p_50: hist.value_at_percentile(50.0),
                        p_99: hist.value_at_percentile(99.0),
                        p_100: hist.value_at_percentile(100.0),
                    },
                };
                (name.to_string(), filtered)
            })
            .collect()
    }
}

/// Engine-wide metrics plus a map per backend.
#[derive(Default)]
pub struct LocalDrain {
    proxy: MetricsMap,
    backends: BTreeMap<String, MetricsMap>,
}

impl LocalDrain {
    pub fn receive_metric(
        &mut self,
        key: &'static str,
        backend: Option<&str>,
        value: MetricValue,
    ) {
        match backend {
            Some(backend) => match self.backends.get_mut(backend) {
                Some(map) => map.receive(key, value),
                None => {
                    let mut map = MetricsMap::default();
                    map.receive(key, value);
                    self.backends.insert(backend.to_string(), map);
                }
            },
            None => self.proxy.receive(key, value),
        }
    }

    pub fn dump_proxy_metrics(&self) -> BTreeMap<String, FilteredMetric> {
        self.proxy.filtered()
    }

    pub fn dump_backend_metrics(&self, backend: &str) -> BTreeMap<String, FilteredMetric> {
        self.backends
            .get(backend)
            .map(MetricsMap::filtered)
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.proxy = MetricsMap::default();
        self.backends.clear();
    }
}

static DRAIN: OnceLock<Mutex<LocalDrain>> = OnceLock::new();

fn drain() -> &'static Mutex<LocalDrain> {
    DRAIN.get_or_init(|| Mutex::new(LocalDrain::default()))
}

pub fn record(key: &'static str, backend: Option<&str>, value: MetricValue) {
    drain().lock().receive_metric(key, backend, value);
}

pub fn dump_proxy_metrics() -> BTreeMap<String, FilteredMetric> {
    drain().lock().dump_proxy_metrics()
}

pub fn dump_backend_metrics(backend: &str) -> BTreeMap<String, FilteredMetric> {
    drain().lock().dump_backend_metrics(backend)
}

pub fn clear() {
    drain().lock().clear()
}

/// Time an expression, recording the elapsed milliseconds.
pub fn time<T>(key: &'static str, backend: Option<&str>, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = f();
    record(
        key,
        backend,
        MetricValue::Time(start.elapsed().as_millis() as u64),
    );
    result
}

#[macro_export]
macro_rules! incr {
    ($key:expr) => {
        $crate::metrics::record($key, None, $crate::metrics::MetricValue::Count(1))
    };
    ($key:expr, $backend:expr) => {
        $crate::metrics::record($key, $backend, $crate::metrics::MetricValue::Count(1))
    };
}

#[macro_export]
macro_rules! count {
    ($key:expr, $value:expr) => {
        $crate::metrics::record(
            $key,
            None,
            $crate::metrics::MetricValue::Count($value as i64),
        )
    };
}

#[macro_export]
macro_rules! gauge_add {
    ($key:expr, $value:expr) => {
        $crate::metrics::record(
            $key,
            None,
            $crate::metrics::MetricValue::GaugeAdd($value as i64),
        )
    };
}

#[macro_export]
macro_rules! record_time {
    ($key:expr, $ms:expr) => {
        $crate::metrics::record($key, None, $crate::metrics::MetricValue::Time($ms as u64))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_aggregate_per_backend() {
        let mut drain = LocalDrain::default();
        drain.receive_metric("operations.completed", Some("ldap1"), MetricValue::Count(1));
        drain.receive_metric("operations.completed", Some("ldap1"), MetricValue::Count(1));
        drain.receive_metric("operations.completed", Some("ldap2"), MetricValue::Count(1));

        let ldap1 = drain.dump_backend_metrics("ldap1");
        assert_eq!(
            ldap1.get("operations.completed"),
            Some(&FilteredMetric::Count(2))
        );
        let ldap2 = drain.dump_backend_metrics("ldap2");
        assert_eq!(
            ldap2.get("operations.completed"),
            Some(&FilteredMetric::Count(1))
        );
    }

    #[test]
    fn gauges_saturate_at_zero() {
        let mut drain = LocalDrain::default();
        drain.receive_metric("clients.active", None, MetricValue::GaugeAdd(2));
        drain.receive_metric("clients.active", None, MetricValue::GaugeAdd(-5));
        assert_eq!(
            drain.dump_proxy_metrics().get("clients.active"),
            Some(&FilteredMetric::Gauge(0))
        );
    }

    #[test]
    fn time_metrics_expose_percentiles() {
        let mut drain = LocalDrain::default();
        for ms in [2u64, 4, 8, 1000] {
            drain.receive_metric("operation.duration", None, MetricValue::Time(ms));
        }
        match drain.dump_proxy_metrics().get("operation.duration") {
            Some(FilteredMetric::Percentiles { samples, p_100, .. }) => {
                assert_eq!(*samples, 4);
                assert!(*p_100 >= 1000);
            }
            other => panic!("unexpected metric {other:?}"),
        }
    }
}
