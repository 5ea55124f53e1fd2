use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// A label set is a sorted list of key=value pairs, distinguishing series
/// within a metric family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Format as `{key="value",key2="value2"}` for the text exposition.
    fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Counter/gauge registry with Prometheus text exposition.
///
/// Constructed once at startup and handed to the components that record
/// into it; there is deliberately no process-global instance, so tests get
/// isolated collectors.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<(String, Labels), AtomicI64>>,
    /// f64 gauges stored as bit patterns so atomics suffice.
    float_gauges: RwLock<AHashMap<(String, Labels), AtomicU64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.counters.read().expect("metrics lock poisoned");
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().expect("metrics lock poisoned");
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        let map = self.counters.read().expect("metrics lock poisoned");
        map.get(&key).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.gauges.read().expect("metrics lock poisoned");
            if let Some(g) = map.get(&key) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.gauges.write().expect("metrics lock poisoned");
        map.entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = (name.to_string(), Labels::new(labels));
        let map = self.gauges.read().expect("metrics lock poisoned");
        map.get(&key).map(|g| g.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Drop every series of a gauge family. Used before re-deriving labeled
    /// gauges at scrape time so stale label sets do not linger.
    pub fn clear_gauge_family(&self, name: &str) {
        let mut map = self.gauges.write().expect("metrics lock poisoned");
        map.retain(|(n, _), _| n != name);
    }

    // -- Float gauges -------------------------------------------------------

    pub fn set_gauge_f64(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.float_gauges.read().expect("metrics lock poisoned");
            if let Some(g) = map.get(&key) {
                g.store(value.to_bits(), Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.float_gauges.write().expect("metrics lock poisoned");
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get_gauge_f64(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = (name.to_string(), Labels::new(labels));
        let map = self.float_gauges.read().expect("metrics lock poisoned");
        map.get(&key)
            .map(|g| f64::from_bits(g.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    // -- Export --------------------------------------------------------------

    /// Export all metrics in Prometheus text exposition format. Families are
    /// sorted by name; series within a family by label string.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read().expect("metrics lock poisoned");
            let mut grouped: AHashMap<&str, Vec<(String, u64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped
                    .entry(name.as_str())
                    .or_default()
                    .push((labels.prometheus_str(), val.load(Ordering::Relaxed)));
            }
            let mut names: Vec<&&str> = grouped.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("# TYPE {} counter\n", name));
                let mut entries = grouped[*name].clone();
                entries.sort();
                for (labels, value) in entries {
                    out.push_str(&format!("{}{} {}\n", name, labels, value));
                }
            }
        }

        {
            let map = self.gauges.read().expect("metrics lock poisoned");
            let mut grouped: AHashMap<&str, Vec<(String, i64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped
                    .entry(name.as_str())
                    .or_default()
                    .push((labels.prometheus_str(), val.load(Ordering::Relaxed)));
            }
            let mut names: Vec<&&str> = grouped.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("# TYPE {} gauge\n", name));
                let mut entries = grouped[*name].clone();
                entries.sort();
                for (labels, value) in entries {
                    out.push_str(&format!("{}{} {}\n", name, labels, value));
                }
            }
        }

        {
            let map = self.float_gauges.read().expect("metrics lock poisoned");
            let mut grouped: AHashMap<&str, Vec<(String, f64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped.entry(name.as_str()).or_default().push((
                    labels.prometheus_str(),
                    f64::from_bits(val.load(Ordering::Relaxed)),
                ));
            }
            let mut names: Vec<&&str> = grouped.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("# TYPE {} gauge\n", name));
                let mut entries = grouped[*name].clone();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                for (labels, value) in entries {
                    out.push_str(&format!("{}{} {}\n", name, labels, value));
                }
            }
        }

        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
