//! Common types for metrics definitions.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

/// Registers the description of every metric with the installed recorder.
///
/// Must be called after the global recorder is set, otherwise the
/// descriptions are dropped by the no-op recorder.
pub fn describe_all(defs: &[MetricDef]) {
    for def in defs {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
}

#[macro_export]
macro_rules! counter {
    ($def:expr) => {
        metrics::counter!($def.name)
    };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        metrics::counter!($def.name, $($label => $value),+)
    };
}

#[macro_export]
macro_rules! gauge {
    ($def:expr) => {
        metrics::gauge!($def.name)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr) => {
        metrics::histogram!($def.name)
    };
    ($def:expr, $($label:expr => $value:expr),+ $(,)?) => {
        metrics::histogram!($def.name, $($label => $value),+)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_COUNTER: MetricDef = MetricDef {
        name: "test.counter",
        metric_type: MetricType::Counter,
        description: "A counter used in tests",
    };

    #[test]
    fn test_metric_type_names() {
        assert_eq!(MetricType::Counter.as_str(), "Counter");
        assert_eq!(MetricType::Gauge.as_str(), "Gauge");
        assert_eq!(MetricType::Histogram.as_str(), "Histogram");
    }

    #[test]
    fn test_macros_without_recorder() {
        // No recorder installed, the handles are no-ops.
        describe_all(&[TEST_COUNTER]);
        counter!(TEST_COUNTER).increment(1);
        counter!(TEST_COUNTER, "outcome" => "ok").increment(1);
    }
}
