//! Metric records and Prometheus text exposition rendering.

use std::collections::HashMap;
use std::fmt::Write;

/// Prometheus metric type written in the `# TYPE` comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Gauge,
    Counter,
}

impl MetricType {
    /// Get the TYPE comment string for Prometheus exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
        }
    }
}

/// A single sample produced by a scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Metric family name.
    pub name: String,
    /// Sample value.
    pub value: f64,
    /// Label pairs, rendered in insertion order.
    pub labels: Vec<(String, String)>,
    /// Text for the `# HELP` comment.
    pub help: String,
    /// Metric type.
    pub metric_type: MetricType,
}

impl Metric {
    /// Create a gauge sample without labels.
    pub fn gauge(name: impl Into<String>, value: f64, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            labels: Vec::new(),
            help: help.into(),
            metric_type: MetricType::Gauge,
        }
    }

    /// Create a counter sample without labels.
    pub fn counter(name: impl Into<String>, value: u64, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value as f64,
            labels: Vec::new(),
            help: help.into(),
            metric_type: MetricType::Counter,
        }
    }

    /// Add a label to this sample.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    /// Look up a label value by name.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Format labels for Prometheus exposition format.
    pub fn format_labels(&self) -> String {
        if self.labels.is_empty() {
            return String::new();
        }

        let parts: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
            .collect();

        format!("{{{}}}", parts.join(","))
    }
}

/// Render metrics in Prometheus exposition format.
///
/// Samples are grouped into families by sanitized name, in order of first
/// appearance. Each family gets one `# HELP` and one `# TYPE` line taken from
/// its first sample.
pub fn render(metrics: &[Metric]) -> String {
    let mut families: Vec<(String, Vec<&Metric>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for metric in metrics {
        let name = sanitize_metric_name(&metric.name);
        match index.get(&name) {
            Some(&i) => families[i].1.push(metric),
            None => {
                index.insert(name.clone(), families.len());
                families.push((name, vec![metric]));
            }
        }
    }

    let mut output = String::with_capacity(metrics.len() * 100);

    for (name, series) in &families {
        let first = series[0];
        writeln!(output, "# HELP {} {}", name, escape_help(&first.help)).ok();
        writeln!(output, "# TYPE {} {}", name, first.metric_type.as_str()).ok();

        for metric in series {
            writeln!(
                output,
                "{}{} {}",
                name,
                metric.format_labels(),
                format_value(metric.value)
            )
            .ok();
        }
    }

    output
}

/// Sanitize a metric name to be Prometheus-compatible.
///
/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
/// Invalid characters become underscores, runs of underscores collapse, and a
/// leading digit gets an underscore prefix.
pub fn sanitize_metric_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 1);
    let mut last_was_underscore = false;

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        result.push('_');
        last_was_underscore = true;
    }

    for c in name.chars() {
        if c == '_' || !(c.is_ascii_alphanumeric() || c == ':') {
            if !last_was_underscore {
                result.push('_');
                last_was_underscore = true;
            }
        } else {
            result.push(c);
            last_was_underscore = false;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    if result.is_empty() {
        result.push_str("unnamed");
    }

    result
}

/// Check whether `name` is a usable Prometheus label name.
///
/// Label names must match `[a-zA-Z_][a-zA-Z0-9_]*`; names starting with `__`
/// are reserved.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("__")
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape `# HELP` text (backslash and newline only).
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}
