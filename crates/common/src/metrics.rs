use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Prometheus-backed counters for query execution.
///
/// Cloning shares the underlying registry.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    operator_rows_out: CounterVec,
    operator_batches_out: CounterVec,
    operator_bytes_out: CounterVec,
    operator_time_seconds: HistogramVec,
    spill_bytes: CounterVec,
    spill_files: CounterVec,
    queries: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record the final counters of one operator partition.
    pub fn record_operator(
        &self,
        query_id: &str,
        operator: &str,
        partition: usize,
        rows_out: u64,
        batches_out: u64,
        bytes_out: u64,
        secs: f64,
    ) {
        let labels = [query_id, operator, &partition.to_string()];
        self.inner
            .operator_rows_out
            .with_label_values(&labels)
            .inc_by(rows_out as f64);
        self.inner
            .operator_batches_out
            .with_label_values(&labels)
            .inc_by(batches_out as f64);
        self.inner
            .operator_bytes_out
            .with_label_values(&labels)
            .inc_by(bytes_out as f64);
        self.inner
            .operator_time_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn record_spill(&self, query_id: &str, operator: &str, bytes: u64) {
        let labels = [query_id, operator];
        self.inner
            .spill_bytes
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner.spill_files.with_label_values(&labels).inc();
    }

    /// Count a finished query by outcome (`ok`, `error`, `cancelled`).
    pub fn record_query(&self, outcome: &str) {
        self.inner.queries.with_label_values(&[outcome]).inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();
        let op_labels = &["query_id", "operator", "partition"];

        let operator_rows_out = counter_vec(
            &registry,
            "lfq_operator_rows_out_total",
            "Output rows produced per operator",
            op_labels,
        );
        let operator_batches_out = counter_vec(
            &registry,
            "lfq_operator_batches_out_total",
            "Output batches produced per operator",
            op_labels,
        );
        let operator_bytes_out = counter_vec(
            &registry,
            "lfq_operator_bytes_out_total",
            "Output bytes produced per operator",
            op_labels,
        );
        let operator_time_seconds = histogram_vec(
            &registry,
            "lfq_operator_time_seconds",
            "Time spent polling each operator partition",
            op_labels,
        );
        let spill_bytes = counter_vec(
            &registry,
            "lfq_spill_bytes_total",
            "Spill bytes written",
            &["query_id", "operator"],
        );
        let spill_files = counter_vec(
            &registry,
            "lfq_spill_files_total",
            "Spill files written",
            &["query_id", "operator"],
        );
        let queries = counter_vec(
            &registry,
            "lfq_queries_total",
            "Queries executed by outcome",
            &["outcome"],
        );

        Self {
            registry,
            operator_rows_out,
            operator_batches_out,
            operator_bytes_out,
            operator_time_seconds,
            spill_bytes,
            spill_files,
            queries,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide registry for callers without an engine handle.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_operator("q1", "MemoryExec", 0, 10, 1, 128, 0.01);
        m.record_spill("q1", "SortExec", 4096);
        m.record_query("ok");
        let text = m.render_prometheus();
        assert!(text.contains("lfq_operator_rows_out_total"));
        assert!(text.contains("MemoryExec"));
        assert!(text.contains("lfq_spill_bytes_total"));
        assert!(text.contains("lfq_queries_total"));
    }
}
