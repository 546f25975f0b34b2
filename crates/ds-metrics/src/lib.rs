//! A swappable destination for the counters, histograms, and gauges the
//! storage engine emits, installed on top of the `metrics` facade crate and
//! `metrics-exporter-prometheus`. The engine never embeds its own HTTP
//! route for `/metrics` — rendering the text exposition format is exposed
//! as a plain method for an embedding process's own router to call.

use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to install prometheus recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}

/// Everything the core calls into to report activity. One instance is
/// shared (via `Arc`) across every shard of an open `ds::Db` (§4.6).
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// A batch was durably committed: `messages` stored or deleted,
    /// `bytes` of payload.
    fn record_store_batch(&self, shard: &str, messages: u64, bytes: u64);

    /// A `next` call returned `messages` matching entries.
    fn record_read(&self, shard: &str, messages: u64);

    /// A `delete_next` call removed `messages` entries.
    fn record_delete(&self, shard: &str, messages: u64);

    fn record_generation_added(&self, shard: &str, gen_id: u64);

    fn record_generation_dropped(&self, shard: &str, gen_id: u64);

    /// An LTS node crossed its wildcard-promotion threshold (§4.1).
    fn record_trie_promotion(&self, shard: &str);
}

/// Discards everything. The default for tests and for callers that don't
/// care to wire up a real sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record_store_batch(&self, _shard: &str, _messages: u64, _bytes: u64) {}
    fn record_read(&self, _shard: &str, _messages: u64) {}
    fn record_delete(&self, _shard: &str, _messages: u64) {}
    fn record_generation_added(&self, _shard: &str, _gen_id: u64) {}
    fn record_generation_dropped(&self, _shard: &str, _gen_id: u64) {}
    fn record_trie_promotion(&self, _shard: &str) {}
}

/// Installs the process-global `metrics` recorder on construction and
/// records through the `metrics::counter!`/`histogram!`/`gauge!` macros.
/// `render()` returns the current Prometheus text exposition for an
/// embedding process to serve.
pub struct PrometheusSink {
    handle: metrics_exporter_prometheus::PrometheusHandle,
}

impl fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusSink").finish_non_exhaustive()
    }
}

impl PrometheusSink {
    pub fn install() -> Result<Self, Error> {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .set_buckets(&prometheus::exponential_buckets(0.00001, 2.5, 15).expect("static histogram bucket params"))?
            .install_recorder()?;
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl MetricsSink for PrometheusSink {
    fn record_store_batch(&self, shard: &str, messages: u64, bytes: u64) {
        metrics::counter!("ds_store_batch_messages", "shard" => shard.to_string()).increment(messages);
        metrics::histogram!("ds_store_batch_bytes", "shard" => shard.to_string()).record(bytes as f64);
    }

    fn record_read(&self, shard: &str, messages: u64) {
        metrics::counter!("ds_read_messages", "shard" => shard.to_string()).increment(messages);
    }

    fn record_delete(&self, shard: &str, messages: u64) {
        metrics::counter!("ds_delete_messages", "shard" => shard.to_string()).increment(messages);
    }

    fn record_generation_added(&self, shard: &str, gen_id: u64) {
        tracing::debug!(shard, gen_id, "generation added");
        metrics::counter!("ds_generations_added", "shard" => shard.to_string()).increment(1);
    }

    fn record_generation_dropped(&self, shard: &str, gen_id: u64) {
        tracing::debug!(shard, gen_id, "generation dropped");
        metrics::counter!("ds_generations_dropped", "shard" => shard.to_string()).increment(1);
    }

    fn record_trie_promotion(&self, shard: &str) {
        metrics::counter!("ds_trie_promotions", "shard" => shard.to_string()).increment(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_noop_sink_does_not_panic() {
        let sink = NoopSink;
        sink.record_store_batch("shard-0", 10, 1024);
        sink.record_read("shard-0", 10);
        sink.record_delete("shard-0", 1);
        sink.record_generation_added("shard-0", 1);
        sink.record_generation_dropped("shard-0", 1);
        sink.record_trie_promotion("shard-0");
    }
}
