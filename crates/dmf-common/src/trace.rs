use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

/// A single epoch's worth of measurements (spec §3 `TraceEntry`, §6
/// persisted-state contract). Entries do not own each other — the source's
/// cyclic polymorphic trace payload (§9 design note) is replaced by a flat,
/// append-only `Vec` owned by the `Trace`.
#[derive(Clone, Debug, Serialize)]
pub struct TraceEntry {
    pub epoch: usize,
    pub iteration: usize,
    pub eps: f64,
    pub loss: f64,
    pub loss_test: Option<f64>,
    /// Per-phase wall-clock durations, e.g. `"epoch"`, `"balance"`, `"loss"`.
    pub time: BTreeMap<String, Duration>,
    /// Rescaling vector applied by balancing this epoch, if any.
    pub rescale: Option<Vec<f64>>,
    /// Free-form fields appended via `addField` in the source; kept as a
    /// JSON value so callers can stash decay/kernel-specific diagnostics
    /// (e.g. ASGD's shuffle count) without widening this struct.
    pub info: BTreeMap<String, serde_json::Value>,
}

impl TraceEntry {
    pub fn new(epoch: usize, iteration: usize, eps: f64, loss: f64) -> Self {
        Self {
            epoch,
            iteration,
            eps,
            loss,
            loss_test: None,
            time: BTreeMap::new(),
            rescale: None,
            info: BTreeMap::new(),
        }
    }

    pub fn with_phase(mut self, name: &str, d: Duration) -> Self {
        self.time.insert(name.to_string(), d);
        self
    }

    pub fn add_field(&mut self, name: &str, value: impl Into<serde_json::Value>) {
        self.info.insert(name.to_string(), value.into());
    }
}

/// Append-only driver-owned trace (spec §3, §6).
#[derive(Clone, Debug, Default, Serialize)]
pub struct Trace {
    entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Renders the trace as a single R variable bound to a nested list,
    /// one entry per `TraceEntry`, matching the `--trace-var` contract of
    /// §6. Matrix-market / R-rendering logic proper lives with the CLI's
    /// IO collaborator; this is the canonical in-memory shape it renders.
    pub fn to_r_list(&self, var_name: &str) -> String {
        let mut out = format!("{} <- list(\n", var_name);
        for (idx, e) in self.entries.iter().enumerate() {
            if idx > 0 {
                out.push_str(",\n");
            }
            out.push_str(&format!(
                "  list(epoch={}, iteration={}, eps={}, loss={}, loss.test={})",
                e.epoch,
                e.iteration,
                e.eps,
                e.loss,
                e.loss_test
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "NA".to_string()),
            ));
        }
        out.push_str("\n)\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_omits_absent_test_loss() {
        let mut trace = Trace::new();
        trace.push(TraceEntry::new(0, 0, 0.1, 0.0));
        let rendered = trace.to_r_list("trace");
        assert!(rendered.contains("loss.test=NA"));
    }
}
