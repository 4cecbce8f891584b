use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::time::Duration;

/// Outcome label values for runtime hooks.
pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_FAILED: &str = "failed";
pub const OUTCOME_NOOP: &str = "noop";

/// Latency histogram and outcome counter per runtime hook. The registry is a
/// passive sink; serving it is wired up elsewhere.
#[derive(Clone)]
pub struct HookMetrics {
  latency: HistogramVec,
  outcomes: IntCounterVec,
}

impl HookMetrics {
  pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
    let latency = HistogramVec::new(
      HistogramOpts::new(
        "runtime_hook_duration_seconds",
        "Latency of container-runtime lifecycle hooks.",
      ),
      &["method"],
    )?;
    let outcomes = IntCounterVec::new(
      Opts::new(
        "runtime_hook_results_total",
        "Results of container-runtime lifecycle hooks.",
      ),
      &["method", "outcome"],
    )?;

    registry.register(Box::new(latency.clone()))?;
    registry.register(Box::new(outcomes.clone()))?;

    Ok(Self { latency, outcomes })
  }

  pub fn record(&self, method: &str, outcome: &str, elapsed: Duration) {
    self
      .latency
      .with_label_values(&[method])
      .observe(elapsed.as_secs_f64());
    self.outcomes.with_label_values(&[method, outcome]).inc();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn records_latency_and_outcomes() {
    let registry = Registry::new();
    let metrics = HookMetrics::new(&registry).unwrap();

    metrics.record("RunPodSandbox", OUTCOME_SUCCESS, Duration::from_millis(5));
    metrics.record("RunPodSandbox", OUTCOME_FAILED, Duration::from_millis(7));
    metrics.record("CreateContainer", OUTCOME_NOOP, Duration::from_millis(1));

    let families = registry.gather();
    assert!(families
      .iter()
      .any(|family| family.get_name() == "runtime_hook_duration_seconds"));
    let outcomes = families
      .iter()
      .find(|family| family.get_name() == "runtime_hook_results_total")
      .unwrap();
    assert_eq!(outcomes.get_metric().len(), 3);
  }

  #[test]
  fn double_registration_fails() {
    let registry = Registry::new();
    HookMetrics::new(&registry).unwrap();
    assert!(HookMetrics::new(&registry).is_err());
  }
}
