use std::time::Duration;

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Gauge, Histogram, Meter},
};

const CONTROL_PLANE: &'static str = "kubefleet";

pub(crate) fn metric_name(name: &str) -> String {
    format!("kubefleet_{}", name)
}

/// Instruments shared by all subsystems.
#[derive(Clone)]
pub struct Metrics {
    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
    reconcile_errors: Counter<u64>,
    task_complete: Counter<u64>,
    task_failed: Counter<u64>,
    registry_clients: Gauge<u64>,
    addon_installs: Counter<u64>,
}

impl Metrics {
    pub fn new() -> Self {
        let meter: Meter = global::meter(CONTROL_PLANE);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of reconciliation cycles per cluster and kind")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconciliation cycle duration in milliseconds")
            .with_unit("ms")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of row level failures during reconciliation")
            .build();
        let task_complete = meter
            .u64_counter(metric_name("task_complete_count"))
            .with_description("Count of tasks that completed")
            .build();
        let task_failed = meter
            .u64_counter(metric_name("task_failed_count"))
            .with_description("Count of tasks that failed")
            .build();
        let registry_clients = meter
            .u64_gauge(metric_name("registry_clients"))
            .with_description("Number of member cluster clients held by the registry")
            .build();
        let addon_installs = meter
            .u64_counter(metric_name("addon_install_count"))
            .with_description("Count of chart installs and manifest applies")
            .build();
        Self {
            reconcile_count,
            reconcile_duration,
            reconcile_errors,
            task_complete,
            task_failed,
            registry_clients,
            addon_installs,
        }
    }

    pub fn reconciled(&self, cluster_id: &str, kind: &str, duration: Duration, errors: usize) {
        let labels = &[
            KeyValue::new("cluster", cluster_id.to_string()),
            KeyValue::new("kind", kind.to_string()),
        ];
        self.reconcile_count.add(1, labels);
        self.reconcile_duration
            .record(duration.as_millis() as u64, labels);
        if errors > 0 {
            self.reconcile_errors.add(errors as u64, labels);
        }
    }

    pub fn task_finished(&self, name: &str, success: bool) {
        let labels = &[KeyValue::new("task", name.to_string())];
        if success {
            self.task_complete.add(1, labels);
        } else {
            self.task_failed.add(1, labels);
        }
    }

    pub fn registry_size(&self, size: usize) {
        self.registry_clients.record(size as u64, &[]);
    }

    pub fn addon_installed(&self, name: &str, success: bool) {
        self.addon_installs.add(
            1,
            &[
                KeyValue::new("addon", name.to_string()),
                KeyValue::new("success", success),
            ],
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
