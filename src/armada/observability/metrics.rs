/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

const DEFAULT_NAMESPACE: &str = "default";

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CONTROLLER_RECONCILE_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static UNIT_ACTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static WORKLOAD_REPLICAS: OnceLock<IntGaugeVec> = OnceLock::new();
static EXPECTATIONS_PENDING: OnceLock<IntGaugeVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("armada".to_string()), None)
            .expect("failed to initialise armada metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register armada metric collector");
    collector
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_reconciles_total",
            "Controller reconciliation passes grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build controller reconcile counter");
        register_collector(counter)
    })
}

fn controller_reconcile_duration() -> &'static HistogramVec {
    CONTROLLER_RECONCILE_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "controller_reconcile_duration_seconds",
            "Latency distribution for a single reconciliation pass",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]);
        let histogram = HistogramVec::new(opts, &["controller"])
            .expect("failed to build reconcile duration histogram");
        register_collector(histogram)
    })
}

fn unit_actions_total() -> &'static IntCounterVec {
    UNIT_ACTIONS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "actions_total",
            "Mutations issued against managed units grouped by action and result",
        )
        .subsystem("unit");
        let counter = IntCounterVec::new(opts, &["controller", "namespace", "action", "result"])
            .expect("failed to build unit action counter");
        register_collector(counter)
    })
}

fn workload_replicas() -> &'static IntGaugeVec {
    WORKLOAD_REPLICAS.get_or_init(|| {
        let opts = Opts::new(
            "replicas",
            "Replica counts per workload grouped by state (desired, ready, updated)",
        )
        .subsystem("workload");
        let gauge = IntGaugeVec::new(opts, &["controller", "namespace", "workload", "state"])
            .expect("failed to build workload replica gauge");
        register_collector(gauge)
    })
}

fn expectations_pending() -> &'static IntGaugeVec {
    EXPECTATIONS_PENDING.get_or_init(|| {
        let opts = Opts::new(
            "pending",
            "Unit mutations issued but not yet observed in the inventory",
        )
        .subsystem("expectations");
        let gauge = IntGaugeVec::new(opts, &["controller"])
            .expect("failed to build expectations gauge");
        register_collector(gauge)
    })
}

#[derive(Copy, Clone, Debug)]
pub enum ControllerReconcileResult {
    Success,
    Requeue,
    Error,
}

impl ControllerReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Requeue => "requeue",
            ControllerReconcileResult::Error => "error",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Delete,
    InPlaceUpdate,
    Condition,
}

impl ActionKind {
    fn as_label(self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Delete => "delete",
            ActionKind::InPlaceUpdate => "inplace_update",
            ActionKind::Condition => "condition",
        }
    }
}

pub fn record_controller_reconcile(
    controller: &str,
    result: ControllerReconcileResult,
    duration: Duration,
) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
    controller_reconcile_duration()
        .with_label_values(&[controller])
        .observe(duration.as_secs_f64());
}

pub fn record_unit_action(controller: &str, namespace: Option<&str>, action: ActionKind, ok: bool) {
    let namespace = namespace.unwrap_or(DEFAULT_NAMESPACE);
    let result = if ok { "success" } else { "error" };
    unit_actions_total()
        .with_label_values(&[controller, namespace, action.as_label(), result])
        .inc();
}

pub fn set_workload_replicas(
    controller: &str,
    namespace: Option<&str>,
    workload: &str,
    desired: i64,
    ready: i64,
    updated: i64,
) {
    let namespace = namespace.unwrap_or(DEFAULT_NAMESPACE);
    let gauge = workload_replicas();
    for (state, value) in [("desired", desired), ("ready", ready), ("updated", updated)] {
        gauge
            .with_label_values(&[controller, namespace, workload, state])
            .set(value);
    }
}

pub fn adjust_expectations_pending(controller: &str, delta: i64) {
    if delta != 0 {
        expectations_pending()
            .with_label_values(&[controller])
            .add(delta);
    }
}

/// Encodes all registered metrics using the Prometheus text exposition
/// format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_reconcile_and_unit_actions() {
        record_controller_reconcile(
            "cloneset",
            ControllerReconcileResult::Success,
            Duration::from_millis(3),
        );
        record_unit_action("cloneset", Some("ns"), ActionKind::InPlaceUpdate, true);
        record_unit_action("cloneset", None, ActionKind::Delete, false);
        set_workload_replicas("cloneset", Some("ns"), "web", 3, 2, 1);
        adjust_expectations_pending("cloneset", 2);
        adjust_expectations_pending("cloneset", -2);

        let body = gather().expect("metrics encoded");
        let text = String::from_utf8(body).expect("utf8");
        assert!(text.contains("armada_controller_reconciles_total"));
        assert!(text.contains("action=\"inplace_update\""));
        assert!(text.contains("namespace=\"default\""));
        assert!(text.contains("armada_workload_replicas"));
        assert!(text.contains("armada_expectations_pending"));
    }
}
