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

//! Fixtures shared by unit and integration tests.

use crate::armada::k8s::cloneset::{
    CloneSet, CloneSetSpec, CloneSetUpdateStrategy, CloneSetUpdateStrategyType,
};
use crate::armada::k8s::pod::{
    ContainerSpec, ContainerStatus, ObjectMeta, OwnerReference, Pod, PodCondition,
    PodReadinessGate, PodSpec, PodStatus, CONDITION_READY,
};
use crate::armada::k8s::statefulset::{LabelSelector, PodTemplateSpec, StatefulSetSpec};
use crate::armada::k8s::uniteddeployment::{
    ManualUpdate, StatefulSetTemplateSpec, SubsetSpec, SubsetTemplate, Topology,
    UnitedDeployment, UnitedDeploymentSpec, UnitedDeploymentUpdateStrategy,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::env;

pub const TEST_NAMESPACE: &str = "default";

/// Restores an environment variable to its previous value on drop.
pub struct EnvGuard {
    key: &'static str,
    previous: Option<String>,
}

impl EnvGuard {
    pub fn set_str(key: &'static str, value: &str) -> Self {
        let previous = env::var(key).ok();
        env::set_var(key, value);
        Self { key, previous }
    }

    pub fn unset(key: &'static str) -> Self {
        let previous = env::var(key).ok();
        env::remove_var(key);
        Self { key, previous }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if let Some(value) = self.previous.as_ref() {
            env::set_var(self.key, value);
        } else {
            env::remove_var(self.key);
        }
    }
}

/// Fixed reference time so readiness durations are reproducible.
pub fn epoch() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .map(|time| time.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub fn seconds_after_epoch(seconds: i64) -> DateTime<Utc> {
    epoch() + ChronoDuration::seconds(seconds)
}

pub fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Single-container template labelled `app=<app>`.
pub fn pod_template(app: &str, image: &str) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: ObjectMeta {
            labels: labels(&[("app", app)]),
            ..Default::default()
        },
        spec: PodSpec {
            containers: vec![ContainerSpec {
                name: "main".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        },
    }
}

/// CloneSet with an in-place-capable strategy and a matching selector.
pub fn cloneset(name: &str, replicas: u32, image: &str) -> CloneSet {
    let mut template = pod_template(name, image);
    template.spec.readiness_gates.push(PodReadinessGate::in_place_update_ready());
    CloneSet::new(
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            ..Default::default()
        },
        CloneSetSpec {
            replicas,
            selector: LabelSelector {
                match_labels: labels(&[("app", name)]),
            },
            template,
            volume_claim_templates: Vec::new(),
            scale_strategy: Default::default(),
            update_strategy: CloneSetUpdateStrategy {
                r#type: CloneSetUpdateStrategyType::InPlaceIfPossible,
                ..Default::default()
            },
            revision_history_limit: None,
            min_ready_seconds: 0,
        },
    )
}

/// Marks a pod ready since `since`, with one running container per spec
/// container reporting `image_id`.
pub fn mark_ready(pod: &mut Pod, since: DateTime<Utc>, image_id: &str) {
    let container_statuses = pod
        .spec
        .containers
        .iter()
        .map(|container| ContainerStatus {
            name: container.name.clone(),
            ready: true,
            restart_count: 0,
            image: container.image.clone(),
            image_id: Some(image_id.to_string()),
        })
        .collect();
    let mut conditions = pod
        .status
        .as_ref()
        .map(|status| status.conditions.clone())
        .unwrap_or_default();
    conditions.retain(|condition| condition.condition_type != CONDITION_READY);
    conditions.push(PodCondition::new(CONDITION_READY, true, since));
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        conditions,
        container_statuses,
        start_time: Some(since),
    });
}

/// Marks a pod not ready (running but failing its readiness probe).
pub fn mark_not_ready(pod: &mut Pod, since: DateTime<Utc>) {
    let status = pod.status.get_or_insert_with(PodStatus::default);
    status.phase = Some("Running".to_string());
    status
        .conditions
        .retain(|condition| condition.condition_type != CONDITION_READY);
    status
        .conditions
        .push(PodCondition::new(CONDITION_READY, false, since));
    for container in status.container_statuses.iter_mut() {
        container.ready = false;
    }
}

/// Controller owner reference pointing at `cloneset`.
pub fn owner_ref(cloneset: &CloneSet) -> OwnerReference {
    OwnerReference::controller_of(
        "apps.armada.io/v1alpha1",
        "CloneSet",
        cloneset.metadata.name.as_deref().unwrap_or_default(),
        cloneset.metadata.uid.as_deref().unwrap_or_default(),
    )
}

/// StatefulSet-backed UnitedDeployment with one subset per entry in
/// `subsets`, each pinned to the matching zone and sharing the remainder.
pub fn united_deployment(name: &str, replicas: u32, image: &str, subsets: &[&str]) -> UnitedDeployment {
    let template = pod_template(name, image);
    let selector = LabelSelector {
        match_labels: labels(&[("app", name)]),
    };
    UnitedDeployment::new(
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        UnitedDeploymentSpec {
            replicas: Some(replicas),
            selector: selector.clone(),
            template: SubsetTemplate {
                stateful_set_template: Some(StatefulSetTemplateSpec {
                    metadata: template.metadata.clone(),
                    spec: StatefulSetSpec {
                        selector,
                        template,
                        ..Default::default()
                    },
                }),
                deployment_template: None,
            },
            topology: Topology {
                subsets: subsets
                    .iter()
                    .map(|subset| SubsetSpec {
                        name: subset.to_string(),
                        node_selector: labels(&[("topology.kubernetes.io/zone", subset)]),
                        replicas: None,
                    })
                    .collect(),
            },
            strategy: UnitedDeploymentUpdateStrategy {
                manual_update: Some(ManualUpdate::default()),
                ..Default::default()
            },
            revision_history_limit: None,
        },
    )
}
