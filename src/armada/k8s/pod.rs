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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Standard pod readiness condition.
pub const CONDITION_READY: &str = "Ready";
/// Readiness gate held false while an in-place update is in flight.
pub const CONDITION_IN_PLACE_UPDATE_READY: &str = "InPlaceUpdateReady";

/// Minimal representation of Kubernetes object metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn name_or_empty(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    /// The owner reference flagged as the managing controller, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references
            .iter()
            .find(|reference| reference.controller.unwrap_or(false))
    }

    pub fn is_controlled_by(&self, uid: &str) -> bool {
        self.controller_ref()
            .map(|reference| reference.uid == uid)
            .unwrap_or(false)
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Reference from a dependent to the object that owns it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerReference {
    pub fn controller_of(api_version: &str, kind: &str, name: &str, uid: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// Minimal container specification derived from Kubernetes `Container`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<ContainerEnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ContainerResources>,
}

/// Minimal environment variable spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerEnvVar {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Describes how a volume is mounted inside the container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

/// Requests and limits keyed by resource name (`cpu`, `memory`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerResources {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// Pod volume; only claim-backed and scratch volumes are modelled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimVolumeSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimVolumeSource {
    pub claim_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmptyDirVolumeSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
}

/// Extra condition that must be true before the pod counts as ready.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodReadinessGate {
    pub condition_type: String,
}

impl PodReadinessGate {
    pub fn in_place_update_ready() -> Self {
        Self {
            condition_type: CONDITION_IN_PLACE_UPDATE_READY.to_string(),
        }
    }
}

/// Minimal pod specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<ContainerSpec>,
    pub containers: Vec<ContainerSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_gates: Vec<PodReadinessGate>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub node_selector: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl PodSpec {
    pub fn has_readiness_gate(&self, condition_type: &str) -> bool {
        self.readiness_gates
            .iter()
            .any(|gate| gate.condition_type == condition_type)
    }
}

/// Pod object wrapper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PodStatus>,
}

impl Pod {
    pub fn new(metadata: ObjectMeta, spec: PodSpec) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata,
            spec,
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name_or_empty()
    }

    pub fn condition(&self, condition_type: &str) -> Option<&PodCondition> {
        self.status.as_ref().and_then(|status| {
            status
                .conditions
                .iter()
                .find(|condition| condition.condition_type == condition_type)
        })
    }

    /// Ready when the `Ready` condition is true, the pod is running, and
    /// it is not being deleted.
    pub fn is_ready(&self) -> bool {
        if self.metadata.is_terminating() {
            return false;
        }
        let running = self
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .map(|phase| phase == "Running")
            .unwrap_or(false);
        running
            && self
                .condition(CONDITION_READY)
                .map(|condition| condition.is_true())
                .unwrap_or(false)
    }

    /// Time the pod last transitioned to ready, if it is ready now.
    pub fn ready_since(&self) -> Option<DateTime<Utc>> {
        if !self.is_ready() {
            return None;
        }
        self.condition(CONDITION_READY)
            .and_then(|condition| condition.last_transition_time)
    }

    /// Ready for at least `min_ready_seconds` as of `now`.
    pub fn is_available(&self, min_ready_seconds: u32, now: DateTime<Utc>) -> bool {
        match self.ready_since() {
            Some(since) => {
                min_ready_seconds == 0
                    || (now - since).num_seconds() >= i64::from(min_ready_seconds)
            }
            None => self.is_ready() && min_ready_seconds == 0,
        }
    }

    /// Upserts a condition, bumping the transition time only when the
    /// status flips.
    pub fn set_condition(&mut self, mut condition: PodCondition) {
        let status = self.status.get_or_insert_with(PodStatus::default);
        if let Some(existing) = status
            .conditions
            .iter_mut()
            .find(|existing| existing.condition_type == condition.condition_type)
        {
            if existing.status == condition.status && condition.last_transition_time.is_some() {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            status.conditions.push(condition);
        }
    }
}

/// Runtime status snapshot for the pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PodCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_statuses: Vec<ContainerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

/// Container-level status information.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,
    pub ready: bool,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(rename = "imageID", skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

/// Pod condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PodCondition {
    pub fn new(condition_type: &str, status: bool, at: DateTime<Utc>) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(at),
            reason: None,
            message: None,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}
