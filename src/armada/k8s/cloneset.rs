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

use super::intstr::IntOrString;
use super::persistentvolumeclaim::PersistentVolumeClaim;
use super::pod::ObjectMeta;
use super::statefulset::{LabelSelector, PodTemplateSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CLONESET_API_VERSION: &str = "apps.armada.io/v1alpha1";
pub const CLONESET_KIND: &str = "CloneSet";

/// Workload that owns its pods and claims directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloneSet {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CloneSetSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CloneSetStatus>,
}

impl CloneSet {
    pub fn new(metadata: ObjectMeta, spec: CloneSetSpec) -> Self {
        Self {
            api_version: CLONESET_API_VERSION.to_string(),
            kind: CLONESET_KIND.to_string(),
            metadata,
            spec,
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name_or_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloneSetSpec {
    #[serde(default)]
    pub replicas: u32,
    pub selector: LabelSelector,
    pub template: PodTemplateSpec,
    /// One claim per template is created for every unit and joined to it by
    /// instance id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
    #[serde(default)]
    pub scale_strategy: CloneSetScaleStrategy,
    #[serde(default)]
    pub update_strategy: CloneSetUpdateStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<u32>,
    #[serde(default)]
    pub min_ready_seconds: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloneSetScaleStrategy {
    /// Unit names to remove ahead of any priority-based scale down.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods_to_delete: Vec<String>,
    /// Fate of a unit's claims when the unit is scaled away or recreated.
    #[serde(default, skip_serializing_if = "VolumeRetentionPolicy::is_delete")]
    pub volume_retention_policy: VolumeRetentionPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum VolumeRetentionPolicy {
    #[default]
    Delete,
    /// Claims are kept and picked up by the next unit created.
    Retain,
}

impl VolumeRetentionPolicy {
    pub fn is_delete(&self) -> bool {
        matches!(self, VolumeRetentionPolicy::Delete)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum CloneSetUpdateStrategyType {
    #[serde(rename = "ReCreate")]
    Recreate,
    #[serde(rename = "InPlaceIfPossible")]
    #[default]
    InPlaceIfPossible,
    #[serde(rename = "InPlaceOnly")]
    InPlaceOnly,
}

impl CloneSetUpdateStrategyType {
    pub const fn as_str(self) -> &'static str {
        match self {
            CloneSetUpdateStrategyType::Recreate => "ReCreate",
            CloneSetUpdateStrategyType::InPlaceIfPossible => "InPlaceIfPossible",
            CloneSetUpdateStrategyType::InPlaceOnly => "InPlaceOnly",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloneSetUpdateStrategy {
    #[serde(rename = "type", default)]
    pub r#type: CloneSetUpdateStrategyType,
    /// Units with an ordinal below the resolved partition keep their revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloneSetStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub available_replicas: u32,
    #[serde(default)]
    pub updated_replicas: u32,
    #[serde(default)]
    pub updated_ready_replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,
    #[serde(default)]
    pub collision_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<WorkloadCondition>,
}

/// Condition reported on workload status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadCondition {
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

impl WorkloadCondition {
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armada::test_support::cloneset;

    #[test]
    fn strategy_types_use_wire_names() {
        let mut set = cloneset("web", 2, "nginx:1");
        set.spec.update_strategy.r#type = CloneSetUpdateStrategyType::Recreate;
        set.spec.update_strategy.partition = Some(IntOrString::Int(1));
        let value = serde_json::to_value(&set).unwrap();
        assert_eq!(value["spec"]["updateStrategy"]["type"], "ReCreate");
        assert_eq!(value["spec"]["updateStrategy"]["partition"], 1);
        assert_eq!(value["kind"], "CloneSet");
        assert!(value["spec"]["updateStrategy"].get("paused").is_none());
    }

    #[test]
    fn missing_strategy_defaults_to_in_place_if_possible() {
        let raw = serde_json::json!({
            "apiVersion": CLONESET_API_VERSION,
            "kind": CLONESET_KIND,
            "metadata": {"name": "web"},
            "spec": {
                "replicas": 3,
                "selector": {"matchLabels": {"app": "web"}},
                "template": {"spec": {"containers": [{"name": "main", "image": "nginx:1"}]}}
            }
        });
        let set: CloneSet = serde_json::from_value(raw).unwrap();
        assert_eq!(
            set.spec.update_strategy.r#type,
            CloneSetUpdateStrategyType::InPlaceIfPossible
        );
        assert!(set.spec.scale_strategy.pods_to_delete.is_empty());
        assert!(set.spec.scale_strategy.volume_retention_policy.is_delete());
    }

    #[test]
    fn retention_policy_is_omitted_unless_retaining() {
        let mut set = cloneset("web", 1, "nginx:1");
        let value = serde_json::to_value(&set).unwrap();
        assert!(value["spec"]["scaleStrategy"]
            .get("volumeRetentionPolicy")
            .is_none());
        set.spec.scale_strategy.volume_retention_policy = VolumeRetentionPolicy::Retain;
        let value = serde_json::to_value(&set).unwrap();
        assert_eq!(value["spec"]["scaleStrategy"]["volumeRetentionPolicy"], "Retain");
        assert_eq!(set.spec.min_ready_seconds, 0);
    }
}
