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

use super::persistentvolumeclaim::PersistentVolumeClaim;
use super::pod::{ObjectMeta, PodSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Minimal label selector supporting exact-match labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelSelector {
    #[serde(
        rename = "matchLabels",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub match_labels: HashMap<String, String>,
}

impl LabelSelector {
    /// An empty selector matches nothing, mirroring controller semantics
    /// where an empty selector would otherwise claim every pod.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        !self.match_labels.is_empty()
            && self
                .match_labels
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value))
    }

    /// `k=v,k=v` form, sorted for stable output.
    pub fn to_query(&self) -> String {
        let mut pairs: Vec<String> = self
            .match_labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        pairs.sort();
        pairs.join(",")
    }
}

/// Template describing the pods a workload manages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

/// StatefulSet specification used for StatefulSet-backed subsets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatefulSetSpec {
    #[serde(default)]
    pub replicas: i32,
    pub selector: LabelSelector,
    pub template: PodTemplateSpec,
    #[serde(default)]
    pub update_strategy: StatefulSetUpdateStrategy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,
}

/// StatefulSet update behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatefulSetUpdateStrategy {
    #[serde(rename = "type", default)]
    pub r#type: StatefulSetUpdateStrategyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<StatefulSetRollingUpdate>,
}

impl Default for StatefulSetUpdateStrategy {
    fn default() -> Self {
        Self {
            r#type: StatefulSetUpdateStrategyType::RollingUpdate,
            rolling_update: Some(StatefulSetRollingUpdate::default()),
        }
    }
}

impl StatefulSetUpdateStrategy {
    pub fn partition(&self) -> u32 {
        self.rolling_update
            .as_ref()
            .and_then(|config| config.partition)
            .unwrap_or(0)
    }

    pub fn set_partition(&mut self, partition: u32) {
        self.rolling_update
            .get_or_insert_with(StatefulSetRollingUpdate::default)
            .partition = Some(partition);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum StatefulSetUpdateStrategyType {
    #[serde(rename = "RollingUpdate")]
    #[default]
    RollingUpdate,
    #[serde(rename = "OnDelete")]
    OnDelete,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatefulSetRollingUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatefulSetStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
    #[serde(default)]
    pub updated_ready_replicas: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatefulSet {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: StatefulSetSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatefulSetStatus>,
}

impl StatefulSet {
    pub fn new(metadata: ObjectMeta, spec: StatefulSetSpec) -> Self {
        Self {
            api_version: "apps/v1".to_string(),
            kind: "StatefulSet".to_string(),
            metadata,
            spec,
            status: None,
        }
    }
}
