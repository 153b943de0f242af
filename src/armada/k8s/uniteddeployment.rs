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

use super::cloneset::WorkloadCondition;
use super::deployment::DeploymentSpec;
use super::intstr::IntOrString;
use super::pod::ObjectMeta;
use super::statefulset::{LabelSelector, StatefulSetSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const UNITED_DEPLOYMENT_API_VERSION: &str = "apps.armada.io/v1alpha1";
pub const UNITED_DEPLOYMENT_KIND: &str = "UnitedDeployment";

/// Workload that fans a replica count out over named subsets, each backed by
/// a StatefulSet or a Deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitedDeployment {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: UnitedDeploymentSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UnitedDeploymentStatus>,
}

impl UnitedDeployment {
    pub fn new(metadata: ObjectMeta, spec: UnitedDeploymentSpec) -> Self {
        Self {
            api_version: UNITED_DEPLOYMENT_API_VERSION.to_string(),
            kind: UNITED_DEPLOYMENT_KIND.to_string(),
            metadata,
            spec,
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name_or_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitedDeploymentSpec {
    /// Defaults to 1 when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    pub selector: LabelSelector,
    #[serde(default)]
    pub template: SubsetTemplate,
    #[serde(default)]
    pub topology: Topology,
    #[serde(default)]
    pub strategy: UnitedDeploymentUpdateStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<u32>,
}

impl UnitedDeploymentSpec {
    pub fn desired_replicas(&self) -> u32 {
        self.replicas.unwrap_or(1)
    }
}

/// Exactly one of the templates is expected to be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubsetTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_set_template: Option<StatefulSetTemplateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_template: Option<DeploymentTemplateSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatefulSetTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: StatefulSetSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeploymentTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Topology {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsets: Vec<SubsetSpec>,
}

/// One named slice of the topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubsetSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub node_selector: HashMap<String, String>,
    /// Absolute count or percentage of the workload total.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<IntOrString>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum UnitedDeploymentUpdateStrategyType {
    #[serde(rename = "Manual")]
    #[default]
    Manual,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnitedDeploymentUpdateStrategy {
    #[serde(rename = "type", default)]
    pub r#type: UnitedDeploymentUpdateStrategyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_update: Option<ManualUpdate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManualUpdate {
    /// Per-subset partition keyed by subset name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub partitions: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitedDeploymentStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub updated_replicas: u32,
    #[serde(default)]
    pub updated_ready_replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,
    #[serde(default)]
    pub collision_count: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subset_replicas: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_status: Option<UpdateStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<WorkloadCondition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_revision: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub current_partitions: BTreeMap<String, u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_topology_with_mixed_replica_shapes() {
        let raw = serde_json::json!({
            "apiVersion": UNITED_DEPLOYMENT_API_VERSION,
            "kind": UNITED_DEPLOYMENT_KIND,
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "replicas": 10,
                "selector": {"matchLabels": {"app": "web"}},
                "template": {"statefulSetTemplate": {
                    "metadata": {"labels": {"app": "web"}},
                    "spec": {
                        "selector": {"matchLabels": {"app": "web"}},
                        "template": {"spec": {"containers": [{"name": "main", "image": "nginx:1"}]}}
                    }
                }},
                "topology": {"subsets": [
                    {"name": "zone-a", "replicas": 4},
                    {"name": "zone-b", "replicas": "50%", "nodeSelector": {"zone": "b"}},
                    {"name": "zone-c"}
                ]},
                "strategy": {"type": "Manual", "manualUpdate": {"partitions": {"zone-a": 2}}}
            }
        });
        let ud: UnitedDeployment = serde_json::from_value(raw).unwrap();
        assert_eq!(ud.spec.desired_replicas(), 10);
        let subsets = &ud.spec.topology.subsets;
        assert_eq!(subsets[0].replicas, Some(IntOrString::Int(4)));
        assert_eq!(subsets[1].replicas, Some(IntOrString::percent(50)));
        assert_eq!(subsets[2].replicas, None);
        assert_eq!(subsets[1].node_selector.get("zone").map(String::as_str), Some("b"));
        assert!(ud.spec.template.stateful_set_template.is_some());
        assert_eq!(
            ud.spec
                .strategy
                .manual_update
                .as_ref()
                .and_then(|manual| manual.partitions.get("zone-a")),
            Some(&2)
        );
    }
}
