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

//! Subset objects backing a UnitedDeployment.
//!
//! Each topology subset is realised as one StatefulSet or Deployment named
//! `<workload>-<subset>`, pinned to the subset's nodes and labelled with the
//! subset name and the workload revision it was rendered from.

use crate::armada::controller::error::ControllerError;
use crate::armada::controller::inventory::WorkloadRef;
use crate::armada::controller::revision::LABEL_REVISION_HASH;
use crate::armada::k8s::client::{ObjectStore, ObjectStoreExt, ResourceKind};
use crate::armada::k8s::deployment::Deployment;
use crate::armada::k8s::pod::ObjectMeta;
use crate::armada::k8s::statefulset::{LabelSelector, PodTemplateSpec, StatefulSet};
use crate::armada::k8s::uniteddeployment::{SubsetSpec, UnitedDeployment};
use std::collections::HashMap;

pub const LABEL_SUBSET_NAME: &str = "apps.armada.io/subset-name";

/// Observed subset object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subset {
    /// Object name.
    pub name: String,
    /// Topology subset this object realises.
    pub subset_name: String,
    pub control: SubsetControl,
    pub replicas: u32,
    pub partition: u32,
    pub revision: Option<String>,
    pub ready_replicas: u32,
    pub updated_replicas: u32,
    pub updated_ready_replicas: u32,
}

/// Desired shape of one subset for a pass.
#[derive(Debug, Clone, Copy)]
pub struct SubsetTarget<'a> {
    pub spec: &'a SubsetSpec,
    pub revision: &'a str,
    pub replicas: u32,
    pub partition: u32,
}

/// Object kind backing the subsets of a workload, chosen from its template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsetControl {
    StatefulSet,
    Deployment,
}

pub fn subset_object_name(workload: &str, subset: &str) -> String {
    format!("{}-{}", workload, subset)
}

fn to_u32(value: i32) -> u32 {
    value.max(0) as u32
}

impl SubsetControl {
    pub fn for_workload(ud: &UnitedDeployment) -> Result<Self, ControllerError> {
        let template = &ud.spec.template;
        match (
            template.stateful_set_template.is_some(),
            template.deployment_template.is_some(),
        ) {
            (true, false) => Ok(SubsetControl::StatefulSet),
            (false, true) => Ok(SubsetControl::Deployment),
            (false, false) => Err(ControllerError::Invalid(
                "subset template must set statefulSetTemplate or deploymentTemplate".to_string(),
            )),
            (true, true) => Err(ControllerError::Invalid(
                "subset template must set only one of statefulSetTemplate and deploymentTemplate"
                    .to_string(),
            )),
        }
    }

    pub fn kind(self) -> ResourceKind {
        match self {
            SubsetControl::StatefulSet => ResourceKind::StatefulSet,
            SubsetControl::Deployment => ResourceKind::Deployment,
        }
    }

    pub fn other(self) -> Self {
        match self {
            SubsetControl::StatefulSet => SubsetControl::Deployment,
            SubsetControl::Deployment => SubsetControl::StatefulSet,
        }
    }

    /// Subsets of this kind controlled by the workload.
    pub fn get_all_subsets(
        self,
        store: &dyn ObjectStore,
        workload: &WorkloadRef,
        selector: &LabelSelector,
    ) -> Result<Vec<Subset>, ControllerError> {
        let namespace = workload.namespace.as_str();
        let mut subsets = match self {
            SubsetControl::StatefulSet => store
                .list_as::<StatefulSet>(namespace, Some(selector))?
                .into_iter()
                .filter(|set| set.metadata.is_controlled_by(&workload.uid))
                .filter_map(|set| self.view_statefulset(&set))
                .collect::<Vec<_>>(),
            SubsetControl::Deployment => store
                .list_as::<Deployment>(namespace, Some(selector))?
                .into_iter()
                .filter(|deployment| deployment.metadata.is_controlled_by(&workload.uid))
                .filter_map(|deployment| self.view_deployment(&deployment))
                .collect::<Vec<_>>(),
        };
        subsets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(subsets)
    }

    fn view_statefulset(self, set: &StatefulSet) -> Option<Subset> {
        let subset_name = set.metadata.labels.get(LABEL_SUBSET_NAME)?.clone();
        let status = set.status.clone().unwrap_or_default();
        Some(Subset {
            name: set.metadata.name_or_empty().to_string(),
            subset_name,
            control: self,
            replicas: to_u32(set.spec.replicas),
            partition: set.spec.update_strategy.partition(),
            revision: set.metadata.labels.get(LABEL_REVISION_HASH).cloned(),
            ready_replicas: to_u32(status.ready_replicas),
            updated_replicas: to_u32(status.updated_replicas),
            updated_ready_replicas: to_u32(status.updated_ready_replicas),
        })
    }

    fn view_deployment(self, deployment: &Deployment) -> Option<Subset> {
        let subset_name = deployment.metadata.labels.get(LABEL_SUBSET_NAME)?.clone();
        let status = deployment.status.clone().unwrap_or_default();
        Some(Subset {
            name: deployment.metadata.name_or_empty().to_string(),
            subset_name,
            control: self,
            replicas: to_u32(deployment.spec.replicas),
            partition: 0,
            revision: deployment.metadata.labels.get(LABEL_REVISION_HASH).cloned(),
            ready_replicas: to_u32(status.ready_replicas),
            updated_replicas: to_u32(status.updated_replicas),
            updated_ready_replicas: to_u32(status.ready_replicas.min(status.updated_replicas)),
        })
    }

    pub fn create_subset(
        self,
        store: &dyn ObjectStore,
        ud: &UnitedDeployment,
        target: SubsetTarget<'_>,
    ) -> Result<(), ControllerError> {
        let workload = WorkloadRef::for_united_deployment(ud);
        let namespace = workload.namespace.clone();
        let metadata = ObjectMeta {
            name: Some(subset_object_name(&workload.name, &target.spec.name)),
            namespace: Some(namespace.clone()),
            owner_references: vec![workload.owner_reference()],
            ..Default::default()
        };
        match self {
            SubsetControl::StatefulSet => {
                let set = self.render_statefulset(ud, metadata, target)?;
                store.create_as(&namespace, &set)?;
            }
            SubsetControl::Deployment => {
                let deployment = self.render_deployment(ud, metadata, target)?;
                store.create_as(&namespace, &deployment)?;
            }
        }
        Ok(())
    }

    /// Rewrites the subset from the current template at `target.revision`.
    pub fn update_subset(
        self,
        store: &dyn ObjectStore,
        ud: &UnitedDeployment,
        subset: &Subset,
        target: SubsetTarget<'_>,
    ) -> Result<(), ControllerError> {
        let namespace = WorkloadRef::for_united_deployment(ud).namespace;
        match self {
            SubsetControl::StatefulSet => {
                let existing: StatefulSet = store.get_as(&namespace, &subset.name)?;
                let mut set = self.render_statefulset(ud, existing.metadata.clone(), target)?;
                set.status = existing.status;
                store.update_as(&namespace, &set)?;
            }
            SubsetControl::Deployment => {
                let existing: Deployment = store.get_as(&namespace, &subset.name)?;
                let mut deployment = self.render_deployment(ud, existing.metadata.clone(), target)?;
                deployment.status = existing.status;
                store.update_as(&namespace, &deployment)?;
            }
        }
        Ok(())
    }

    /// Missing subsets count as deleted.
    pub fn delete_subset(
        self,
        store: &dyn ObjectStore,
        namespace: &str,
        subset: &Subset,
    ) -> Result<(), ControllerError> {
        match store.delete(self.kind(), namespace, &subset.name) {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn render_statefulset(
        self,
        ud: &UnitedDeployment,
        metadata: ObjectMeta,
        target: SubsetTarget<'_>,
    ) -> Result<StatefulSet, ControllerError> {
        let template = ud.spec.template.stateful_set_template.as_ref().ok_or_else(|| {
            ControllerError::Invalid("statefulSetTemplate is not set".to_string())
        })?;
        let mut spec = template.spec.clone();
        spec.replicas = target.replicas as i32;
        spec.update_strategy.set_partition(target.partition);
        spec.selector = subset_selector(&ud.spec.selector, target.spec);
        render_pod_template(&mut spec.template, target);
        Ok(StatefulSet::new(
            subset_metadata(metadata, &template.metadata, target),
            spec,
        ))
    }

    fn render_deployment(
        self,
        ud: &UnitedDeployment,
        metadata: ObjectMeta,
        target: SubsetTarget<'_>,
    ) -> Result<Deployment, ControllerError> {
        let template = ud.spec.template.deployment_template.as_ref().ok_or_else(|| {
            ControllerError::Invalid("deploymentTemplate is not set".to_string())
        })?;
        let mut spec = template.spec.clone();
        spec.replicas = target.replicas as i32;
        spec.selector = subset_selector(&ud.spec.selector, target.spec);
        render_pod_template(&mut spec.template, target);
        Ok(Deployment::new(
            subset_metadata(metadata, &template.metadata, target),
            spec,
        ))
    }
}

fn subset_selector(selector: &LabelSelector, subset: &SubsetSpec) -> LabelSelector {
    let mut match_labels = selector.match_labels.clone();
    match_labels.insert(LABEL_SUBSET_NAME.to_string(), subset.name.clone());
    LabelSelector { match_labels }
}

fn subset_metadata(mut metadata: ObjectMeta, template: &ObjectMeta, target: SubsetTarget<'_>) -> ObjectMeta {
    let mut labels: HashMap<String, String> = template.labels.clone();
    labels.insert(LABEL_SUBSET_NAME.to_string(), target.spec.name.clone());
    labels.insert(LABEL_REVISION_HASH.to_string(), target.revision.to_string());
    metadata.labels = labels;
    metadata.annotations.extend(template.annotations.clone());
    metadata
}

fn render_pod_template(template: &mut PodTemplateSpec, target: SubsetTarget<'_>) {
    template
        .metadata
        .labels
        .insert(LABEL_SUBSET_NAME.to_string(), target.spec.name.clone());
    template
        .metadata
        .labels
        .insert(LABEL_REVISION_HASH.to_string(), target.revision.to_string());
    template
        .spec
        .node_selector
        .extend(target.spec.node_selector.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armada::k8s::store::MemoryStore;
    use crate::armada::k8s::uniteddeployment::{
        DeploymentTemplateSpec, StatefulSetTemplateSpec, SubsetTemplate,
    };
    use crate::armada::test_support::{labels, united_deployment, TEST_NAMESPACE};

    fn zone(name: &str) -> SubsetSpec {
        SubsetSpec {
            name: name.to_string(),
            node_selector: labels(&[("topology.kubernetes.io/zone", name)]),
            replicas: None,
        }
    }

    #[test]
    fn template_selects_the_subset_kind() {
        let ud = united_deployment("web", 4, "nginx:1", &["zone-a"]);
        assert_eq!(SubsetControl::for_workload(&ud).unwrap(), SubsetControl::StatefulSet);

        let mut both = ud.clone();
        both.spec.template.deployment_template = Some(DeploymentTemplateSpec::default());
        assert!(SubsetControl::for_workload(&both).unwrap_err().is_terminal());

        let mut neither = ud;
        neither.spec.template = SubsetTemplate::default();
        assert!(SubsetControl::for_workload(&neither).is_err());
    }

    #[test]
    fn created_subsets_are_pinned_and_labelled() {
        let store = MemoryStore::new();
        let ud = united_deployment("web", 4, "nginx:1", &["zone-a"]);
        let workload = WorkloadRef::for_united_deployment(&ud);
        let spec = zone("zone-a");
        let control = SubsetControl::StatefulSet;
        control
            .create_subset(
                &store,
                &ud,
                SubsetTarget {
                    spec: &spec,
                    revision: "web-rev1",
                    replicas: 3,
                    partition: 1,
                },
            )
            .unwrap();

        let set: StatefulSet = store.get_as(TEST_NAMESPACE, "web-zone-a").unwrap();
        assert_eq!(set.spec.replicas, 3);
        assert_eq!(set.spec.update_strategy.partition(), 1);
        assert_eq!(
            set.spec.template.spec.node_selector.get("topology.kubernetes.io/zone"),
            Some(&"zone-a".to_string())
        );
        assert!(set.metadata.is_controlled_by(&workload.uid));

        let subsets = control
            .get_all_subsets(&store, &workload, &ud.spec.selector)
            .unwrap();
        assert_eq!(subsets.len(), 1);
        assert_eq!(subsets[0].subset_name, "zone-a");
        assert_eq!(subsets[0].revision.as_deref(), Some("web-rev1"));

        control
            .update_subset(
                &store,
                &ud,
                &subsets[0],
                SubsetTarget {
                    spec: &spec,
                    revision: "web-rev2",
                    replicas: 5,
                    partition: 0,
                },
            )
            .unwrap();
        let updated = control
            .get_all_subsets(&store, &workload, &ud.spec.selector)
            .unwrap();
        assert_eq!(updated[0].replicas, 5);
        assert_eq!(updated[0].revision.as_deref(), Some("web-rev2"));

        control
            .delete_subset(&store, TEST_NAMESPACE, &updated[0])
            .unwrap();
        control
            .delete_subset(&store, TEST_NAMESPACE, &updated[0])
            .unwrap();
        assert_eq!(store.count(ResourceKind::StatefulSet), 0);
    }

    #[test]
    fn deployment_subsets_have_no_partition() {
        let store = MemoryStore::new();
        let mut ud = united_deployment("api", 2, "nginx:1", &["zone-a"]);
        let stateful: StatefulSetTemplateSpec = ud.spec.template.stateful_set_template.take().unwrap();
        ud.spec.template.deployment_template = Some(DeploymentTemplateSpec {
            metadata: stateful.metadata,
            spec: crate::armada::k8s::deployment::DeploymentSpec {
                selector: stateful.spec.selector,
                template: stateful.spec.template,
                ..Default::default()
            },
        });
        let control = SubsetControl::for_workload(&ud).unwrap();
        let spec = zone("zone-a");
        control
            .create_subset(
                &store,
                &ud,
                SubsetTarget {
                    spec: &spec,
                    revision: "api-rev1",
                    replicas: 2,
                    partition: 1,
                },
            )
            .unwrap();
        let workload = WorkloadRef::for_united_deployment(&ud);
        let subsets = control
            .get_all_subsets(&store, &workload, &ud.spec.selector)
            .unwrap();
        assert_eq!(subsets[0].control, SubsetControl::Deployment);
        assert_eq!(subsets[0].partition, 0);
        assert!(SubsetControl::StatefulSet
            .get_all_subsets(&store, &workload, &ud.spec.selector)
            .unwrap()
            .is_empty());
    }
}
