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

//! Unit inventory: the pods and claims a workload owns, joined by instance
//! id and numbered by stable ordinal.

use crate::armada::controller::error::ControllerError;
use crate::armada::controller::expectations::ObservedUnit;
use crate::armada::controller::revision::LABEL_REVISION_HASH;
use crate::armada::k8s::client::{ObjectStore, ObjectStoreExt, ResourceKind};
use crate::armada::k8s::cloneset::{CloneSet, CLONESET_API_VERSION, CLONESET_KIND};
use crate::armada::k8s::event::ObjectReference;
use crate::armada::k8s::persistentvolumeclaim::PersistentVolumeClaim;
use crate::armada::k8s::pod::{OwnerReference, Pod};
use crate::armada::k8s::statefulset::LabelSelector;
use crate::armada::k8s::store::normalize_namespace;
use crate::armada::k8s::uniteddeployment::{
    UnitedDeployment, UNITED_DEPLOYMENT_API_VERSION, UNITED_DEPLOYMENT_KIND,
};
use crate::armada::logger::log_debug;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Label joining a unit's pod to its claims.
pub const LABEL_INSTANCE_ID: &str = "apps.armada.io/instance-id";
/// Label carrying the unit's stable ordinal.
pub const LABEL_UNIT_ORDINAL: &str = "apps.armada.io/unit-ordinal";

const INSTANCE_ID_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const INSTANCE_ID_LENGTH: usize = 5;

/// Identity of the workload that owns a set of units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub kind: ResourceKind,
    pub api_version: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl WorkloadRef {
    pub fn for_cloneset(set: &CloneSet) -> Self {
        Self {
            kind: ResourceKind::CloneSet,
            api_version: CLONESET_API_VERSION.to_string(),
            namespace: normalize_namespace(set.metadata.namespace.as_deref()),
            name: set.name().to_string(),
            uid: set.metadata.uid.clone().unwrap_or_default(),
        }
    }

    pub fn for_united_deployment(ud: &UnitedDeployment) -> Self {
        Self {
            kind: ResourceKind::UnitedDeployment,
            api_version: UNITED_DEPLOYMENT_API_VERSION.to_string(),
            namespace: normalize_namespace(ud.metadata.namespace.as_deref()),
            name: ud.name().to_string(),
            uid: ud.metadata.uid.clone().unwrap_or_default(),
        }
    }

    pub fn owner_reference(&self) -> OwnerReference {
        let kind = match self.kind {
            ResourceKind::UnitedDeployment => UNITED_DEPLOYMENT_KIND,
            ResourceKind::CloneSet => CLONESET_KIND,
            other => other.kind(),
        };
        OwnerReference::controller_of(&self.api_version, kind, &self.name, &self.uid)
    }

    pub fn object_reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.api_version.clone()),
            kind: Some(self.kind.kind().to_string()),
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            uid: Some(self.uid.clone()),
        }
    }

    /// Work-queue and expectations key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// One managed pod plus the claims sharing its instance id.
#[derive(Debug, Clone)]
pub struct Unit {
    pub pod: Pod,
    pub ordinal: u32,
    pub instance_id: Option<String>,
    pub volumes: Vec<PersistentVolumeClaim>,
}

impl Unit {
    pub fn name(&self) -> &str {
        self.pod.name()
    }

    pub fn revision(&self) -> Option<&str> {
        self.pod
            .metadata
            .labels
            .get(LABEL_REVISION_HASH)
            .map(String::as_str)
    }

    pub fn is_ready(&self) -> bool {
        self.pod.is_ready()
    }

    pub fn is_terminating(&self) -> bool {
        self.pod.metadata.is_terminating()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.pod.metadata.creation_timestamp
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.volumes
            .iter()
            .map(|claim| claim.name().to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    /// Live units sorted by ordinal.
    pub active: Vec<Unit>,
    pub terminating: Vec<Unit>,
    /// Owned claims whose instance id has no unit.
    pub orphan_volumes: BTreeMap<String, Vec<PersistentVolumeClaim>>,
    pub adopted: Vec<String>,
    pub released: Vec<String>,
}

impl Inventory {
    pub fn orphan_instance_ids(&self) -> Vec<String> {
        self.orphan_volumes.keys().cloned().collect()
    }

    /// Ordinals held by active units.
    pub fn used_ordinals(&self) -> BTreeSet<u32> {
        self.active.iter().map(|unit| unit.ordinal).collect()
    }

    pub fn find(&self, name: &str) -> Option<&Unit> {
        self.active
            .iter()
            .chain(self.terminating.iter())
            .find(|unit| unit.name() == name)
    }

    pub fn observed(&self) -> impl Iterator<Item = ObservedUnit<'_>> {
        self.active
            .iter()
            .chain(self.terminating.iter())
            .map(|unit| ObservedUnit {
                name: unit.name(),
                terminating: unit.is_terminating(),
                revision: unit.revision(),
            })
    }
}

/// Random instance id drawn from a vowel-free alphabet.
pub fn generate_instance_id() -> String {
    let mut rng = rand::thread_rng();
    (0..INSTANCE_ID_LENGTH)
        .map(|_| INSTANCE_ID_ALPHABET[rng.gen_range(0..INSTANCE_ID_ALPHABET.len())] as char)
        .collect()
}

fn parse_ordinal(pod: &Pod) -> Option<u32> {
    pod.metadata
        .labels
        .get(LABEL_UNIT_ORDINAL)
        .and_then(|value| value.parse().ok())
}

fn owner_patch(pod: &Pod, owners: Vec<OwnerReference>) -> Result<Value, ControllerError> {
    let owners = if owners.is_empty() {
        Value::Null
    } else {
        serde_json::to_value(owners)?
    };
    let mut metadata = json!({ "ownerReferences": owners });
    if let Some(version) = pod.metadata.resource_version.as_ref() {
        metadata["resourceVersion"] = Value::String(version.clone());
    }
    Ok(json!({ "metadata": metadata }))
}

/// Lists the workload's units, adopting matching orphans and releasing
/// owned pods that no longer match the selector.
pub fn list_units(
    store: &dyn ObjectStore,
    workload: &WorkloadRef,
    selector: &LabelSelector,
) -> Result<Inventory, ControllerError> {
    let namespace = workload.namespace.as_str();
    let pods: Vec<Pod> = store.list_as(namespace, None)?;
    let mut inventory = Inventory::default();
    let mut owned = Vec::new();

    for pod in pods {
        let matches = selector.matches(&pod.metadata.labels);
        match pod.metadata.controller_ref() {
            Some(owner) if owner.uid == workload.uid => {
                if matches || pod.metadata.is_terminating() {
                    owned.push(pod);
                    continue;
                }
                let remaining: Vec<OwnerReference> = pod
                    .metadata
                    .owner_references
                    .iter()
                    .filter(|reference| reference.uid != workload.uid)
                    .cloned()
                    .collect();
                let patch = owner_patch(&pod, remaining)?;
                match store.patch(ResourceKind::Pod, namespace, pod.name(), &patch) {
                    Ok(_) => inventory.released.push(pod.name().to_string()),
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Some(_) => {}
            None => {
                if !matches || pod.metadata.is_terminating() {
                    continue;
                }
                let mut owners = pod.metadata.owner_references.clone();
                owners.push(workload.owner_reference());
                let patch = owner_patch(&pod, owners)?;
                match store.patch_as::<Pod>(namespace, pod.name(), &patch) {
                    Ok(adopted) => {
                        inventory.adopted.push(adopted.name().to_string());
                        owned.push(adopted);
                    }
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }

    let claims: Vec<PersistentVolumeClaim> = store.list_as(namespace, None)?;
    let mut claims_by_id: HashMap<String, Vec<PersistentVolumeClaim>> = HashMap::new();
    for claim in claims {
        if !claim.metadata.is_controlled_by(&workload.uid) {
            continue;
        }
        if let Some(id) = claim.metadata.labels.get(LABEL_INSTANCE_ID) {
            claims_by_id.entry(id.clone()).or_default().push(claim);
        }
    }

    owned.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .cmp(&b.metadata.creation_timestamp)
            .then_with(|| a.name().cmp(b.name()))
    });

    let mut used = BTreeSet::new();
    let mut active = Vec::new();
    let mut terminating = Vec::new();
    for pod in owned {
        let instance_id = pod.metadata.labels.get(LABEL_INSTANCE_ID).cloned();
        let volumes = instance_id
            .as_ref()
            .and_then(|id| claims_by_id.remove(id))
            .unwrap_or_default();
        let terminating_pod = pod.metadata.is_terminating();
        let labelled = parse_ordinal(&pod);
        let ordinal = match labelled {
            Some(ordinal) if terminating_pod || used.insert(ordinal) => Some(ordinal),
            _ => None,
        };
        let unit = (pod, ordinal, instance_id, volumes);
        if terminating_pod {
            terminating.push(unit);
        } else {
            active.push(unit);
        }
    }

    // Unlabelled and duplicate units take the free ordinals in creation order
    // and keep them through a label patch.
    let mut next_free = 0u32;
    let mut assign = |ordinal: Option<u32>, used: &mut BTreeSet<u32>| -> u32 {
        if let Some(ordinal) = ordinal {
            return ordinal;
        }
        while used.contains(&next_free) {
            next_free += 1;
        }
        used.insert(next_free);
        next_free
    };
    for (mut pod, kept, instance_id, volumes) in active {
        let ordinal = assign(kept, &mut used);
        if kept.is_none() {
            let patch = json!({
                "metadata": { "labels": { LABEL_UNIT_ORDINAL: ordinal.to_string() } }
            });
            match store.patch_as::<Pod>(namespace, pod.name(), &patch) {
                Ok(patched) => pod = patched,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        inventory.active.push(Unit {
            pod,
            ordinal,
            instance_id,
            volumes,
        });
    }
    for (pod, ordinal, instance_id, volumes) in terminating {
        let ordinal = ordinal.unwrap_or(u32::MAX);
        inventory.terminating.push(Unit {
            pod,
            ordinal,
            instance_id,
            volumes,
        });
    }
    inventory.active.sort_by_key(|unit| unit.ordinal);

    inventory.orphan_volumes = claims_by_id.into_iter().collect();

    let active_count = inventory.active.len().to_string();
    let terminating_count = inventory.terminating.len().to_string();
    let orphan_count = inventory.orphan_volumes.len().to_string();
    log_debug(
        "unit-inventory",
        "Listed units",
        &[
            ("namespace", namespace),
            ("workload", workload.name.as_str()),
            ("active", active_count.as_str()),
            ("terminating", terminating_count.as_str()),
            ("orphanVolumes", orphan_count.as_str()),
        ],
    );
    Ok(inventory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armada::k8s::persistentvolumeclaim::PersistentVolumeClaimSpec;
    use crate::armada::k8s::pod::{ObjectMeta, PodSpec};
    use crate::armada::k8s::store::MemoryStore;
    use crate::armada::test_support::{cloneset, labels, owner_ref, TEST_NAMESPACE};

    fn seeded() -> (MemoryStore, CloneSet) {
        let store = MemoryStore::new();
        let set = store
            .create_as(TEST_NAMESPACE, &cloneset("web", 3, "nginx:1"))
            .unwrap();
        (store, set)
    }

    fn pod(name: &str, pairs: &[(&str, &str)], owner: Option<OwnerReference>) -> Pod {
        Pod::new(
            ObjectMeta {
                name: Some(name.to_string()),
                labels: labels(pairs),
                owner_references: owner.into_iter().collect(),
                ..Default::default()
            },
            PodSpec::default(),
        )
    }

    fn claim(name: &str, id: &str, owner: OwnerReference) -> PersistentVolumeClaim {
        PersistentVolumeClaim::new(
            ObjectMeta {
                name: Some(name.to_string()),
                labels: labels(&[(LABEL_INSTANCE_ID, id)]),
                owner_references: vec![owner],
                ..Default::default()
            },
            PersistentVolumeClaimSpec::default(),
        )
    }

    #[test]
    fn adopts_orphans_and_ignores_foreign_pods() {
        let (store, set) = seeded();
        let workload = WorkloadRef::for_cloneset(&set);
        let foreign = OwnerReference::controller_of("apps/v1", "ReplicaSet", "other", "uid-x");
        store
            .create_as(TEST_NAMESPACE, &pod("web-orphan", &[("app", "web")], None))
            .unwrap();
        store
            .create_as(
                TEST_NAMESPACE,
                &pod("web-foreign", &[("app", "web")], Some(foreign)),
            )
            .unwrap();
        store
            .create_as(TEST_NAMESPACE, &pod("db-orphan", &[("app", "db")], None))
            .unwrap();

        let inventory = list_units(&store, &workload, &set.spec.selector).unwrap();
        assert_eq!(inventory.adopted, vec!["web-orphan".to_string()]);
        assert_eq!(inventory.active.len(), 1);
        let stored: Pod = store.get_as(TEST_NAMESPACE, "web-orphan").unwrap();
        assert!(stored.metadata.is_controlled_by(&workload.uid));
    }

    #[test]
    fn releases_owned_pods_that_stop_matching() {
        let (store, set) = seeded();
        let workload = WorkloadRef::for_cloneset(&set);
        store
            .create_as(
                TEST_NAMESPACE,
                &pod("web-moved", &[("app", "other")], Some(owner_ref(&set))),
            )
            .unwrap();

        let inventory = list_units(&store, &workload, &set.spec.selector).unwrap();
        assert!(inventory.active.is_empty());
        assert_eq!(inventory.released, vec!["web-moved".to_string()]);
        let stored: Pod = store.get_as(TEST_NAMESPACE, "web-moved").unwrap();
        assert!(stored.metadata.owner_references.is_empty());
    }

    #[test]
    fn assigns_free_ordinals_in_creation_order() {
        let (store, set) = seeded();
        let workload = WorkloadRef::for_cloneset(&set);
        let owner = owner_ref(&set);
        store
            .create_as(
                TEST_NAMESPACE,
                &pod("web-a", &[("app", "web"), (LABEL_UNIT_ORDINAL, "1")], Some(owner.clone())),
            )
            .unwrap();
        store
            .create_as(TEST_NAMESPACE, &pod("web-b", &[("app", "web")], Some(owner.clone())))
            .unwrap();
        store
            .create_as(
                TEST_NAMESPACE,
                &pod("web-c", &[("app", "web"), (LABEL_UNIT_ORDINAL, "1")], Some(owner.clone())),
            )
            .unwrap();

        let inventory = list_units(&store, &workload, &set.spec.selector).unwrap();
        let ordinals: Vec<(&str, u32)> = inventory
            .active
            .iter()
            .map(|unit| (unit.name(), unit.ordinal))
            .collect();
        assert_eq!(ordinals, vec![("web-b", 0), ("web-a", 1), ("web-c", 2)]);

        // Assigned ordinals are written back, so the next listing agrees.
        let stored: Pod = store.get_as(TEST_NAMESPACE, "web-c").unwrap();
        assert_eq!(stored.metadata.labels[LABEL_UNIT_ORDINAL], "2");
        let again = list_units(&store, &workload, &set.spec.selector).unwrap();
        let ordinals: Vec<(&str, u32)> = again
            .active
            .iter()
            .map(|unit| (unit.name(), unit.ordinal))
            .collect();
        assert_eq!(ordinals, vec![("web-b", 0), ("web-a", 1), ("web-c", 2)]);
    }

    #[test]
    fn adopted_pods_keep_their_assigned_ordinal() {
        let (store, set) = seeded();
        let workload = WorkloadRef::for_cloneset(&set);
        store
            .create_as(
                TEST_NAMESPACE,
                &pod("web-a", &[("app", "web"), (LABEL_UNIT_ORDINAL, "1")], Some(owner_ref(&set))),
            )
            .unwrap();
        store
            .create_as(TEST_NAMESPACE, &pod("web-orphan", &[("app", "web")], None))
            .unwrap();

        let inventory = list_units(&store, &workload, &set.spec.selector).unwrap();
        assert_eq!(inventory.adopted, vec!["web-orphan".to_string()]);
        let adopted = inventory.find("web-orphan").unwrap();
        assert_eq!(adopted.ordinal, 0);
        assert_eq!(adopted.pod.metadata.labels[LABEL_UNIT_ORDINAL], "0");

        // A later pod claiming ordinal 0 is the duplicate, not the adopted unit.
        store
            .create_as(
                TEST_NAMESPACE,
                &pod("web-b", &[("app", "web"), (LABEL_UNIT_ORDINAL, "0")], Some(owner_ref(&set))),
            )
            .unwrap();
        let again = list_units(&store, &workload, &set.spec.selector).unwrap();
        assert_eq!(again.find("web-orphan").unwrap().ordinal, 0);
        assert_eq!(again.find("web-b").unwrap().ordinal, 2);
    }

    #[test]
    fn joins_claims_and_reports_orphans() {
        let (store, set) = seeded();
        let workload = WorkloadRef::for_cloneset(&set);
        let owner = owner_ref(&set);
        store
            .create_as(
                TEST_NAMESPACE,
                &pod("web-aaaaa", &[("app", "web"), (LABEL_INSTANCE_ID, "aaaaa")], Some(owner.clone())),
            )
            .unwrap();
        store
            .create_as(TEST_NAMESPACE, &claim("data-web-aaaaa", "aaaaa", owner.clone()))
            .unwrap();
        store
            .create_as(TEST_NAMESPACE, &claim("data-web-bbbbb", "bbbbb", owner))
            .unwrap();

        let inventory = list_units(&store, &workload, &set.spec.selector).unwrap();
        assert_eq!(inventory.active[0].volume_names(), vec!["data-web-aaaaa"]);
        assert_eq!(inventory.orphan_instance_ids(), vec!["bbbbb".to_string()]);
    }

    #[test]
    fn separates_terminating_units() {
        let (store, set) = seeded();
        let workload = WorkloadRef::for_cloneset(&set);
        store
            .create_as(TEST_NAMESPACE, &pod("web-a", &[("app", "web")], Some(owner_ref(&set))))
            .unwrap();
        store.delete(ResourceKind::Pod, TEST_NAMESPACE, "web-a").unwrap();

        let inventory = list_units(&store, &workload, &set.spec.selector).unwrap();
        assert!(inventory.active.is_empty());
        assert_eq!(inventory.terminating.len(), 1);
        assert!(inventory.find("web-a").is_some());
    }

    #[test]
    fn instance_ids_use_the_safe_alphabet() {
        let id = generate_instance_id();
        assert_eq!(id.len(), INSTANCE_ID_LENGTH);
        assert!(id.bytes().all(|byte| INSTANCE_ID_ALPHABET.contains(&byte)));
    }
}
