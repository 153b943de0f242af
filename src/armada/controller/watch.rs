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

//! Routes store change notifications to the work queue.
//!
//! Units and claims are traced to the CloneSet that controls them, subset
//! objects to their UnitedDeployment. Unit events also settle the CloneSet
//! expectations so the next pass does not wait for a full listing.

use crate::armada::controller::expectations::{Expectations, ObservedUnit};
use crate::armada::controller::revision::LABEL_REVISION_HASH;
use crate::armada::controller::runtime::{ControllerTarget, WorkQueue};
use crate::armada::k8s::client::{ObjectStore, ObjectStoreExt, ResourceKind, WatchEvent, WatchEventType};
use crate::armada::k8s::cloneset::{CloneSet, CLONESET_KIND};
use crate::armada::k8s::pod::ObjectMeta;
use crate::armada::k8s::store::normalize_namespace;
use crate::armada::k8s::uniteddeployment::{UnitedDeployment, UNITED_DEPLOYMENT_KIND};
use crate::armada::logger::{log_debug, log_warn};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const COMPONENT: &str = "controller-watch";

pub struct WatchDispatcher {
    store: Arc<dyn ObjectStore>,
    queue: WorkQueue<ControllerTarget>,
    expectations: Arc<Expectations>,
    /// Namespaces seen so far; a resync lists workloads in each.
    namespaces: Mutex<BTreeSet<String>>,
}

impl WatchDispatcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        queue: WorkQueue<ControllerTarget>,
        expectations: Arc<Expectations>,
    ) -> Self {
        Self {
            store,
            queue,
            expectations,
            namespaces: Mutex::new(BTreeSet::new()),
        }
    }

    /// Consumes `receiver` until the feed closes. A lagging receiver
    /// resyncs every known workload.
    pub fn spawn(self: Arc<Self>, mut receiver: broadcast::Receiver<WatchEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        self.dispatch(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let skipped = skipped.to_string();
                        log_warn(
                            COMPONENT,
                            "Watch feed lagged; resyncing workloads",
                            &[("skipped", skipped.as_str())],
                        );
                        self.resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Routes one event; returns the target enqueued, if any.
    pub fn dispatch(&self, event: &WatchEvent) -> Option<ControllerTarget> {
        let metadata = event.metadata()?;
        let namespace = normalize_namespace(metadata.namespace.as_deref());
        self.remember(&namespace);
        let target = match event.kind {
            ResourceKind::CloneSet => Some(ControllerTarget::cloneset(
                Some(&namespace),
                metadata.name_or_empty(),
            )),
            ResourceKind::UnitedDeployment => Some(ControllerTarget::united_deployment(
                Some(&namespace),
                metadata.name_or_empty(),
            )),
            ResourceKind::Pod => {
                let target = self.owning_cloneset(&namespace, &metadata);
                if let Some(target) = target.as_ref() {
                    self.settle(&target.key(), event.event_type, &metadata);
                }
                target
            }
            ResourceKind::PersistentVolumeClaim => self.owning_cloneset(&namespace, &metadata),
            ResourceKind::StatefulSet | ResourceKind::Deployment => metadata
                .controller_ref()
                .filter(|owner| owner.kind == UNITED_DEPLOYMENT_KIND)
                .map(|owner| ControllerTarget::united_deployment(Some(&namespace), &owner.name)),
            ResourceKind::ControllerRevision => None,
        }?;
        log_debug(
            COMPONENT,
            "Enqueued workload",
            &[
                ("target", target.to_string().as_str()),
                ("kind", event.kind.kind()),
            ],
        );
        self.queue.add(target.clone());
        Some(target)
    }

    /// Owned units map to their controller. Orphans wake every CloneSet in
    /// the namespace whose selector matches, so they can be adopted.
    fn owning_cloneset(&self, namespace: &str, metadata: &ObjectMeta) -> Option<ControllerTarget> {
        if let Some(owner) = metadata.controller_ref() {
            return (owner.kind == CLONESET_KIND)
                .then(|| ControllerTarget::cloneset(Some(namespace), &owner.name));
        }
        let sets: Vec<CloneSet> = match self.store.list_as(namespace, None) {
            Ok(sets) => sets,
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "Failed to list CloneSets for orphan",
                    &[("error", err.to_string().as_str())],
                );
                return None;
            }
        };
        let mut matching = sets
            .iter()
            .filter(|set| set.spec.selector.matches(&metadata.labels))
            .map(|set| ControllerTarget::cloneset(Some(namespace), set.name()));
        let first = matching.next();
        for extra in matching {
            self.queue.add(extra);
        }
        first
    }

    fn settle(&self, key: &str, event_type: WatchEventType, metadata: &ObjectMeta) {
        let name = metadata.name_or_empty();
        match event_type {
            WatchEventType::Deleted => self.expectations.unit_gone(key, name),
            WatchEventType::Added | WatchEventType::Modified => self.expectations.observe_unit(
                key,
                ObservedUnit {
                    name,
                    terminating: metadata.is_terminating(),
                    revision: metadata.labels.get(LABEL_REVISION_HASH).map(String::as_str),
                },
            ),
        }
    }

    fn remember(&self, namespace: &str) {
        let mut namespaces = self
            .namespaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !namespaces.contains(namespace) {
            namespaces.insert(namespace.to_string());
        }
    }

    /// Enqueues every CloneSet and UnitedDeployment in the known namespaces.
    pub fn resync(&self) -> usize {
        let namespaces: Vec<String> = self
            .namespaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect();
        let mut enqueued = 0;
        for namespace in namespaces {
            match self.store.list_as::<CloneSet>(&namespace, None) {
                Ok(sets) => {
                    for set in sets {
                        self.queue
                            .add(ControllerTarget::cloneset(Some(&namespace), set.name()));
                        enqueued += 1;
                    }
                }
                Err(err) => log_warn(
                    COMPONENT,
                    "Resync failed to list CloneSets",
                    &[("namespace", namespace.as_str()), ("error", err.to_string().as_str())],
                ),
            }
            match self.store.list_as::<UnitedDeployment>(&namespace, None) {
                Ok(deployments) => {
                    for ud in deployments {
                        self.queue.add(ControllerTarget::united_deployment(
                            Some(&namespace),
                            ud.name(),
                        ));
                        enqueued += 1;
                    }
                }
                Err(err) => log_warn(
                    COMPONENT,
                    "Resync failed to list UnitedDeployments",
                    &[("namespace", namespace.as_str()), ("error", err.to_string().as_str())],
                ),
            }
        }
        enqueued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armada::controller::inventory::WorkloadRef;
    use crate::armada::k8s::pod::{OwnerReference, Pod, PodSpec};
    use crate::armada::k8s::store::MemoryStore;
    use crate::armada::test_support::{cloneset, labels, united_deployment, TEST_NAMESPACE};
    use std::time::Duration;

    fn dispatcher() -> (WatchDispatcher, Arc<MemoryStore>, WorkQueue<ControllerTarget>, Arc<Expectations>) {
        let store = Arc::new(MemoryStore::new());
        let queue = WorkQueue::new(Duration::from_millis(1), Duration::from_millis(8));
        let expectations = Arc::new(Expectations::new("test", Duration::from_secs(300)));
        let dyn_store: Arc<dyn ObjectStore> = store.clone();
        let dispatcher = WatchDispatcher::new(dyn_store, queue.clone(), Arc::clone(&expectations));
        (dispatcher, store, queue, expectations)
    }

    fn pod_event(event_type: WatchEventType, pod: &Pod) -> WatchEvent {
        WatchEvent {
            event_type,
            kind: ResourceKind::Pod,
            object: serde_json::to_value(pod).unwrap(),
        }
    }

    fn pod(name: &str, owner: Option<OwnerReference>, revision: &str) -> Pod {
        Pod::new(
            ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(TEST_NAMESPACE.to_string()),
                labels: labels(&[("app", "web"), (LABEL_REVISION_HASH, revision)]),
                owner_references: owner.into_iter().collect(),
                ..Default::default()
            },
            PodSpec::default(),
        )
    }

    #[test]
    fn owned_units_route_to_their_cloneset_and_settle_expectations() {
        let (dispatcher, store, queue, expectations) = dispatcher();
        let set = store
            .create_as(TEST_NAMESPACE, &cloneset("web", 1, "nginx:1"))
            .unwrap();
        let owner = WorkloadRef::for_cloneset(&set).owner_reference();
        expectations.expect_creations("default/web", &["web-a".to_string()]);

        let target = dispatcher
            .dispatch(&pod_event(WatchEventType::Added, &pod("web-a", Some(owner), "rev-1")))
            .unwrap();
        assert_eq!(target, ControllerTarget::cloneset(Some(TEST_NAMESPACE), "web"));
        assert_eq!(queue.len(), 1);
        assert!(expectations.satisfied("default/web"));
    }

    #[test]
    fn orphans_wake_matching_clonesets() {
        let (dispatcher, store, _queue, _) = dispatcher();
        store
            .create_as(TEST_NAMESPACE, &cloneset("web", 1, "nginx:1"))
            .unwrap();
        let target = dispatcher.dispatch(&pod_event(WatchEventType::Added, &pod("stray", None, "rev-1")));
        assert_eq!(target, Some(ControllerTarget::cloneset(Some(TEST_NAMESPACE), "web")));
    }

    #[test]
    fn subset_objects_route_to_their_united_deployment() {
        let (dispatcher, store, queue, _) = dispatcher();
        let ud = store
            .create_as(TEST_NAMESPACE, &united_deployment("web", 2, "nginx:1", &["zone-a"]))
            .unwrap();
        let owner = WorkloadRef::for_united_deployment(&ud).owner_reference();
        let event = WatchEvent {
            event_type: WatchEventType::Modified,
            kind: ResourceKind::StatefulSet,
            object: serde_json::json!({
                "metadata": {
                    "name": "web-zone-a",
                    "namespace": TEST_NAMESPACE,
                    "ownerReferences": [serde_json::to_value(owner).unwrap()],
                }
            }),
        };
        assert_eq!(
            dispatcher.dispatch(&event),
            Some(ControllerTarget::united_deployment(Some(TEST_NAMESPACE), "web"))
        );
        assert_eq!(dispatcher.resync(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn lagged_feed_resyncs_known_workloads() {
        let (dispatcher, store, queue, _) = dispatcher();
        let dispatcher = Arc::new(dispatcher);
        let (sender, receiver) = broadcast::channel(2);
        store
            .create_as(TEST_NAMESPACE, &cloneset("web", 1, "nginx:1"))
            .unwrap();
        store
            .create_as(TEST_NAMESPACE, &cloneset("api", 1, "nginx:1"))
            .unwrap();
        for name in ["web", "web", "web"] {
            let set: CloneSet = store.get_as(TEST_NAMESPACE, name).unwrap();
            sender
                .send(WatchEvent {
                    event_type: WatchEventType::Modified,
                    kind: ResourceKind::CloneSet,
                    object: serde_json::to_value(&set).unwrap(),
                })
                .unwrap();
        }
        dispatcher.remember(TEST_NAMESPACE);
        drop(sender);
        Arc::clone(&dispatcher).spawn(receiver).await.unwrap();

        let mut drained = Vec::new();
        while !queue.is_empty() {
            let target = queue.next().await.unwrap();
            drained.push(target.to_string());
        }
        drained.sort();
        assert_eq!(drained, vec!["CloneSet/default/api", "CloneSet/default/web"]);
    }
}
