use armada::armada::config::ControllerConfig;
use armada::armada::controller::cloneset::CloneSetController;
use armada::armada::controller::error::ControllerError;
use armada::armada::controller::inplace::{read_state, REASON_START_INPLACE_UPDATE};
use armada::armada::controller::inventory::LABEL_UNIT_ORDINAL;
use armada::armada::controller::reconcile::DependencyHandle;
use armada::armada::controller::revision::LABEL_REVISION_HASH;
use armada::armada::controller::runtime::{ControllerRuntime, ControllerTarget};
use armada::armada::k8s::client::{ObjectStore, ObjectStoreExt, ResourceKind};
use armada::armada::k8s::cloneset::{CloneSet, CloneSetUpdateStrategyType, VolumeRetentionPolicy};
use armada::armada::k8s::event::{EventRecorder, MemoryEventRecorder};
use armada::armada::k8s::intstr::IntOrString;
use armada::armada::k8s::persistentvolumeclaim::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use armada::armada::k8s::pod::{ObjectMeta, Pod, PodSpec, CONDITION_IN_PLACE_UPDATE_READY};
use armada::armada::k8s::store::{MemoryStore, Verb};
use armada::armada::test_support::{cloneset, mark_ready, seconds_after_epoch, TEST_NAMESPACE};
use armada::armada::util::error::{ApiError, ErrorKind};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const SET_NAME: &str = "web";

struct ScenarioHarness {
    runtime: Arc<ControllerRuntime>,
    store: Arc<MemoryStore>,
    recorder: Arc<MemoryEventRecorder>,
    target: ControllerTarget,
}

impl ScenarioHarness {
    fn new(set: CloneSet) -> Self {
        let runtime = ControllerRuntime::new(ControllerConfig::default());
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(MemoryEventRecorder::new("cloneset-scenarios"));
        let dyn_store: Arc<dyn ObjectStore> = store.clone();
        let events: Arc<dyn EventRecorder> = recorder.clone();
        runtime.register_dependency(Arc::new(DependencyHandle::new(dyn_store)));
        runtime.register_dependency(Arc::new(DependencyHandle::new(events)));
        runtime.register_dependency(Arc::new(CloneSetController::new(runtime.config())));
        store.create_as(TEST_NAMESPACE, &set).expect("create CloneSet");
        Self {
            runtime,
            store,
            recorder,
            target: ControllerTarget::cloneset(Some(TEST_NAMESPACE), SET_NAME),
        }
    }

    fn pass(&self) -> Result<(), ControllerError> {
        self.runtime.reconcile(&self.target)
    }

    /// Plays the node agent: finishes pod deletions and reports every pod
    /// running the image its spec asks for.
    fn settle(&self) {
        self.store.finalize_terminating(ResourceKind::Pod);
        for mut pod in self.pods() {
            let image = pod.spec.containers[0].image.clone().unwrap_or_default();
            let running = pod
                .status
                .as_ref()
                .and_then(|status| status.container_statuses.first())
                .map(|status| status.ready && status.image.as_deref() == Some(image.as_str()))
                .unwrap_or(false);
            if running && pod.is_ready() {
                continue;
            }
            mark_ready(&mut pod, seconds_after_epoch(0), &format!("id-{image}"));
            self.store.update_as(TEST_NAMESPACE, &pod).expect("report pod status");
        }
    }

    /// Alternates passes and node-agent reports until neither writes.
    fn converge(&self) {
        for _ in 0..40 {
            self.store.reset_call_counts();
            self.pass().expect("reconcile pass");
            self.settle();
            if self.store.mutation_count() == 0 {
                return;
            }
        }
        panic!("CloneSet did not converge");
    }

    fn pods(&self) -> Vec<Pod> {
        let mut pods: Vec<Pod> = self.store.list_as(TEST_NAMESPACE, None).expect("list pods");
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        pods
    }

    fn pod_names(&self) -> BTreeSet<String> {
        self.pods().iter().map(|pod| pod.name().to_string()).collect()
    }

    fn set(&self) -> CloneSet {
        self.store.get_as(TEST_NAMESPACE, SET_NAME).expect("get CloneSet")
    }

    fn update_spec(&self, f: impl FnOnce(&mut CloneSet)) {
        let mut set = self.set();
        f(&mut set);
        self.store.update_as(TEST_NAMESPACE, &set).expect("update CloneSet");
    }

    fn revisions_of_pods(&self) -> Vec<String> {
        self.pods()
            .iter()
            .map(|pod| pod.metadata.labels[LABEL_REVISION_HASH].clone())
            .collect()
    }
}

fn data_claim_template() -> PersistentVolumeClaim {
    PersistentVolumeClaim::new(
        ObjectMeta {
            name: Some("data".to_string()),
            ..Default::default()
        },
        PersistentVolumeClaimSpec::default(),
    )
}

fn claim_names(harness: &ScenarioHarness) -> BTreeSet<String> {
    let claims: Vec<PersistentVolumeClaim> =
        harness.store.list_as(TEST_NAMESPACE, None).expect("list claims");
    claims.iter().map(|claim| claim.name().to_string()).collect()
}

fn mounted_claims(pod: &Pod) -> BTreeSet<String> {
    pod.spec
        .volumes
        .iter()
        .filter_map(|volume| volume.persistent_volume_claim.as_ref())
        .map(|source| source.claim_name.clone())
        .collect()
}

fn set_with(replicas: u32, f: impl FnOnce(&mut CloneSet)) -> CloneSet {
    let mut set = cloneset(SET_NAME, replicas, "nginx:1");
    f(&mut set);
    set
}

#[test]
fn scenario_cloneset_scale_up_from_zero_reaches_ready_status() {
    let harness = ScenarioHarness::new(cloneset(SET_NAME, 3, "nginx:1"));
    harness.pass().expect("first pass");
    assert_eq!(harness.pods().len(), 3);

    harness.converge();
    let status = harness.set().status.expect("status");
    assert_eq!(status.replicas, 3);
    assert_eq!(status.ready_replicas, 3);
    assert_eq!(status.available_replicas, 3);
    assert_eq!(status.updated_replicas, 3);
    assert_eq!(status.current_revision, status.update_revision);
    for pod in harness.pods() {
        assert!(pod
            .condition(CONDITION_IN_PLACE_UPDATE_READY)
            .map(|condition| condition.is_true())
            .unwrap_or(false));
    }
    let ordinals: BTreeSet<String> = harness
        .pods()
        .iter()
        .map(|pod| pod.metadata.labels[LABEL_UNIT_ORDINAL].clone())
        .collect();
    assert_eq!(ordinals.len(), 3);
}

#[test]
fn scenario_cloneset_converged_pass_does_nothing() {
    let harness = ScenarioHarness::new(cloneset(SET_NAME, 2, "nginx:1"));
    harness.converge();

    harness.store.reset_call_counts();
    harness.pass().expect("steady pass");
    assert_eq!(harness.store.mutation_count(), 0);
    harness.pass().expect("second steady pass");
    assert_eq!(harness.store.mutation_count(), 0);
}

#[test]
fn scenario_cloneset_in_place_image_update_keeps_units() {
    let harness = ScenarioHarness::new(set_with(3, |set| {
        set.spec.update_strategy.max_unavailable = Some(IntOrString::Int(1));
    }));
    harness.converge();
    let names = harness.pod_names();
    let old_revision = harness.set().status.unwrap().update_revision.unwrap();

    harness.update_spec(|set| {
        set.spec.template.spec.containers[0].image = Some("nginx:2".to_string());
    });
    harness.pass().expect("update pass");

    let patched: Vec<Pod> = harness
        .pods()
        .into_iter()
        .filter(|pod| pod.metadata.labels[LABEL_REVISION_HASH] != old_revision)
        .collect();
    assert_eq!(patched.len(), 1);
    let pod = &patched[0];
    assert_eq!(pod.spec.containers[0].image.as_deref(), Some("nginx:2"));
    let condition = pod.condition(CONDITION_IN_PLACE_UPDATE_READY).unwrap();
    assert!(!condition.is_true());
    assert_eq!(condition.reason.as_deref(), Some(REASON_START_INPLACE_UPDATE));
    let state = read_state(pod).unwrap().expect("in-place state annotation");
    assert_eq!(state.last_container_statuses["main"].image_id, "id-nginx:1");

    harness.converge();
    assert_eq!(harness.pod_names(), names);
    let status = harness.set().status.unwrap();
    assert_ne!(status.update_revision.as_deref(), Some(old_revision.as_str()));
    assert_eq!(status.current_revision, status.update_revision);
    assert_eq!(status.updated_ready_replicas, 3);
    for pod in harness.pods() {
        assert_eq!(pod.spec.containers[0].image.as_deref(), Some("nginx:2"));
        assert!(pod.condition(CONDITION_IN_PLACE_UPDATE_READY).unwrap().is_true());
    }
    assert!(harness
        .recorder
        .reasons()
        .contains(&"SuccessfulUpdatePodInPlace".to_string()));
}

#[test]
fn scenario_cloneset_update_budget_counts_in_flight_units() {
    let harness = ScenarioHarness::new(set_with(10, |set| {
        set.spec.update_strategy.max_unavailable = Some(IntOrString::Int(2));
    }));
    harness.converge();
    let old_revision = harness.set().status.unwrap().update_revision.unwrap();

    harness.update_spec(|set| {
        set.spec.template.spec.containers[0].image = Some("nginx:2".to_string());
    });
    harness.pass().expect("first update pass");
    harness.pass().expect("second update pass");

    let moved = harness
        .revisions_of_pods()
        .into_iter()
        .filter(|revision| *revision != old_revision)
        .count();
    assert_eq!(moved, 2);
}

#[test]
fn scenario_cloneset_recreate_replaces_unit_and_its_claim() {
    let harness = ScenarioHarness::new(set_with(1, |set| {
        set.spec.update_strategy.r#type = CloneSetUpdateStrategyType::Recreate;
        set.spec.volume_claim_templates.push(data_claim_template());
    }));
    harness.converge();
    let before = harness.pod_names();
    let claims_before: Vec<PersistentVolumeClaim> =
        harness.store.list_as(TEST_NAMESPACE, None).unwrap();
    assert_eq!(claims_before.len(), 1);

    harness.update_spec(|set| {
        set.spec.template.spec.containers[0].image = Some("nginx:2".to_string());
    });
    harness.pass().expect("recreate pass");
    assert!(harness.pods()[0].metadata.is_terminating());
    assert_eq!(harness.store.count(ResourceKind::PersistentVolumeClaim), 0);

    harness.converge();
    let after = harness.pod_names();
    assert_eq!(after.len(), 1);
    assert!(before.is_disjoint(&after));
    let claims_after: Vec<PersistentVolumeClaim> =
        harness.store.list_as(TEST_NAMESPACE, None).unwrap();
    assert_eq!(claims_after.len(), 1);
    assert_ne!(claims_after[0].name(), claims_before[0].name());
    assert_eq!(harness.pods()[0].spec.containers[0].image.as_deref(), Some("nginx:2"));
}

#[test]
fn scenario_cloneset_partition_freezes_low_ordinals() {
    let harness = ScenarioHarness::new(set_with(4, |set| {
        set.spec.update_strategy.max_unavailable = Some(IntOrString::percent(100));
        set.spec.update_strategy.partition = Some(IntOrString::Int(2));
    }));
    harness.converge();
    let old_revision = harness.set().status.unwrap().update_revision.unwrap();

    harness.update_spec(|set| {
        set.spec.template.spec.containers[0].image = Some("nginx:2".to_string());
    });
    harness.converge();

    for pod in harness.pods() {
        let ordinal: u32 = pod.metadata.labels[LABEL_UNIT_ORDINAL].parse().unwrap();
        let revision = &pod.metadata.labels[LABEL_REVISION_HASH];
        if ordinal < 2 {
            assert_eq!(revision, &old_revision);
        } else {
            assert_ne!(revision, &old_revision);
        }
    }
    let status = harness.set().status.unwrap();
    assert_eq!(status.updated_replicas, 2);
    assert_eq!(status.current_revision.as_deref(), Some(old_revision.as_str()));
}

#[test]
fn scenario_cloneset_replaced_frozen_unit_keeps_current_revision() {
    let harness = ScenarioHarness::new(set_with(4, |set| {
        set.spec.update_strategy.max_unavailable = Some(IntOrString::percent(100));
        set.spec.update_strategy.partition = Some(IntOrString::Int(2));
    }));
    harness.converge();
    let old_revision = harness.set().status.unwrap().update_revision.unwrap();

    harness.update_spec(|set| {
        set.spec.template.spec.containers[0].image = Some("nginx:2".to_string());
    });
    harness.converge();

    let frozen = harness
        .pods()
        .into_iter()
        .find(|pod| pod.metadata.labels[LABEL_UNIT_ORDINAL] == "0")
        .expect("unit at ordinal 0");
    harness
        .store
        .delete(ResourceKind::Pod, TEST_NAMESPACE, frozen.name())
        .expect("evict frozen unit");
    harness.converge();

    let replacement = harness
        .pods()
        .into_iter()
        .find(|pod| pod.metadata.labels[LABEL_UNIT_ORDINAL] == "0")
        .expect("replacement at ordinal 0");
    assert_ne!(replacement.name(), frozen.name());
    assert_eq!(replacement.metadata.labels[LABEL_REVISION_HASH], old_revision);
    assert_eq!(replacement.spec.containers[0].image.as_deref(), Some("nginx:1"));
    let status = harness.set().status.unwrap();
    assert_eq!(status.replicas, 4);
    assert_eq!(status.updated_replicas, 2);
    assert_eq!(status.current_revision.as_deref(), Some(old_revision.as_str()));
}

#[test]
fn scenario_cloneset_retained_claims_follow_the_replacement() {
    let harness = ScenarioHarness::new(set_with(1, |set| {
        set.spec.update_strategy.r#type = CloneSetUpdateStrategyType::Recreate;
        set.spec.scale_strategy.volume_retention_policy = VolumeRetentionPolicy::Retain;
        set.spec.volume_claim_templates.push(data_claim_template());
    }));
    harness.converge();
    let claims = claim_names(&harness);
    assert_eq!(claims.len(), 1);

    harness.update_spec(|set| {
        set.spec.template.spec.containers[0].image = Some("nginx:2".to_string());
    });
    harness.pass().expect("recreate pass");
    assert!(harness.pods()[0].metadata.is_terminating());
    assert_eq!(claim_names(&harness), claims);

    harness.converge();
    let pods = harness.pods();
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0].spec.containers[0].image.as_deref(), Some("nginx:2"));
    assert_eq!(mounted_claims(&pods[0]), claims);
    assert_eq!(claim_names(&harness), claims);

    harness.update_spec(|set| set.spec.replicas = 0);
    harness.converge();
    assert!(harness.pods().is_empty());
    assert_eq!(claim_names(&harness), claims);

    harness.update_spec(|set| set.spec.replicas = 1);
    harness.converge();
    assert_eq!(mounted_claims(&harness.pods()[0]), claims);
    assert_eq!(harness.store.count(ResourceKind::PersistentVolumeClaim), 1);
}

#[test]
fn scenario_cloneset_in_place_round_trip_restores_units() {
    let harness = ScenarioHarness::new(cloneset(SET_NAME, 3, "nginx:1"));
    harness.converge();
    let before: BTreeMap<String, PodSpec> = harness
        .pods()
        .into_iter()
        .map(|pod| (pod.name().to_string(), pod.spec))
        .collect();
    let revisions_before = harness.revisions_of_pods();

    harness.update_spec(|set| {
        set.spec.template.spec.containers[0].image = Some("nginx:2".to_string());
    });
    harness.converge();
    assert!(harness
        .pods()
        .iter()
        .all(|pod| pod.spec.containers[0].image.as_deref() == Some("nginx:2")));

    harness.update_spec(|set| {
        set.spec.template.spec.containers[0].image = Some("nginx:1".to_string());
    });
    harness.converge();

    let after: BTreeMap<String, PodSpec> = harness
        .pods()
        .into_iter()
        .map(|pod| (pod.name().to_string(), pod.spec))
        .collect();
    assert_eq!(after, before);
    assert_eq!(harness.revisions_of_pods(), revisions_before);
    let status = harness.set().status.unwrap();
    assert_eq!(status.current_revision.as_deref(), Some(revisions_before[0].as_str()));
    assert_eq!(status.current_revision, status.update_revision);
}

#[test]
fn scenario_cloneset_scale_down_honours_pods_to_delete() {
    let harness = ScenarioHarness::new(cloneset(SET_NAME, 3, "nginx:1"));
    harness.converge();
    let victim = harness.pods()[1].name().to_string();

    harness.update_spec(|set| {
        set.spec.replicas = 2;
        set.spec.scale_strategy.pods_to_delete = vec![victim.clone()];
    });
    harness.converge();

    let names = harness.pod_names();
    assert_eq!(names.len(), 2);
    assert!(!names.contains(&victim));
}

#[test]
fn scenario_cloneset_in_place_only_reports_blocked_units() {
    let harness = ScenarioHarness::new(set_with(2, |set| {
        set.spec.update_strategy.r#type = CloneSetUpdateStrategyType::InPlaceOnly;
    }));
    harness.converge();
    let names = harness.pod_names();

    harness.update_spec(|set| {
        set.spec
            .template
            .spec
            .node_selector
            .insert("disk".to_string(), "ssd".to_string());
    });
    harness.pass().expect("blocked update is not an error");

    assert_eq!(harness.pod_names(), names);
    assert!(harness.pods().iter().all(|pod| !pod.metadata.is_terminating()));
    let conditions = harness.set().status.unwrap().conditions;
    let failed = conditions
        .iter()
        .find(|condition| condition.condition_type == "FailedUpdate")
        .expect("FailedUpdate condition");
    assert!(failed.is_true());
    assert_eq!(failed.reason.as_deref(), Some("InPlaceUnsupported"));
}

#[test]
fn scenario_cloneset_paused_update_holds_revision() {
    let harness = ScenarioHarness::new(cloneset(SET_NAME, 2, "nginx:1"));
    harness.converge();
    let old_revision = harness.set().status.unwrap().update_revision.unwrap();

    harness.update_spec(|set| {
        set.spec.update_strategy.paused = true;
        set.spec.template.spec.containers[0].image = Some("nginx:2".to_string());
    });
    harness.converge();

    assert!(harness
        .revisions_of_pods()
        .iter()
        .all(|revision| *revision == old_revision));
    let status = harness.set().status.unwrap();
    assert_eq!(status.updated_replicas, 0);
    assert_ne!(status.update_revision, status.current_revision);
}

#[test]
fn scenario_cloneset_failed_create_stops_slow_start() {
    let harness = ScenarioHarness::new(cloneset(SET_NAME, 5, "nginx:1"));
    harness.store.inject_fault(
        ResourceKind::Pod,
        Verb::Create,
        ApiError::new(ErrorKind::Internal, "etcd unavailable"),
    );

    let err = harness.pass().expect_err("create failure surfaces");
    assert!(!err.is_terminal());
    assert!(harness.pods().is_empty());
    let conditions = harness.set().status.unwrap().conditions;
    assert_eq!(conditions[0].condition_type, "FailedScale");
    assert_eq!(conditions[0].reason.as_deref(), Some("CreateFailed"));
    assert!(harness.recorder.reasons().contains(&"FailedCreate".to_string()));

    harness.converge();
    assert_eq!(harness.pods().len(), 5);
    assert!(harness.set().status.unwrap().conditions.is_empty());
}

#[test]
fn scenario_cloneset_lost_create_response_is_not_repeated() {
    let harness = ScenarioHarness::new(cloneset(SET_NAME, 1, "nginx:1"));
    harness.store.inject_lost_response(ResourceKind::Pod, Verb::Create);
    harness.pass().expect("timeouts are not pass failures");
    assert_eq!(harness.pods().len(), 1);

    harness.converge();
    assert_eq!(harness.pods().len(), 1);
    assert_eq!(harness.store.count(ResourceKind::Pod), 1);
}

#[test]
fn scenario_cloneset_invalid_strategy_is_terminal() {
    let harness = ScenarioHarness::new(set_with(2, |set| {
        set.spec.update_strategy.partition = Some(IntOrString::String("half".to_string()));
    }));
    let err = harness.pass().expect_err("invalid partition");
    assert!(err.is_terminal());
    assert!(harness.pods().is_empty());
    assert!(harness.recorder.reasons().contains(&"InvalidSpec".to_string()));
}
