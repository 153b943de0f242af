use armada::armada::config::ControllerConfig;
use armada::armada::controller::error::ControllerError;
use armada::armada::controller::reconcile::DependencyHandle;
use armada::armada::controller::revision::LABEL_REVISION_HASH;
use armada::armada::controller::runtime::{ControllerRuntime, ControllerTarget};
use armada::armada::controller::uniteddeployment::UnitedDeploymentController;
use armada::armada::k8s::client::{ObjectStore, ObjectStoreExt, ResourceKind};
use armada::armada::k8s::deployment::{Deployment, DeploymentSpec};
use armada::armada::k8s::event::{EventRecorder, MemoryEventRecorder};
use armada::armada::k8s::intstr::IntOrString;
use armada::armada::k8s::statefulset::StatefulSet;
use armada::armada::k8s::store::MemoryStore;
use armada::armada::k8s::uniteddeployment::{DeploymentTemplateSpec, UnitedDeployment};
use armada::armada::test_support::{united_deployment, TEST_NAMESPACE};
use std::sync::Arc;

const UD_NAME: &str = "web";

struct ScenarioHarness {
    runtime: Arc<ControllerRuntime>,
    store: Arc<MemoryStore>,
    recorder: Arc<MemoryEventRecorder>,
    target: ControllerTarget,
}

impl ScenarioHarness {
    fn new(ud: UnitedDeployment) -> Self {
        let runtime = ControllerRuntime::new(ControllerConfig::default());
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(MemoryEventRecorder::new("uniteddeployment-scenarios"));
        let dyn_store: Arc<dyn ObjectStore> = store.clone();
        let events: Arc<dyn EventRecorder> = recorder.clone();
        runtime.register_dependency(Arc::new(DependencyHandle::new(dyn_store)));
        runtime.register_dependency(Arc::new(DependencyHandle::new(events)));
        runtime.register_dependency(Arc::new(UnitedDeploymentController::new(runtime.config())));
        store.create_as(TEST_NAMESPACE, &ud).expect("create UnitedDeployment");
        Self {
            runtime,
            store,
            recorder,
            target: ControllerTarget::united_deployment(Some(TEST_NAMESPACE), UD_NAME),
        }
    }

    fn pass(&self) -> Result<(), ControllerError> {
        self.runtime.reconcile(&self.target)
    }

    /// Runs passes until one leaves the store untouched.
    fn converge(&self) {
        for _ in 0..10 {
            self.store.reset_call_counts();
            self.pass().expect("reconcile pass");
            if self.store.mutation_count() == 0 {
                return;
            }
        }
        panic!("UnitedDeployment did not converge");
    }

    fn ud(&self) -> UnitedDeployment {
        self.store.get_as(TEST_NAMESPACE, UD_NAME).expect("get UnitedDeployment")
    }

    fn update_spec(&self, f: impl FnOnce(&mut UnitedDeployment)) {
        let mut ud = self.ud();
        f(&mut ud);
        self.store.update_as(TEST_NAMESPACE, &ud).expect("update UnitedDeployment");
    }

    fn statefulsets(&self) -> Vec<StatefulSet> {
        let mut sets: Vec<StatefulSet> = self.store.list_as(TEST_NAMESPACE, None).expect("list");
        sets.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        sets
    }

    fn statefulset_replicas(&self) -> Vec<(String, i32)> {
        self.statefulsets()
            .into_iter()
            .map(|set| (set.metadata.name_or_empty().to_string(), set.spec.replicas))
            .collect()
    }
}

#[test]
fn scenario_united_deployment_spreads_and_rescales_subsets() {
    let harness = ScenarioHarness::new(united_deployment(UD_NAME, 5, "nginx:1", &["zone-a", "zone-b"]));
    harness.converge();
    assert_eq!(
        harness.statefulset_replicas(),
        vec![("web-zone-a".to_string(), 3), ("web-zone-b".to_string(), 2)]
    );
    for set in harness.statefulsets() {
        let zone = set.metadata.name_or_empty().trim_start_matches("web-").to_string();
        assert_eq!(
            set.spec.template.spec.node_selector.get("topology.kubernetes.io/zone"),
            Some(&zone)
        );
    }

    harness.update_spec(|ud| ud.spec.replicas = Some(10));
    harness.converge();
    assert_eq!(
        harness.statefulset_replicas(),
        vec![("web-zone-a".to_string(), 5), ("web-zone-b".to_string(), 5)]
    );
    let status = harness.ud().status.expect("status");
    assert_eq!(status.subset_replicas.get("zone-a"), Some(&5));
    assert_eq!(status.subset_replicas.get("zone-b"), Some(&5));
    let provisioned = status
        .conditions
        .iter()
        .find(|condition| condition.condition_type == "SubsetProvisioned")
        .expect("SubsetProvisioned condition");
    assert!(provisioned.is_true());
}

#[test]
fn scenario_united_deployment_fixed_and_unspecified_shares() {
    let mut ud = united_deployment(UD_NAME, 10, "nginx:1", &["zone-a", "zone-b", "zone-c"]);
    ud.spec.topology.subsets[0].replicas = Some(IntOrString::Int(4));
    ud.spec.topology.subsets[1].replicas = Some(IntOrString::percent(30));
    let harness = ScenarioHarness::new(ud);
    harness.converge();
    assert_eq!(
        harness.statefulset_replicas(),
        vec![
            ("web-zone-a".to_string(), 4),
            ("web-zone-b".to_string(), 3),
            ("web-zone-c".to_string(), 3),
        ]
    );
}

#[test]
fn scenario_united_deployment_manual_partition_holds_current_revision() {
    let harness = ScenarioHarness::new(united_deployment(UD_NAME, 4, "nginx:1", &["zone-a", "zone-b"]));
    harness.converge();
    let first = harness.ud().status.unwrap().current_revision.unwrap();

    harness.update_spec(|ud| {
        let manual = ud.spec.strategy.manual_update.get_or_insert_with(Default::default);
        manual.partitions.insert("zone-a".to_string(), 2);
        ud.spec
            .template
            .stateful_set_template
            .as_mut()
            .unwrap()
            .spec
            .template
            .spec
            .containers[0]
            .image = Some("nginx:2".to_string());
    });
    harness.converge();

    let sets = harness.statefulsets();
    let update = harness
        .ud()
        .status
        .unwrap()
        .update_status
        .unwrap()
        .updated_revision
        .unwrap();
    assert_ne!(update, first);
    for set in &sets {
        assert_eq!(set.metadata.labels[LABEL_REVISION_HASH], update);
        assert_eq!(set.spec.template.spec.containers[0].image.as_deref(), Some("nginx:2"));
    }
    assert_eq!(sets[0].spec.update_strategy.partition(), 2);
    assert_eq!(sets[1].spec.update_strategy.partition(), 0);
    let status = harness.ud().status.unwrap();
    assert_eq!(status.current_revision.as_deref(), Some(first.as_str()));
    assert_eq!(status.update_status.unwrap().current_partitions.get("zone-a"), Some(&2));

    harness.update_spec(|ud| {
        ud.spec.strategy.manual_update = None;
    });
    harness.converge();
    assert!(harness
        .statefulsets()
        .iter()
        .all(|set| set.spec.update_strategy.partition() == 0));
    assert_eq!(harness.ud().status.unwrap().current_revision, Some(update));
}

#[test]
fn scenario_united_deployment_template_kind_switch_replaces_subsets() {
    let harness = ScenarioHarness::new(united_deployment(UD_NAME, 4, "nginx:1", &["zone-a", "zone-b"]));
    harness.converge();
    assert_eq!(harness.store.count(ResourceKind::StatefulSet), 2);

    harness.update_spec(|ud| {
        let template = ud.spec.template.stateful_set_template.take().unwrap();
        ud.spec.template.deployment_template = Some(DeploymentTemplateSpec {
            metadata: template.metadata,
            spec: DeploymentSpec {
                selector: template.spec.selector,
                template: template.spec.template,
                ..Default::default()
            },
        });
    });
    harness.converge();

    assert_eq!(harness.store.count(ResourceKind::StatefulSet), 0);
    let mut deployments: Vec<Deployment> = harness.store.list_as(TEST_NAMESPACE, None).unwrap();
    deployments.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    let replicas: Vec<(String, i32)> = deployments
        .iter()
        .map(|deployment| (deployment.metadata.name_or_empty().to_string(), deployment.spec.replicas))
        .collect();
    assert_eq!(
        replicas,
        vec![("web-zone-a".to_string(), 2), ("web-zone-b".to_string(), 2)]
    );
    let messages: Vec<String> = harness
        .recorder
        .events()
        .into_iter()
        .map(|event| event.message)
        .collect();
    assert!(messages.contains(&"Create 2 Subset (Deployment)".to_string()));
}

#[test]
fn scenario_united_deployment_oversubscribed_topology_is_terminal() {
    let mut ud = united_deployment(UD_NAME, 4, "nginx:1", &["zone-a", "zone-b"]);
    ud.spec.topology.subsets[0].replicas = Some(IntOrString::Int(3));
    ud.spec.topology.subsets[1].replicas = Some(IntOrString::Int(3));
    let harness = ScenarioHarness::new(ud);

    let err = harness.pass().expect_err("oversubscribed");
    assert!(err.is_terminal());
    assert_eq!(harness.store.count(ResourceKind::StatefulSet), 0);
    let conditions = harness.ud().status.unwrap().conditions;
    let provisioned = &conditions[0];
    assert_eq!(provisioned.condition_type, "SubsetProvisioned");
    assert!(!provisioned.is_true());
    assert_eq!(provisioned.reason.as_deref(), Some("InvalidSpec"));
}
