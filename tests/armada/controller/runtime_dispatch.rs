use armada::armada::config::ControllerConfig;
use armada::armada::controller::cloneset::CloneSetController;
use armada::armada::controller::reconcile::DependencyHandle;
use armada::armada::controller::runtime::ControllerRuntime;
use armada::armada::controller::watch::WatchDispatcher;
use armada::armada::k8s::client::{ObjectStore, ObjectStoreExt, ResourceKind};
use armada::armada::k8s::cloneset::CloneSet;
use armada::armada::k8s::event::{EventRecorder, MemoryEventRecorder};
use armada::armada::k8s::pod::Pod;
use armada::armada::k8s::store::MemoryStore;
use armada::armada::test_support::{cloneset, mark_ready, seconds_after_epoch, TEST_NAMESPACE};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

struct ScenarioHarness {
    runtime: Arc<ControllerRuntime>,
    store: Arc<MemoryStore>,
}

impl ScenarioHarness {
    /// Runtime with workers running and a dispatcher fed by the store's
    /// watch feed.
    fn start() -> (Self, Vec<tokio::task::JoinHandle<()>>) {
        let config = ControllerConfig {
            workers: 2,
            ..ControllerConfig::default()
        };
        let runtime = ControllerRuntime::new(config);
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(MemoryEventRecorder::new("runtime-dispatch"));
        let dyn_store: Arc<dyn ObjectStore> = store.clone();
        let events: Arc<dyn EventRecorder> = recorder;
        let controller = Arc::new(CloneSetController::new(runtime.config()));
        runtime.register_dependency(Arc::new(DependencyHandle::new(dyn_store.clone())));
        runtime.register_dependency(Arc::new(DependencyHandle::new(events)));
        runtime.register_dependency(Arc::clone(&controller));

        let dispatcher = Arc::new(WatchDispatcher::new(
            dyn_store,
            runtime.work_queue(),
            controller.expectations(),
        ));
        let mut tasks = vec![dispatcher.spawn(store.subscribe())];
        tasks.extend(runtime.spawn_workers());
        (Self { runtime, store }, tasks)
    }

    fn live_pods(&self) -> Vec<Pod> {
        self.store
            .list_as::<Pod>(TEST_NAMESPACE, None)
            .unwrap_or_default()
            .into_iter()
            .filter(|pod| !pod.metadata.is_terminating())
            .collect()
    }

    /// Node agent tick: finish deletions and report pods running. Writes
    /// that race a controller pass are retried on the next tick.
    fn agent_tick(&self) {
        self.store.finalize_terminating(ResourceKind::Pod);
        for mut pod in self.live_pods() {
            if pod.is_ready() {
                continue;
            }
            mark_ready(&mut pod, seconds_after_epoch(0), "id-nginx:1");
            let _ = self.store.update_as(TEST_NAMESPACE, &pod);
        }
    }

    async fn wait_for(&self, what: &str, mut done: impl FnMut(&Self) -> bool) {
        let waited = timeout(Duration::from_secs(10), async {
            loop {
                self.agent_tick();
                if done(self) {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    fn ready_replicas(&self) -> u32 {
        self.store
            .get_as::<CloneSet>(TEST_NAMESPACE, "web")
            .ok()
            .and_then(|set| set.status)
            .map(|status| status.ready_replicas)
            .unwrap_or(0)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_watch_feed_drives_cloneset_to_ready() {
    let (harness, tasks) = ScenarioHarness::start();
    harness
        .store
        .create_as(TEST_NAMESPACE, &cloneset("web", 3, "nginx:1"))
        .expect("create CloneSet");

    harness
        .wait_for("three ready replicas", |harness| {
            harness.live_pods().len() == 3 && harness.ready_replicas() == 3
        })
        .await;
    let before: BTreeSet<String> = harness
        .live_pods()
        .iter()
        .map(|pod| pod.name().to_string())
        .collect();

    let victim = before.iter().next().cloned().expect("a pod");
    harness
        .store
        .delete(ResourceKind::Pod, TEST_NAMESPACE, &victim)
        .expect("delete pod");

    harness
        .wait_for("a replacement pod", |harness| {
            let names: BTreeSet<String> = harness
                .live_pods()
                .iter()
                .map(|pod| pod.name().to_string())
                .collect();
            names.len() == 3 && !names.contains(&victim) && harness.ready_replicas() == 3
        })
        .await;

    harness.runtime.work_queue().shut_down();
    for task in tasks {
        task.abort();
    }
}
