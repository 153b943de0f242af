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

use crate::armada::config::ControllerConfig;
use crate::armada::controller::cloneset::CloneSetController;
use crate::armada::controller::error::ControllerError;
use crate::armada::controller::reconcile::{ReconcileContext, Reconciler};
use crate::armada::controller::uniteddeployment::UnitedDeploymentController;
use crate::armada::k8s::store::normalize_namespace;
use crate::armada::logger::{log_debug, log_error, log_info, log_warn};
use crate::armada::observability::metrics::{self, ControllerReconcileResult};
use crate::armada::observability::tracing::with_span;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Controller manager runtime that offers a work queue and shared dependencies.
pub struct ControllerRuntime {
    dependencies: DependencyRegistry,
    work_queue: WorkQueue<ControllerTarget>,
    config: ControllerConfig,
}

impl ControllerRuntime {
    pub fn new(config: ControllerConfig) -> Arc<Self> {
        Arc::new(Self {
            dependencies: DependencyRegistry::new(),
            work_queue: WorkQueue::new(config.backoff_base, config.backoff_max),
            config,
        })
    }

    pub fn register_dependency<T>(&self, dependency: Arc<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert(dependency)
    }

    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.get::<T>()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn context(&self) -> ReconcileContext<'_> {
        ReconcileContext::new(self)
    }

    pub fn work_queue(&self) -> WorkQueue<ControllerTarget> {
        self.work_queue.clone()
    }

    /// Runs one reconcile pass for `target` with the controller registered
    /// for its kind.
    pub fn reconcile(&self, target: &ControllerTarget) -> Result<(), ControllerError> {
        let ctx = self.context();
        match target {
            ControllerTarget::CloneSet { .. } => self
                .dependency::<CloneSetController>()
                .ok_or_else(|| {
                    ControllerError::Dependency(
                        "CloneSet controller not registered with runtime".to_string(),
                    )
                })?
                .reconcile_and_apply(&ctx, target),
            ControllerTarget::UnitedDeployment { .. } => self
                .dependency::<UnitedDeploymentController>()
                .ok_or_else(|| {
                    ControllerError::Dependency(
                        "UnitedDeployment controller not registered with runtime".to_string(),
                    )
                })?
                .reconcile_and_apply(&ctx, target),
        }
    }

    /// Spawns `config.workers` workers dispatching through [`Self::reconcile`].
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.spawn_workers_with(self.config.workers, |runtime, target| {
            runtime.reconcile(target)
        })
    }

    /// Spawns `count` workers. Each pass runs on the blocking pool; a failed
    /// pass is requeued with per-key backoff unless its error is terminal.
    pub fn spawn_workers_with<H>(self: &Arc<Self>, count: usize, handler: H) -> Vec<JoinHandle<()>>
    where
        H: Fn(&ControllerRuntime, &ControllerTarget) -> Result<(), ControllerError>
            + Send
            + Sync
            + 'static,
    {
        let handler = Arc::new(handler);
        let workers = count.max(1);
        let workers_label = workers.to_string();
        log_info(
            "controller-runtime",
            "Starting controller workers",
            &[("workers", workers_label.as_str())],
        );
        (0..workers)
            .map(|_| {
                let runtime = Arc::clone(self);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let queue = runtime.work_queue();
                    while let Some(target) = queue.next().await {
                        let started = Instant::now();
                        let pass_runtime = Arc::clone(&runtime);
                        let pass_handler = Arc::clone(&handler);
                        let pass_target = target.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            let span = pass_target.to_string();
                            with_span("controller-runtime", &span, || {
                                pass_handler(&pass_runtime, &pass_target)
                            })
                        })
                        .await
                        .unwrap_or_else(|err| {
                            let key = target.to_string();
                            let message = err.to_string();
                            log_error(
                                "controller-runtime",
                                "Reconcile pass aborted",
                                &[("target", key.as_str()), ("error", message.as_str())],
                            );
                            Err(ControllerError::Internal(format!(
                                "reconcile pass aborted: {message}"
                            )))
                        });
                        finish_pass(&queue, &target, result, started.elapsed());
                        queue.done(&target);
                    }
                })
            })
            .collect()
    }
}

fn finish_pass(
    queue: &WorkQueue<ControllerTarget>,
    target: &ControllerTarget,
    result: Result<(), ControllerError>,
    elapsed: Duration,
) {
    let controller = target.kind();
    let key = target.to_string();
    match result {
        Ok(()) => {
            queue.forget(target);
            metrics::record_controller_reconcile(
                controller,
                ControllerReconcileResult::Success,
                elapsed,
            );
            log_debug("controller-runtime", "Reconciled", &[("target", key.as_str())]);
        }
        Err(err) if err.is_terminal() => {
            queue.forget(target);
            metrics::record_controller_reconcile(
                controller,
                ControllerReconcileResult::Error,
                elapsed,
            );
            let message = err.to_string();
            log_warn(
                "controller-runtime",
                "Reconcile failed; waiting for a spec change",
                &[("target", key.as_str()), ("error", message.as_str())],
            );
        }
        Err(err) => {
            metrics::record_controller_reconcile(
                controller,
                ControllerReconcileResult::Requeue,
                elapsed,
            );
            let message = err.to_string();
            let attempts = (queue.num_requeues(target) + 1).to_string();
            log_warn(
                "controller-runtime",
                "Reconcile failed; requeueing with backoff",
                &[
                    ("target", key.as_str()),
                    ("error", message.as_str()),
                    ("attempt", attempts.as_str()),
                ],
            );
            queue.add_rate_limited(target.clone());
        }
    }
}

#[derive(Default)]
struct DependencyRegistry {
    values: StdRwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl DependencyRegistry {
    fn new() -> Self {
        Self {
            values: StdRwLock::new(HashMap::new()),
        }
    }

    fn insert<T>(&self, dependency: Arc<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let mut guard = self
            .values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let existing = guard.insert(
            TypeId::of::<T>(),
            dependency.clone() as Arc<dyn Any + Send + Sync>,
        );
        existing.and_then(|arc| arc.downcast::<T>().ok())
    }

    fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let guard = self
            .values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .get(&TypeId::of::<T>())
            .and_then(|arc| arc.clone().downcast::<T>().ok())
    }
}

/// Deduplicating work queue.
///
/// An item is handed to at most one worker at a time. Adds while an item is
/// queued are coalesced; adds while it is being processed are replayed once
/// the worker calls [`WorkQueue::done`].
pub struct WorkQueue<T> {
    inner: Arc<WorkQueueInner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct WorkQueueInner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            inner: Arc::new(WorkQueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff_base,
                backoff_max,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next item; `None` once the queue is shut down.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Marks processing finished, replaying an add that arrived meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Re-adds `item` after its per-key exponential backoff.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            *failures += 1;
            self.backoff(*failures)
        };
        self.add_after(item, delay);
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Clears the backoff history of `item`.
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.inner
            .backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.inner.backoff_max)
    }
}

/// Workload identity carried through the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControllerTarget {
    CloneSet { namespace: String, name: String },
    UnitedDeployment { namespace: String, name: String },
}

impl ControllerTarget {
    pub fn cloneset(namespace: Option<&str>, name: &str) -> Self {
        ControllerTarget::CloneSet {
            namespace: normalize_namespace(namespace),
            name: name.to_string(),
        }
    }

    pub fn united_deployment(namespace: Option<&str>, name: &str) -> Self {
        ControllerTarget::UnitedDeployment {
            namespace: normalize_namespace(namespace),
            name: name.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControllerTarget::CloneSet { .. } => "CloneSet",
            ControllerTarget::UnitedDeployment { .. } => "UnitedDeployment",
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            ControllerTarget::CloneSet { namespace, .. }
            | ControllerTarget::UnitedDeployment { namespace, .. } => namespace,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ControllerTarget::CloneSet { name, .. }
            | ControllerTarget::UnitedDeployment { name, .. } => name,
        }
    }

    /// `namespace/name`, the expectations key of the workload.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }
}

impl fmt::Display for ControllerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind(), self.namespace(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(Duration::from_millis(1), Duration::from_millis(8))
    }

    #[tokio::test]
    async fn dependency_round_trip() {
        let runtime = ControllerRuntime::new(ControllerConfig::default());
        let value = Arc::new(String::from("dependency"));
        assert!(runtime.register_dependency(value.clone()).is_none());
        let retrieved = runtime
            .dependency::<String>()
            .expect("dependency should be present");
        assert_eq!(retrieved.as_str(), "dependency");
    }

    #[tokio::test]
    async fn adds_are_coalesced_and_ordered() {
        let queue = queue();
        queue.add("a");
        queue.add("b");
        queue.add("a");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await, Some("a"));
        assert_eq!(queue.next().await, Some("b"));
    }

    #[tokio::test]
    async fn items_in_flight_are_replayed_after_done() {
        let queue = queue();
        queue.add("a");
        let item = queue.next().await.unwrap();
        queue.add("a");
        assert!(queue.is_empty());
        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some("a"));
    }

    #[tokio::test]
    async fn rate_limited_adds_back_off_per_key() {
        let queue = queue();
        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        assert_eq!(queue.num_requeues(&"a"), 2);
        assert_eq!(queue.backoff(1), Duration::from_millis(1));
        assert_eq!(queue.backoff(3), Duration::from_millis(4));
        assert_eq!(queue.backoff(10), Duration::from_millis(8));
        let item = timeout(Duration::from_secs(1), queue.next()).await.unwrap();
        assert_eq!(item, Some("a"));
        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
    }

    #[tokio::test]
    async fn shut_down_releases_waiting_workers() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn targets_render_kind_namespace_and_name() {
        let target = ControllerTarget::cloneset(None, "web");
        assert_eq!(target.to_string(), "CloneSet/default/web");
        assert_eq!(target.key(), "default/web");
        let target = ControllerTarget::united_deployment(Some("prod"), "api");
        assert_eq!(target.to_string(), "UnitedDeployment/prod/api");
    }

    #[test]
    fn missing_controller_is_a_dependency_error() {
        let runtime = ControllerRuntime::new(ControllerConfig::default());
        let err = runtime
            .reconcile(&ControllerTarget::cloneset(None, "web"))
            .unwrap_err();
        assert!(matches!(err, ControllerError::Dependency(_)));
    }
}
