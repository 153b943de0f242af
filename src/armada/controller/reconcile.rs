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

use crate::armada::controller::error::ControllerError;
use crate::armada::controller::runtime::{ControllerRuntime, ControllerTarget};
use crate::armada::k8s::client::ObjectStore;
use crate::armada::k8s::event::EventRecorder;
use std::error::Error;
use std::sync::Arc;

/// Execution context shared across reconciliation phases.
///
/// The context exposes the underlying `ControllerRuntime` so controllers can
/// reach the object store, the event sink and the runtime configuration.
pub struct ReconcileContext<'a> {
    runtime: &'a ControllerRuntime,
}

impl<'a> ReconcileContext<'a> {
    /// Builds a context from the provided runtime reference.
    pub fn new(runtime: &'a ControllerRuntime) -> Self {
        Self { runtime }
    }

    /// Returns the underlying controller runtime.
    pub fn runtime(&self) -> &'a ControllerRuntime {
        self.runtime
    }

    /// Looks up a dependency that was previously registered with the runtime.
    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.runtime.dependency::<T>()
    }

    /// Object store registered as `DependencyHandle<dyn ObjectStore>`.
    pub fn store(&self) -> Result<Arc<dyn ObjectStore>, ControllerError> {
        self.dependency::<DependencyHandle<dyn ObjectStore>>()
            .map(|handle| handle.get())
            .ok_or_else(|| {
                ControllerError::Dependency("object store not registered with runtime".to_string())
            })
    }

    /// Event sink registered as `DependencyHandle<dyn EventRecorder>`.
    pub fn events(&self) -> Result<Arc<dyn EventRecorder>, ControllerError> {
        self.dependency::<DependencyHandle<dyn EventRecorder>>()
            .map(|handle| handle.get())
            .ok_or_else(|| {
                ControllerError::Dependency("event recorder not registered with runtime".to_string())
            })
    }
}

/// Wrapper that stores an `Arc<T>` while remaining `Sized`, enabling trait-object dependencies.
pub struct DependencyHandle<T: ?Sized> {
    inner: Arc<T>,
}

impl<T: ?Sized> DependencyHandle<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self { inner }
    }

    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.inner)
    }
}

impl<T: ?Sized> Clone for DependencyHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Desired input and observed state gathered during the fetch phase.
pub struct ReconcileData<Desired, Observed> {
    pub desired: Desired,
    pub observed: Observed,
}

type FetchResult<D, O, E> = Result<Option<ReconcileData<D, O>>, E>;

/// Shared reconciliation interface used by workload controllers.
pub trait Reconciler {
    type Desired;
    type Observed;
    type Plan;
    type Error: Error + Send + Sync + 'static;

    /// Returns the logical kind handled by this reconciler (used for diagnostics).
    fn kind(&self) -> &'static str;

    /// Fetches the desired spec and observed state. Returning `Ok(None)` indicates
    /// the resource no longer exists and no further work is required.
    fn fetch(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
    ) -> FetchResult<Self::Desired, Self::Observed, Self::Error>;

    /// Computes the plan needed to align observed state with the desired spec.
    fn diff(
        &self,
        target: &ControllerTarget,
        desired: &Self::Desired,
        observed: &Self::Observed,
    ) -> Result<Self::Plan, Self::Error>;

    /// Applies the previously computed plan to drive the system toward convergence.
    fn apply(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
        plan: Self::Plan,
    ) -> Result<(), Self::Error>;

    /// Convenience method that performs fetch and diff, returning a plan if work is needed.
    fn reconcile(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
    ) -> Result<Option<Self::Plan>, Self::Error> {
        if let Some(data) = self.fetch(ctx, target)? {
            let plan = self.diff(target, &data.desired, &data.observed)?;
            Ok(Some(plan))
        } else {
            Ok(None)
        }
    }

    /// Runs the full reconciliation pipeline, applying the plan when necessary.
    fn reconcile_and_apply(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
    ) -> Result<(), Self::Error> {
        if let Some(plan) = self.reconcile(ctx, target)? {
            self.apply(ctx, target, plan)?;
        }
        Ok(())
    }
}
