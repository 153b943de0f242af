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

//! Issues planned unit mutations against the object store.
//!
//! Creations run in slow-start batches so a systematic failure (quota, bad
//! template) costs one call instead of one per unit. Every mutation is
//! registered with the expectations ledger before it is sent and rolled
//! back only when the store definitely rejected it.

use crate::armada::controller::error::ControllerError;
use crate::armada::controller::expectations::Expectations;
use crate::armada::controller::inventory::WorkloadRef;
use crate::armada::controller::revision::LABEL_REVISION_HASH;
use crate::armada::k8s::client::{ObjectStore, ObjectStoreExt, ResourceKind};
use crate::armada::k8s::event::{EventRecorder, EventType};
use crate::armada::k8s::persistentvolumeclaim::PersistentVolumeClaim;
use crate::armada::k8s::pod::Pod;
use crate::armada::logger::WorkloadLogger;
use crate::armada::observability::metrics::{self, ActionKind};
use crate::armada::util::error::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

pub const REASON_SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
pub const REASON_FAILED_CREATE: &str = "FailedCreate";
pub const REASON_SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
pub const REASON_FAILED_DELETE: &str = "FailedDelete";
pub const REASON_SUCCESSFUL_UPDATE_IN_PLACE: &str = "SuccessfulUpdatePodInPlace";
pub const REASON_FAILED_UPDATE_IN_PLACE: &str = "FailedUpdatePodInPlace";

#[derive(Debug, Default)]
pub struct SlowStartResult {
    /// Calls that succeeded or timed out.
    pub succeeded: usize,
    pub errors: Vec<ControllerError>,
    /// Calls never attempted because an earlier batch failed.
    pub skipped: usize,
}

/// Runs `f(0..count)` in batches of `initial`, doubling after each fully
/// successful batch. Calls within a batch run concurrently. A timeout counts
/// as success; any other error stops further batches.
pub fn slow_start_batch<F>(count: usize, initial: usize, f: F) -> SlowStartResult
where
    F: Fn(usize) -> Result<(), ControllerError> + Sync,
{
    let mut result = SlowStartResult::default();
    let mut next = 0;
    let mut batch = initial.max(1).min(count);
    while batch > 0 {
        let outcomes: Vec<Result<(), ControllerError>> = thread::scope(|scope| {
            let handles: Vec<_> = (next..next + batch)
                .map(|index| {
                    let f = &f;
                    scope.spawn(move || f(index))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(ControllerError::Internal(
                            "slow start worker panicked".to_string(),
                        ))
                    })
                })
                .collect()
        });
        next += batch;
        for outcome in outcomes {
            match outcome {
                Ok(()) => result.succeeded += 1,
                Err(err) if err.is_timeout() => result.succeeded += 1,
                Err(err) => result.errors.push(err),
            }
        }
        if !result.errors.is_empty() {
            break;
        }
        batch = (batch * 2).min(count - next);
    }
    result.skipped = count - next;
    result
}

/// Per-pass execution environment. `revision` is the update revision the
/// pass patches units to; creations carry their own.
pub struct ExecutionContext<'a> {
    pub store: &'a dyn ObjectStore,
    pub expectations: &'a Expectations,
    pub workload: &'a WorkloadRef,
    pub revision: &'a str,
    pub events: &'a dyn EventRecorder,
    pub logger: &'a WorkloadLogger,
    pub slow_start_initial: usize,
    pub controller: &'static str,
}

#[derive(Debug, Clone)]
pub enum UnitAction {
    /// Creates the volumes and then the unit, stamped with `revision`.
    Create {
        pod: Pod,
        volumes: Vec<PersistentVolumeClaim>,
        revision: String,
    },
    /// Deletes the unit and then the listed volumes.
    Delete { name: String, volumes: Vec<String> },
    /// Replaces the unit; `kind` is `InPlaceUpdate` or `Condition`.
    Patch { pod: Pod, kind: ActionKind },
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub created: usize,
    /// Creations whose outcome is unknown; their expectations stay pending.
    pub unconfirmed: usize,
    pub deleted: usize,
    pub patched: usize,
    /// Creations skipped after a slow-start batch failed.
    pub abandoned: usize,
    pub errors: Vec<ControllerError>,
}

impl ExecutionReport {
    pub fn into_result(self) -> Result<(), ControllerError> {
        ControllerError::aggregate(self.errors)
    }
}

pub struct BatchExecutor;

impl BatchExecutor {
    pub fn execute(ctx: &ExecutionContext<'_>, actions: Vec<UnitAction>) -> ExecutionReport {
        let mut creates = Vec::new();
        let mut deletes = Vec::new();
        let mut patches = Vec::new();
        for action in actions {
            match action {
                UnitAction::Create {
                    mut pod,
                    volumes,
                    revision,
                } => {
                    pod.metadata
                        .labels
                        .insert(LABEL_REVISION_HASH.to_string(), revision);
                    creates.push((pod, volumes))
                }
                UnitAction::Delete { name, volumes } => deletes.push((name, volumes)),
                UnitAction::Patch { pod, kind } => patches.push((pod, kind)),
            }
        }

        let mut report = ExecutionReport::default();
        if !creates.is_empty() {
            Self::create_units(ctx, creates, &mut report);
        }
        for (name, volumes) in deletes {
            Self::delete_unit(ctx, &name, &volumes, &mut report);
        }
        for (pod, kind) in patches {
            Self::patch_unit(ctx, pod, kind, &mut report);
        }

        let created = report.created.to_string();
        let deleted = report.deleted.to_string();
        let patched = report.patched.to_string();
        let failed = report.errors.len().to_string();
        ctx.logger.debug(
            "Executed unit actions",
            &[
                ("revision", ctx.revision),
                ("created", created.as_str()),
                ("deleted", deleted.as_str()),
                ("patched", patched.as_str()),
                ("errors", failed.as_str()),
            ],
        );
        report
    }

    fn create_units(
        ctx: &ExecutionContext<'_>,
        creates: Vec<(Pod, Vec<PersistentVolumeClaim>)>,
        report: &mut ExecutionReport,
    ) {
        let key = ctx.workload.key();
        let names: Vec<String> = creates.iter().map(|(pod, _)| pod.name().to_string()).collect();
        ctx.expectations.expect_creations(&key, &names);

        let unconfirmed = AtomicUsize::new(0);
        let outcome = slow_start_batch(creates.len(), ctx.slow_start_initial, |index| {
            let (pod, volumes) = &creates[index];
            match Self::create_unit(ctx, pod, volumes) {
                Ok(()) => Ok(()),
                Err(err) if err.is_timeout() => {
                    unconfirmed.fetch_add(1, Ordering::Relaxed);
                    ctx.logger.warn(
                        "Unit creation outcome unknown",
                        &[("unit", pod.name()), ("error", err.to_string().as_str())],
                    );
                    Err(err)
                }
                Err(err) => {
                    ctx.expectations.creation_observed(&key, pod.name());
                    Err(err)
                }
            }
        });

        let attempted = creates.len() - outcome.skipped;
        for name in &names[attempted..] {
            ctx.expectations.creation_observed(&key, name);
        }
        if outcome.skipped > 0 {
            let skipped = outcome.skipped.to_string();
            ctx.logger.warn(
                "Abandoned remaining unit creations after failure",
                &[("skipped", skipped.as_str())],
            );
        }
        let unconfirmed = unconfirmed.into_inner();
        report.unconfirmed += unconfirmed;
        report.created += outcome.succeeded - unconfirmed;
        report.abandoned += outcome.skipped;
        report.errors.extend(outcome.errors);
    }

    fn create_unit(
        ctx: &ExecutionContext<'_>,
        pod: &Pod,
        volumes: &[PersistentVolumeClaim],
    ) -> Result<(), ControllerError> {
        let namespace = ctx.workload.namespace.as_str();
        let involved = ctx.workload.object_reference();
        let revision = pod
            .metadata
            .labels
            .get(LABEL_REVISION_HASH)
            .map(String::as_str)
            .unwrap_or(ctx.revision);
        let result = (|| -> Result<(), ControllerError> {
            for volume in volumes {
                match ctx.store.create_as(namespace, volume) {
                    Ok(_) => {}
                    Err(err) if err.kind == ErrorKind::AlreadyExists => {}
                    Err(err) => return Err(err.into()),
                }
            }
            ctx.store.create_as(namespace, pod)?;
            Ok(())
        })();
        metrics::record_unit_action(ctx.controller, Some(namespace), ActionKind::Create, result.is_ok());
        match &result {
            Ok(()) => ctx.events.record(
                &involved,
                EventType::Normal,
                REASON_SUCCESSFUL_CREATE,
                &format!("create Pod {} at revision {}", pod.name(), revision),
            ),
            Err(err) => ctx.events.record(
                &involved,
                EventType::Warning,
                REASON_FAILED_CREATE,
                &format!("failed to create Pod {}: {}", pod.name(), err),
            ),
        }
        result
    }

    fn delete_unit(
        ctx: &ExecutionContext<'_>,
        name: &str,
        volumes: &[String],
        report: &mut ExecutionReport,
    ) {
        let key = ctx.workload.key();
        let namespace = ctx.workload.namespace.as_str();
        let involved = ctx.workload.object_reference();
        ctx.expectations.expect_deletions(&key, &[name.to_string()]);

        let result = match ctx.store.delete(ResourceKind::Pod, namespace, name) {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                ctx.expectations.deletion_observed(&key, name);
                Ok(())
            }
            Err(err) if err.is_timeout() => Err(err),
            Err(err) => {
                ctx.expectations.deletion_observed(&key, name);
                Err(err)
            }
        };
        metrics::record_unit_action(ctx.controller, Some(namespace), ActionKind::Delete, result.is_ok());
        match result {
            Ok(()) => {
                report.deleted += 1;
                ctx.events.record(
                    &involved,
                    EventType::Normal,
                    REASON_SUCCESSFUL_DELETE,
                    &format!("delete Pod {}", name),
                );
            }
            Err(err) => {
                ctx.events.record(
                    &involved,
                    EventType::Warning,
                    REASON_FAILED_DELETE,
                    &format!("failed to delete Pod {}: {}", name, err),
                );
                if !err.is_timeout() {
                    report.errors.push(err.into());
                }
                return;
            }
        }

        for volume in volumes {
            match ctx
                .store
                .delete(ResourceKind::PersistentVolumeClaim, namespace, volume)
            {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    ctx.logger.warn(
                        "Failed to delete unit volume",
                        &[("unit", name), ("volume", volume.as_str())],
                    );
                    report.errors.push(err.into());
                }
            }
        }
    }

    fn patch_unit(ctx: &ExecutionContext<'_>, pod: Pod, kind: ActionKind, report: &mut ExecutionReport) {
        let key = ctx.workload.key();
        let namespace = ctx.workload.namespace.as_str();
        let involved = ctx.workload.object_reference();
        let name = pod.name().to_string();
        let in_place = kind == ActionKind::InPlaceUpdate;
        if in_place {
            ctx.expectations.expect_update(&key, &name, ctx.revision);
        }

        let result = ctx.store.update_as(namespace, &pod);
        metrics::record_unit_action(ctx.controller, Some(namespace), kind, result.is_ok());
        match result {
            Ok(_) => {
                report.patched += 1;
                if in_place {
                    ctx.events.record(
                        &involved,
                        EventType::Normal,
                        REASON_SUCCESSFUL_UPDATE_IN_PLACE,
                        &format!("successfully update Pod {} in-place to revision {}", name, ctx.revision),
                    );
                }
            }
            Err(err) => {
                if in_place {
                    if !err.is_timeout() {
                        ctx.expectations.update_observed(&key, &name);
                    }
                    ctx.events.record(
                        &involved,
                        EventType::Warning,
                        REASON_FAILED_UPDATE_IN_PLACE,
                        &format!("failed to update Pod {} in-place: {}", name, err),
                    );
                }
                if !err.is_timeout() {
                    report.errors.push(err.into());
                }
            }
        }
    }
}
