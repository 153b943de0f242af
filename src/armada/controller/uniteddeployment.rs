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

//! UnitedDeployment fan-out loop: splits the workload across its topology
//! subsets and keeps one StatefulSet or Deployment per subset in line.

use crate::armada::config::ControllerConfig;
use crate::armada::controller::allocator::{allocate_partitions, allocate_replicas, Allocation};
use crate::armada::controller::error::ControllerError;
use crate::armada::controller::executor::slow_start_batch;
use crate::armada::controller::inventory::WorkloadRef;
use crate::armada::controller::reconcile::{ReconcileContext, ReconcileData, Reconciler};
use crate::armada::controller::revision::{RevisionSet, RevisionStore};
use crate::armada::controller::runtime::ControllerTarget;
use crate::armada::controller::status::{
    set_condition, WorkloadConditionKind, WorkloadConditionReason,
};
use crate::armada::controller::subset::{Subset, SubsetControl, SubsetTarget};
use crate::armada::k8s::client::{ObjectStore, ObjectStoreExt};
use crate::armada::k8s::event::{EventRecorder, EventType};
use crate::armada::k8s::uniteddeployment::{
    SubsetSpec, UnitedDeployment, UnitedDeploymentStatus, UpdateStatus,
};
use crate::armada::logger::WorkloadLogger;
use crate::armada::observability::metrics;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};

pub const CONTROLLER_NAME: &str = "uniteddeployment-controller";

pub const REASON_SUBSETS_UPDATE: &str = "SuccessfulSubsetsUpdate";
pub const REASON_FAILED_SUBSETS_UPDATE: &str = "FailedSubsetsUpdate";

pub struct UnitedDeploymentController {
    slow_start_initial: usize,
    revision_history_limit: usize,
}

pub struct UnitedDeploymentObserved {
    control: Result<SubsetControl, String>,
    revisions: RevisionSet,
    subsets: Vec<Subset>,
    /// Subsets of the kind the template no longer selects.
    stale_kind: Vec<Subset>,
}

/// Subset-level work for one pass.
pub struct UnitedDeploymentPlan {
    ud: UnitedDeployment,
    revisions: RevisionSet,
    step: FanOut,
    subsets: Vec<Subset>,
    stale_kind: Vec<Subset>,
}

enum FanOut {
    Invalid(String),
    Manage {
        control: SubsetControl,
        allocation: Allocation,
        partitions: BTreeMap<String, u32>,
        creates: Vec<String>,
        deletes: Vec<Subset>,
        updates: Vec<Subset>,
    },
}

impl UnitedDeploymentController {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            slow_start_initial: config.slow_start_initial_batch,
            revision_history_limit: config.revision_history_limit,
        }
    }

    /// Creates missing subsets at the update revision and removes those no
    /// longer in the topology or of the wrong kind. Returns the names of
    /// subsets created.
    fn manage_subset_provision(
        &self,
        store: &dyn ObjectStore,
        events: &dyn EventRecorder,
        ud: &UnitedDeployment,
        control: SubsetControl,
        targets: &[SubsetTarget<'_>],
        removals: &[Subset],
    ) -> Result<Vec<String>, ControllerError> {
        let workload = WorkloadRef::for_united_deployment(ud);
        let logger = WorkloadLogger::new(CONTROLLER_NAME, &workload.namespace, &workload.name);
        let involved = workload.object_reference();
        let kind = control.kind().kind();
        let mut errors = Vec::new();
        let mut created = Vec::new();

        if !targets.is_empty() {
            let outcome = slow_start_batch(targets.len(), self.slow_start_initial, |index| {
                control.create_subset(store, ud, targets[index])
            });
            let attempted = targets.len() - outcome.skipped;
            created = targets[..attempted]
                .iter()
                .map(|target| target.spec.name.clone())
                .collect();
            if outcome.errors.is_empty() {
                events.record(
                    &involved,
                    EventType::Normal,
                    REASON_SUBSETS_UPDATE,
                    &format!("Create {} Subset ({})", created.len(), kind),
                );
            } else {
                let failed = outcome.errors.len().to_string();
                logger.warn("Failed to create subsets", &[("failed", failed.as_str())]);
                events.record(
                    &involved,
                    EventType::Warning,
                    REASON_FAILED_SUBSETS_UPDATE,
                    &format!("failed to create {} Subset ({})", outcome.errors.len(), kind),
                );
                errors.extend(outcome.errors);
            }
        }

        let mut deleted = 0usize;
        for subset in removals {
            match subset.control.delete_subset(store, &workload.namespace, subset) {
                Ok(()) => {
                    deleted += 1;
                    logger.info("Deleted subset", &[("subset", subset.name.as_str())]);
                }
                Err(err) => errors.push(err),
            }
        }
        if deleted > 0 {
            events.record(
                &involved,
                EventType::Normal,
                REASON_SUBSETS_UPDATE,
                &format!("Delete {} Subset ({})", deleted, kind),
            );
        }

        ControllerError::aggregate(errors).map(|()| created)
    }

    /// Rewrites subsets whose replicas, partition or revision drifted.
    fn manage_subsets(
        &self,
        store: &dyn ObjectStore,
        logger: &WorkloadLogger,
        ud: &UnitedDeployment,
        control: SubsetControl,
        updates: &[(Subset, SubsetTarget<'_>)],
    ) -> Result<(), ControllerError> {
        let mut errors = Vec::new();
        for (subset, target) in updates {
            let replicas = target.replicas.to_string();
            let partition = target.partition.to_string();
            match control.update_subset(store, ud, subset, *target) {
                Ok(()) => logger.info(
                    "Updated subset",
                    &[
                        ("subset", subset.name.as_str()),
                        ("replicas", replicas.as_str()),
                        ("partition", partition.as_str()),
                        ("revision", target.revision),
                    ],
                ),
                Err(err) => errors.push(err),
            }
        }
        ControllerError::aggregate(errors)
    }
}

/// Partition the subset object will report once written.
fn effective_partition(control: SubsetControl, partition: u32) -> u32 {
    match control {
        SubsetControl::StatefulSet => partition,
        SubsetControl::Deployment => 0,
    }
}

fn subset_drifted(subset: &Subset, target: &SubsetTarget<'_>, control: SubsetControl) -> bool {
    subset.replicas != target.replicas
        || subset.partition != effective_partition(control, target.partition)
        || subset.revision.as_deref() != Some(target.revision)
}

fn calculate_status(
    ud: &UnitedDeployment,
    revisions: &RevisionSet,
    subsets: &[Subset],
    allocation: &Allocation,
    partitions: &BTreeMap<String, u32>,
) -> UnitedDeploymentStatus {
    let update = revisions.update.name();
    let previous = ud.status.clone().unwrap_or_default();
    let declared: HashSet<&str> = allocation.iter().map(|(name, _)| name.as_str()).collect();
    let live: Vec<&Subset> = subsets
        .iter()
        .filter(|subset| declared.contains(subset.subset_name.as_str()))
        .collect();

    let all_current = live.len() == declared.len()
        && live
            .iter()
            .all(|subset| subset.revision.as_deref() == Some(update));
    let current_revision = if all_current && partitions.values().all(|partition| *partition == 0) {
        update.to_string()
    } else {
        revisions.current.name().to_string()
    };

    UnitedDeploymentStatus {
        observed_generation: ud.metadata.generation.unwrap_or(0),
        replicas: live.iter().map(|subset| subset.replicas).sum(),
        ready_replicas: live.iter().map(|subset| subset.ready_replicas).sum(),
        updated_replicas: live
            .iter()
            .filter(|subset| subset.revision.as_deref() == Some(update))
            .map(|subset| subset.updated_replicas)
            .sum(),
        updated_ready_replicas: live
            .iter()
            .filter(|subset| subset.revision.as_deref() == Some(update))
            .map(|subset| subset.updated_ready_replicas)
            .sum(),
        current_revision: Some(current_revision),
        collision_count: revisions.collision_count,
        subset_replicas: allocation.iter().cloned().collect(),
        update_status: Some(UpdateStatus {
            updated_revision: Some(update.to_string()),
            current_partitions: partitions.clone(),
        }),
        conditions: previous.conditions,
    }
}

impl Reconciler for UnitedDeploymentController {
    type Desired = UnitedDeployment;
    type Observed = UnitedDeploymentObserved;
    type Plan = UnitedDeploymentPlan;
    type Error = ControllerError;

    fn kind(&self) -> &'static str {
        "UnitedDeployment"
    }

    fn fetch(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
    ) -> Result<Option<ReconcileData<Self::Desired, Self::Observed>>, Self::Error> {
        let store = ctx.store()?;
        let ud: UnitedDeployment = match store.get_as(target.namespace(), target.name()) {
            Ok(ud) => ud,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if ud.metadata.is_terminating() {
            return Ok(None);
        }

        let workload = WorkloadRef::for_united_deployment(&ud);
        let revisions = RevisionStore::new(store.as_ref()).reconcile(&ud)?;
        let (control, subsets, stale_kind) = match SubsetControl::for_workload(&ud) {
            Ok(control) => {
                let subsets = control.get_all_subsets(store.as_ref(), &workload, &ud.spec.selector)?;
                let stale_kind =
                    control
                        .other()
                        .get_all_subsets(store.as_ref(), &workload, &ud.spec.selector)?;
                (Ok(control), subsets, stale_kind)
            }
            Err(ControllerError::Invalid(message)) => (Err(message), Vec::new(), Vec::new()),
            Err(err) => return Err(err),
        };

        Ok(Some(ReconcileData {
            desired: ud,
            observed: UnitedDeploymentObserved {
                control,
                revisions,
                subsets,
                stale_kind,
            },
        }))
    }

    fn diff(
        &self,
        _target: &ControllerTarget,
        ud: &Self::Desired,
        observed: &Self::Observed,
    ) -> Result<Self::Plan, Self::Error> {
        let mut plan = UnitedDeploymentPlan {
            ud: ud.clone(),
            revisions: observed.revisions.clone(),
            step: FanOut::Invalid(String::new()),
            subsets: observed.subsets.clone(),
            stale_kind: observed.stale_kind.clone(),
        };
        let control = match &observed.control {
            Ok(control) => *control,
            Err(message) => {
                plan.step = FanOut::Invalid(message.clone());
                return Ok(plan);
            }
        };
        let allocation = match allocate_replicas(ud.spec.desired_replicas(), &ud.spec.topology.subsets) {
            Ok(allocation) => allocation,
            Err(ControllerError::Invalid(message)) => {
                plan.step = FanOut::Invalid(message);
                return Ok(plan);
            }
            Err(err) => return Err(err),
        };
        let partitions = allocate_partitions(&allocation, ud.spec.strategy.manual_update.as_ref());

        let update = observed.revisions.update.name();
        let mut seen = HashSet::new();
        let mut deletes = Vec::new();
        let mut updates = Vec::new();
        for subset in &observed.subsets {
            let declared = allocation
                .iter()
                .find(|(name, _)| *name == subset.subset_name);
            match declared {
                // A second object for the same subset is surplus.
                Some((name, _)) if seen.insert(name.clone()) => {
                    let target = subset_target(ud, update, &allocation, &partitions, name)?;
                    if subset_drifted(subset, &target, control) {
                        updates.push(subset.clone());
                    }
                }
                _ => deletes.push(subset.clone()),
            }
        }
        let creates = allocation
            .iter()
            .filter(|(name, _)| !seen.contains(name))
            .map(|(name, _)| name.clone())
            .collect();

        plan.step = FanOut::Manage {
            control,
            allocation,
            partitions,
            creates,
            deletes,
            updates,
        };
        Ok(plan)
    }

    fn apply(
        &self,
        ctx: &ReconcileContext,
        _target: &ControllerTarget,
        plan: Self::Plan,
    ) -> Result<(), Self::Error> {
        let store = ctx.store()?;
        let events = ctx.events()?;
        let UnitedDeploymentPlan {
            ud,
            revisions,
            step,
            subsets,
            stale_kind,
        } = plan;
        let workload = WorkloadRef::for_united_deployment(&ud);
        let logger = WorkloadLogger::new(CONTROLLER_NAME, &workload.namespace, &workload.name);
        let now = Utc::now();
        let mut errors = Vec::new();

        let status = match step {
            FanOut::Invalid(message) => {
                logger.warn("Rejected subset topology", &[("error", message.as_str())]);
                events.record(
                    &workload.object_reference(),
                    EventType::Warning,
                    "InvalidSpec",
                    &message,
                );
                let mut status = ud.status.clone().unwrap_or_default();
                status.observed_generation = ud.metadata.generation.unwrap_or(0);
                set_condition(
                    &mut status.conditions,
                    WorkloadConditionKind::SubsetProvisioned,
                    false,
                    WorkloadConditionReason::InvalidSpec,
                    message.clone(),
                    now,
                );
                errors.push(ControllerError::Invalid(message));
                status
            }
            FanOut::Manage {
                control,
                allocation,
                partitions,
                creates,
                deletes,
                updates,
            } => {
                let update_revision = revisions.update.name();
                let mut status =
                    calculate_status(&ud, &revisions, &subsets, &allocation, &partitions);

                let create_targets = creates
                    .iter()
                    .map(|name| subset_target(&ud, update_revision, &allocation, &partitions, name))
                    .collect::<Result<Vec<_>, _>>()?;
                let removals: Vec<Subset> = deletes
                    .into_iter()
                    .chain(stale_kind.iter().cloned())
                    .collect();
                match self.manage_subset_provision(
                    store.as_ref(),
                    events.as_ref(),
                    &ud,
                    control,
                    &create_targets,
                    &removals,
                ) {
                    Ok(created) => {
                        if !created.is_empty() {
                            let created = created.join(",");
                            logger.info("Provisioned subsets", &[("subsets", created.as_str())]);
                        }
                        set_condition(
                            &mut status.conditions,
                            WorkloadConditionKind::SubsetProvisioned,
                            true,
                            WorkloadConditionReason::Provisioned,
                            "",
                            now,
                        );

                        let update_targets = updates
                            .into_iter()
                            .map(|subset| {
                                let target = subset_target(
                                    &ud,
                                    update_revision,
                                    &allocation,
                                    &partitions,
                                    &subset.subset_name,
                                )?;
                                Ok((subset, target))
                            })
                            .collect::<Result<Vec<_>, ControllerError>>()?;
                        match self.manage_subsets(
                            store.as_ref(),
                            &logger,
                            &ud,
                            control,
                            &update_targets,
                        ) {
                            Ok(()) => set_condition(
                                &mut status.conditions,
                                WorkloadConditionKind::SubsetUpdated,
                                true,
                                WorkloadConditionReason::Updated,
                                "",
                                now,
                            ),
                            Err(err) => {
                                events.record(
                                    &workload.object_reference(),
                                    EventType::Warning,
                                    REASON_FAILED_SUBSETS_UPDATE,
                                    &err.to_string(),
                                );
                                set_condition(
                                    &mut status.conditions,
                                    WorkloadConditionKind::SubsetUpdated,
                                    false,
                                    WorkloadConditionReason::UpdateSubsetFailed,
                                    err.to_string(),
                                    now,
                                );
                                errors.push(err);
                            }
                        }
                    }
                    Err(err) => {
                        set_condition(
                            &mut status.conditions,
                            WorkloadConditionKind::SubsetProvisioned,
                            false,
                            WorkloadConditionReason::ProvisionFailed,
                            err.to_string(),
                            now,
                        );
                        errors.push(err);
                    }
                }
                status
            }
        };

        if ud.status.as_ref() != Some(&status) {
            let mut updated = ud.clone();
            updated.status = Some(status.clone());
            match store.update_status_as(&workload.namespace, &updated) {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => errors.push(err.into()),
            }
        }

        let in_use: HashSet<String> = subsets
            .iter()
            .chain(stale_kind.iter())
            .filter_map(|subset| subset.revision.clone())
            .collect();
        if let Err(err) = RevisionStore::new(store.as_ref()).truncate_history(
            &ud,
            &revisions,
            &in_use,
            self.revision_history_limit,
        ) {
            errors.push(err);
        }

        metrics::set_workload_replicas(
            CONTROLLER_NAME,
            Some(&workload.namespace),
            &workload.name,
            i64::from(ud.spec.desired_replicas()),
            i64::from(status.ready_replicas),
            i64::from(status.updated_replicas),
        );
        ControllerError::aggregate(errors)
    }
}

/// Desired shape of the named topology subset at `revision`.
fn subset_target<'a>(
    ud: &'a UnitedDeployment,
    revision: &'a str,
    allocation: &Allocation,
    partitions: &BTreeMap<String, u32>,
    name: &str,
) -> Result<SubsetTarget<'a>, ControllerError> {
    let spec: &SubsetSpec = ud
        .spec
        .topology
        .subsets
        .iter()
        .find(|subset| subset.name == name)
        .ok_or_else(|| ControllerError::Internal(format!("subset {name} is not in the topology")))?;
    let replicas = allocation
        .iter()
        .find(|(subset, _)| subset == name)
        .map(|(_, replicas)| *replicas)
        .unwrap_or(0);
    Ok(SubsetTarget {
        spec,
        revision,
        replicas,
        partition: partitions.get(name).copied().unwrap_or(0),
    })
}
