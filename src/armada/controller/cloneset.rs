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

//! CloneSet manage loop.
//!
//! One pass lists the units, resolves revisions, and then either scales or
//! updates, never both. Scaling always wins: an update step only runs once
//! the unit count matches the spec (or the surge headroom is exhausted), so
//! a single pass never mixes creations with in-place patches.

use crate::armada::config::ControllerConfig;
use crate::armada::controller::error::ControllerError;
use crate::armada::controller::executor::{
    BatchExecutor, ExecutionContext, ExecutionReport, UnitAction,
};
use crate::armada::controller::expectations::Expectations;
use crate::armada::controller::inplace::{self, InPlaceOutcome};
use crate::armada::controller::inventory::{
    generate_instance_id, list_units, Inventory, Unit, WorkloadRef, LABEL_INSTANCE_ID,
    LABEL_UNIT_ORDINAL,
};
use crate::armada::controller::reconcile::{ReconcileContext, ReconcileData, Reconciler};
use crate::armada::controller::revision::{RevisionSet, RevisionStore};
use crate::armada::controller::runtime::ControllerTarget;
use crate::armada::controller::scale::{plan_scale, PlannedCreate, ScaleInput, ScalePlan};
use crate::armada::controller::status::{
    remove_condition, set_condition, WorkloadConditionKind, WorkloadConditionReason,
};
use crate::armada::controller::update::{
    plan_update, resolve_max_unavailable, revision_template, ConditionFix, UpdateInput,
    UpdatePlan,
};
use crate::armada::k8s::client::{ObjectStore, ObjectStoreExt};
use crate::armada::k8s::cloneset::{CloneSet, CloneSetStatus};
use crate::armada::k8s::event::{EventRecorder, EventType};
use crate::armada::k8s::intstr::Rounding;
use crate::armada::k8s::persistentvolumeclaim::PersistentVolumeClaim;
use crate::armada::k8s::pod::{
    ObjectMeta, Pod, PodCondition, PersistentVolumeClaimVolumeSource, VolumeSpec,
    CONDITION_IN_PLACE_UPDATE_READY,
};
use crate::armada::k8s::statefulset::PodTemplateSpec;
use crate::armada::logger::WorkloadLogger;
use crate::armada::observability::metrics::{self, ActionKind};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

pub const CONTROLLER_NAME: &str = "cloneset-controller";

const REASON_INVALID_SPEC: &str = "InvalidSpec";

/// Reconciler for CloneSet workloads. Owns the expectations shared by every
/// pass over every CloneSet.
pub struct CloneSetController {
    expectations: Arc<Expectations>,
    slow_start_initial: usize,
    revision_history_limit: usize,
}

/// State listed at the start of a pass.
pub struct CloneSetObserved {
    inventory: Inventory,
    revisions: RevisionSet,
    satisfied: bool,
    now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
enum PassStep {
    /// Earlier mutations are not yet visible; status only.
    Waiting,
    Invalid(String),
    Scale { creates: bool },
    Update { blocked: Vec<String> },
}

/// Actions and status for one pass.
pub struct CloneSetPlan {
    set: CloneSet,
    revisions: RevisionSet,
    step: PassStep,
    actions: Vec<UnitAction>,
    status: CloneSetStatus,
    in_use: HashSet<String>,
}

struct ResolvedStrategy {
    partition: u32,
    max_surge: u32,
}

impl CloneSetController {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            expectations: Arc::new(Expectations::new(
                CONTROLLER_NAME,
                config.expectation_timeout,
            )),
            slow_start_initial: config.slow_start_initial_batch,
            revision_history_limit: config.revision_history_limit,
        }
    }

    /// Shared with the watch dispatcher so observed events settle entries
    /// between passes.
    pub fn expectations(&self) -> Arc<Expectations> {
        Arc::clone(&self.expectations)
    }
}

fn resolve_strategy(set: &CloneSet) -> Result<ResolvedStrategy, ControllerError> {
    let strategy = &set.spec.update_strategy;
    let replicas = set.spec.replicas;
    let partition = strategy
        .partition
        .as_ref()
        .map(|value| value.scaled_value(replicas, Rounding::Up, "partition"))
        .transpose()
        .map_err(ControllerError::Invalid)?
        .unwrap_or(0);
    let max_surge = strategy
        .max_surge
        .as_ref()
        .map(|value| value.scaled_value(replicas, Rounding::Up, "maxSurge"))
        .transpose()
        .map_err(ControllerError::Invalid)?
        .unwrap_or(0);
    resolve_max_unavailable(strategy.max_unavailable.as_ref(), replicas)?;
    Ok(ResolvedStrategy {
        partition,
        max_surge,
    })
}

/// Status derived from the units listed at the start of the pass.
fn calculate_status(set: &CloneSet, observed: &CloneSetObserved) -> CloneSetStatus {
    let update = observed.revisions.update.name();
    let min_ready_seconds = set.spec.min_ready_seconds;
    let active = &observed.inventory.active;
    let count = |f: &dyn Fn(&Unit) -> bool| active.iter().filter(|unit| f(unit)).count() as u32;
    let replicas = active.len() as u32;
    let updated_replicas = count(&|unit| unit.revision() == Some(update));
    let current_revision = if updated_replicas == replicas {
        update.to_string()
    } else {
        observed.revisions.current.name().to_string()
    };
    let previous = set.status.clone().unwrap_or_default();
    CloneSetStatus {
        observed_generation: set.metadata.generation.unwrap_or(0),
        replicas,
        ready_replicas: count(&|unit| unit.is_ready()),
        available_replicas: count(&|unit| unit.pod.is_available(min_ready_seconds, observed.now)),
        updated_replicas,
        updated_ready_replicas: count(&|unit| unit.revision() == Some(update) && unit.is_ready()),
        current_revision: Some(current_revision),
        update_revision: Some(update.to_string()),
        collision_count: observed.revisions.collision_count,
        conditions: previous.conditions,
    }
}

/// Pod and claims for a new unit rendered from `template`.
fn build_unit(
    set: &CloneSet,
    workload: &WorkloadRef,
    template: &PodTemplateSpec,
    create: &PlannedCreate,
) -> (Pod, Vec<PersistentVolumeClaim>) {
    let name = format!("{}-{}", set.name(), create.instance_id);
    let mut labels = template.metadata.labels.clone();
    labels.insert(LABEL_INSTANCE_ID.to_string(), create.instance_id.clone());
    labels.insert(LABEL_UNIT_ORDINAL.to_string(), create.ordinal.to_string());

    let mut spec = template.spec.clone();
    let mut claims = Vec::with_capacity(set.spec.volume_claim_templates.len());
    for claim_template in &set.spec.volume_claim_templates {
        let volume_name = claim_template.name().to_string();
        let claim_name = format!("{}-{}-{}", volume_name, set.name(), create.instance_id);
        let mut claim_labels = set.spec.selector.match_labels.clone();
        claim_labels.insert(LABEL_INSTANCE_ID.to_string(), create.instance_id.clone());
        claims.push(PersistentVolumeClaim::new(
            ObjectMeta {
                name: Some(claim_name.clone()),
                namespace: Some(workload.namespace.clone()),
                labels: claim_labels,
                owner_references: vec![workload.owner_reference()],
                ..Default::default()
            },
            claim_template.spec.clone(),
        ));
        spec.volumes.retain(|volume| volume.name != volume_name);
        spec.volumes.push(VolumeSpec {
            name: volume_name,
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name,
                read_only: None,
            }),
            empty_dir: None,
        });
    }

    let pod = Pod::new(
        ObjectMeta {
            name: Some(name),
            namespace: Some(workload.namespace.clone()),
            labels,
            annotations: template.metadata.annotations.clone(),
            owner_references: vec![workload.owner_reference()],
            ..Default::default()
        },
        spec,
    );
    (pod, claims)
}

/// Creations below the partition ordinal are rendered from the current
/// revision so replacing a frozen unit does not move it forward.
fn scale_actions(
    set: &CloneSet,
    observed: &CloneSetObserved,
    plan: &ScalePlan,
    partition: u32,
) -> Result<Vec<UnitAction>, ControllerError> {
    let workload = WorkloadRef::for_cloneset(set);
    let revisions = &observed.revisions;
    let update_template = revision_template(&revisions.update)?;
    let current_template = if revisions.update_in_progress() {
        revision_template(&revisions.current)?
    } else {
        update_template.clone()
    };
    let retain = !set.spec.scale_strategy.volume_retention_policy.is_delete();
    let mut actions = Vec::with_capacity(plan.creates.len() + plan.deletions.len());
    for create in &plan.creates {
        let (revision, template) = if create.ordinal < partition {
            (&revisions.current, &current_template)
        } else {
            (&revisions.update, &update_template)
        };
        let (pod, volumes) = build_unit(set, &workload, template, create);
        actions.push(UnitAction::Create {
            pod,
            volumes,
            revision: revision.name().to_string(),
        });
    }
    for deletion in &plan.deletions {
        let volumes = if retain {
            Vec::new()
        } else {
            observed
                .inventory
                .find(&deletion.name)
                .map(|unit| unit.volume_names())
                .unwrap_or_default()
        };
        actions.push(UnitAction::Delete {
            name: deletion.name.clone(),
            volumes,
        });
    }
    Ok(actions)
}

fn update_actions(
    observed: &CloneSetObserved,
    plan: &UpdatePlan,
) -> Result<Vec<UnitAction>, ControllerError> {
    let update_revision = observed.revisions.update.name();
    let unit_pod = |name: &str| {
        observed
            .inventory
            .find(name)
            .map(|unit| &unit.pod)
            .ok_or_else(|| ControllerError::Internal(format!("planned unit {name} is not listed")))
    };

    let mut actions = Vec::new();
    for recreate in &plan.recreate {
        actions.push(UnitAction::Delete {
            name: recreate.name.clone(),
            volumes: recreate.volumes.clone(),
        });
    }
    for update in &plan.in_place {
        let pod = unit_pod(&update.name)?;
        if let InPlaceOutcome::Patched(pod) =
            inplace::apply(pod, update_revision, &update.diff, observed.now)?
        {
            actions.push(UnitAction::Patch {
                pod,
                kind: ActionKind::InPlaceUpdate,
            });
        }
    }
    for (name, fix) in &plan.condition_fixes {
        let pod = unit_pod(name)?;
        let pod = match fix {
            ConditionFix::Completed => inplace::mark_completed(pod, observed.now),
            ConditionFix::Backfill => {
                let mut pod = pod.clone();
                pod.set_condition(PodCondition::new(
                    CONDITION_IN_PLACE_UPDATE_READY,
                    true,
                    observed.now,
                ));
                pod
            }
        };
        actions.push(UnitAction::Patch {
            pod,
            kind: ActionKind::Condition,
        });
    }
    Ok(actions)
}

impl Reconciler for CloneSetController {
    type Desired = CloneSet;
    type Observed = CloneSetObserved;
    type Plan = CloneSetPlan;
    type Error = ControllerError;

    fn kind(&self) -> &'static str {
        "CloneSet"
    }

    fn fetch(
        &self,
        ctx: &ReconcileContext,
        target: &ControllerTarget,
    ) -> Result<Option<ReconcileData<Self::Desired, Self::Observed>>, Self::Error> {
        let store = ctx.store()?;
        let set: CloneSet = match store.get_as(target.namespace(), target.name()) {
            Ok(set) => set,
            Err(err) if err.is_not_found() => {
                self.expectations.forget(&target.key());
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        if set.metadata.is_terminating() {
            return Ok(None);
        }

        let workload = WorkloadRef::for_cloneset(&set);
        let inventory = list_units(store.as_ref(), &workload, &set.spec.selector)?;
        let key = workload.key();
        self.expectations.observe_inventory(&key, inventory.observed());
        let satisfied = self.expectations.satisfied(&key);
        let revisions = RevisionStore::new(store.as_ref()).reconcile(&set)?;

        Ok(Some(ReconcileData {
            desired: set,
            observed: CloneSetObserved {
                inventory,
                revisions,
                satisfied,
                now: Utc::now(),
            },
        }))
    }

    fn diff(
        &self,
        _target: &ControllerTarget,
        set: &Self::Desired,
        observed: &Self::Observed,
    ) -> Result<Self::Plan, Self::Error> {
        let in_use = observed
            .inventory
            .active
            .iter()
            .chain(observed.inventory.terminating.iter())
            .filter_map(|unit| unit.revision().map(str::to_string))
            .collect();
        let mut plan = CloneSetPlan {
            set: set.clone(),
            revisions: observed.revisions.clone(),
            step: PassStep::Waiting,
            actions: Vec::new(),
            status: calculate_status(set, observed),
            in_use,
        };
        if !observed.satisfied {
            return Ok(plan);
        }

        let strategy = match resolve_strategy(set) {
            Ok(strategy) => strategy,
            Err(ControllerError::Invalid(message)) => {
                plan.step = PassStep::Invalid(message);
                return Ok(plan);
            }
            Err(err) => return Err(err),
        };

        let inventory = &observed.inventory;
        let orphan_instance_ids = inventory.orphan_instance_ids();
        let used_ordinals = inventory.used_ordinals();
        let scale = plan_scale(
            &ScaleInput {
                desired: set.spec.replicas,
                active: &inventory.active,
                terminating: inventory.terminating.len(),
                update_revision: observed.revisions.update.name(),
                pods_to_delete: &set.spec.scale_strategy.pods_to_delete,
                max_surge: strategy.max_surge,
                update_in_progress: observed.revisions.update_in_progress(),
                orphan_instance_ids: &orphan_instance_ids,
                used_ordinals: &used_ordinals,
            },
            generate_instance_id,
        );
        if scale.has_actions() {
            plan.actions = scale_actions(set, observed, &scale, strategy.partition)?;
            plan.step = PassStep::Scale {
                creates: !scale.creates.is_empty(),
            };
            return Ok(plan);
        }

        let update_strategy = &set.spec.update_strategy;
        let update = plan_update(&UpdateInput {
            units: &inventory.active,
            total: set.spec.replicas,
            revisions: &observed.revisions,
            strategy: update_strategy.r#type,
            max_unavailable: update_strategy.max_unavailable.as_ref(),
            partition: strategy.partition,
            paused: update_strategy.paused,
            min_ready_seconds: set.spec.min_ready_seconds,
            retain_volumes: !set.spec.scale_strategy.volume_retention_policy.is_delete(),
            now: observed.now,
        })?;
        plan.actions = update_actions(observed, &update)?;
        plan.step = PassStep::Update {
            blocked: update.blocked,
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
        let CloneSetPlan {
            set,
            revisions,
            step,
            actions,
            mut status,
            in_use,
        } = plan;
        let workload = WorkloadRef::for_cloneset(&set);
        let logger = WorkloadLogger::new(CONTROLLER_NAME, &workload.namespace, &workload.name);
        let now = Utc::now();
        let mut errors = Vec::new();

        match step {
            PassStep::Waiting => {
                let pending = self.expectations.pending(&workload.key()).to_string();
                logger.debug(
                    "Waiting for earlier unit actions to be observed",
                    &[("pending", pending.as_str())],
                );
            }
            PassStep::Invalid(message) => {
                logger.warn("Rejected update strategy", &[("error", message.as_str())]);
                events.record(
                    &workload.object_reference(),
                    EventType::Warning,
                    REASON_INVALID_SPEC,
                    &message,
                );
                set_condition(
                    &mut status.conditions,
                    WorkloadConditionKind::FailedUpdate,
                    true,
                    WorkloadConditionReason::InvalidSpec,
                    message.clone(),
                    now,
                );
                errors.push(ControllerError::Invalid(message));
            }
            PassStep::Scale { creates } => {
                let requested = actions.len().to_string();
                logger.info("Scaling units", &[("actions", requested.as_str())]);
                let report = self.execute(
                    &workload,
                    &revisions,
                    &logger,
                    store.as_ref(),
                    events.as_ref(),
                    actions,
                );
                match report.errors.first() {
                    None => remove_condition(&mut status.conditions, WorkloadConditionKind::FailedScale),
                    Some(first) => set_condition(
                        &mut status.conditions,
                        WorkloadConditionKind::FailedScale,
                        true,
                        if creates {
                            WorkloadConditionReason::CreateFailed
                        } else {
                            WorkloadConditionReason::DeleteFailed
                        },
                        first.to_string(),
                        now,
                    ),
                }
                errors.extend(report.errors);
            }
            PassStep::Update { blocked } => {
                remove_condition(&mut status.conditions, WorkloadConditionKind::FailedScale);
                let report = if actions.is_empty() {
                    ExecutionReport::default()
                } else {
                    let requested = actions.len().to_string();
                    logger.info(
                        "Updating units",
                        &[
                            ("actions", requested.as_str()),
                            ("revision", revisions.update.name()),
                        ],
                    );
                    self.execute(
                        &workload,
                        &revisions,
                        &logger,
                        store.as_ref(),
                        events.as_ref(),
                        actions,
                    )
                };
                if !blocked.is_empty() {
                    let message = format!(
                        "units {} cannot be updated in place",
                        blocked.join(", ")
                    );
                    logger.warn("In-place update impossible", &[("units", message.as_str())]);
                    set_condition(
                        &mut status.conditions,
                        WorkloadConditionKind::FailedUpdate,
                        true,
                        WorkloadConditionReason::InPlaceUnsupported,
                        message,
                        now,
                    );
                } else if let Some(first) = report.errors.first() {
                    set_condition(
                        &mut status.conditions,
                        WorkloadConditionKind::FailedUpdate,
                        true,
                        WorkloadConditionReason::UpdateFailed,
                        first.to_string(),
                        now,
                    );
                } else {
                    remove_condition(&mut status.conditions, WorkloadConditionKind::FailedUpdate);
                }
                errors.extend(report.errors);
            }
        }

        if set.status.as_ref() != Some(&status) {
            let mut updated = set.clone();
            updated.status = Some(status.clone());
            match store.update_status_as(&workload.namespace, &updated) {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => errors.push(err.into()),
            }
        }

        match RevisionStore::new(store.as_ref()).truncate_history(
            &set,
            &revisions,
            &in_use,
            self.revision_history_limit,
        ) {
            Ok(deleted) if !deleted.is_empty() => {
                let deleted = deleted.join(",");
                logger.debug("Pruned revision history", &[("revisions", deleted.as_str())]);
            }
            Ok(_) => {}
            Err(err) => errors.push(err),
        }

        metrics::set_workload_replicas(
            CONTROLLER_NAME,
            Some(&workload.namespace),
            &workload.name,
            i64::from(set.spec.replicas),
            i64::from(status.ready_replicas),
            i64::from(status.updated_replicas),
        );
        ControllerError::aggregate(errors)
    }
}

impl CloneSetController {
    fn execute(
        &self,
        workload: &WorkloadRef,
        revisions: &RevisionSet,
        logger: &WorkloadLogger,
        store: &dyn ObjectStore,
        events: &dyn EventRecorder,
        actions: Vec<UnitAction>,
    ) -> ExecutionReport {
        let ctx = ExecutionContext {
            store,
            expectations: &self.expectations,
            workload,
            revision: revisions.update.name(),
            events,
            logger,
            slow_start_initial: self.slow_start_initial,
            controller: CONTROLLER_NAME,
        };
        BatchExecutor::execute(&ctx, actions)
    }
}
