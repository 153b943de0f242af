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

//! Rolling update planning.
//!
//! Selects which stale units move to the update revision this pass, bounded
//! by `maxUnavailable` and frozen below the partition ordinal, and decides
//! per unit between recreation and an in-place patch.

use crate::armada::controller::error::ControllerError;
use crate::armada::controller::inplace::{self, InPlaceDiff};
use crate::armada::controller::inventory::Unit;
use crate::armada::controller::revision::RevisionSet;
use crate::armada::k8s::cloneset::CloneSetUpdateStrategyType;
use crate::armada::k8s::intstr::{IntOrString, Rounding};
use crate::armada::k8s::pod::CONDITION_IN_PLACE_UPDATE_READY;
use crate::armada::k8s::revision::ControllerRevision;
use crate::armada::k8s::statefulset::PodTemplateSpec;
use crate::armada::logger::log_warn;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashSet;

/// Default unavailability budget when the strategy leaves it unset.
const DEFAULT_MAX_UNAVAILABLE_PERCENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitUpdateState {
    Current,
    PendingUpdate,
    /// On the update revision with an in-place update still running.
    Updating,
    Deleted,
}

pub fn unit_state(unit: &Unit, update_revision: &str) -> UnitUpdateState {
    if unit.is_terminating() {
        UnitUpdateState::Deleted
    } else if unit.revision() != Some(update_revision) {
        UnitUpdateState::PendingUpdate
    } else if inplace::is_updating(&unit.pod) {
        UnitUpdateState::Updating
    } else {
        UnitUpdateState::Current
    }
}

/// Unit template recorded in a CloneSet revision.
pub fn revision_template(revision: &ControllerRevision) -> Result<PodTemplateSpec, ControllerError> {
    let template = revision.data.pointer("/spec/template").ok_or_else(|| {
        ControllerError::Internal(format!(
            "revision {} carries no unit template",
            revision.name()
        ))
    })?;
    Ok(serde_json::from_value(template.clone())?)
}

/// Indexes into `units` of stale units at or above the partition ordinal,
/// not-ready first, then the most recently ready, then by ordinal.
pub fn wait_update_indexes(units: &[Unit], update_revision: &str, partition: u32) -> Vec<usize> {
    let mut indexes: Vec<usize> = units
        .iter()
        .enumerate()
        .filter(|(_, unit)| {
            !unit.is_terminating()
                && unit.revision() != Some(update_revision)
                && unit.ordinal >= partition
        })
        .map(|(index, _)| index)
        .collect();
    indexes.sort_by_key(|&index| {
        let unit = &units[index];
        (unit.is_ready(), Reverse(unit.pod.ready_since()), unit.ordinal)
    });
    indexes
}

/// Resolves `maxUnavailable` against `total`. Percentages round up and the
/// result is at least one unless the strategy explicitly asks for zero.
pub fn resolve_max_unavailable(
    max_unavailable: Option<&IntOrString>,
    total: u32,
) -> Result<u32, ControllerError> {
    let default = IntOrString::percent(DEFAULT_MAX_UNAVAILABLE_PERCENT);
    let value = max_unavailable.unwrap_or(&default);
    let resolved = value
        .scaled_value(total, Rounding::Up, "maxUnavailable")
        .map_err(ControllerError::Invalid)?;
    if resolved == 0 && !value.is_zero() {
        return Ok(1);
    }
    Ok(resolved)
}

/// Number of waiting units that may start updating this pass.
///
/// Units that are already unavailable, or missing entirely, consume the
/// budget first. A not-ready candidate is always taken since updating it
/// does not lower availability; a ready candidate stops the walk once the
/// budget is spent.
pub fn calculate_update_count(
    max_unavailable: Option<&IntOrString>,
    total: u32,
    wait_indexes: &[usize],
    units: &[Unit],
    min_ready_seconds: u32,
    now: DateTime<Utc>,
) -> Result<usize, ControllerError> {
    let budget = resolve_max_unavailable(max_unavailable, total)? as usize;
    let available = |unit: &Unit| {
        unit.pod.is_available(min_ready_seconds, now) && !inplace::is_updating(&unit.pod)
    };
    let missing = (total as usize).saturating_sub(units.len());
    let mut used = units.iter().filter(|unit| !available(unit)).count() + missing;

    let mut count = 0;
    for &index in wait_indexes {
        let Some(unit) = units.get(index) else {
            continue;
        };
        if available(unit) {
            if used >= budget {
                break;
            }
            used += 1;
        }
        count += 1;
    }
    Ok(count)
}

/// Volumes of `unit` that no other unit mounts or owns.
pub fn exclusive_volumes(unit: &Unit, units: &[Unit]) -> Vec<String> {
    let shared: HashSet<&str> = units
        .iter()
        .filter(|other| other.name() != unit.name())
        .flat_map(|other| {
            let mounted = other
                .pod
                .spec
                .volumes
                .iter()
                .filter_map(|volume| volume.persistent_volume_claim.as_ref())
                .map(|claim| claim.claim_name.as_str());
            let owned = other.volumes.iter().map(|pvc| pvc.name());
            mounted.chain(owned)
        })
        .collect();
    unit.volumes
        .iter()
        .map(|pvc| pvc.name())
        .filter(|name| !shared.contains(name))
        .map(str::to_string)
        .collect()
}

pub struct UpdateInput<'a> {
    /// Active units.
    pub units: &'a [Unit],
    pub total: u32,
    pub revisions: &'a RevisionSet,
    pub strategy: CloneSetUpdateStrategyType,
    pub max_unavailable: Option<&'a IntOrString>,
    pub partition: u32,
    pub paused: bool,
    pub min_ready_seconds: u32,
    /// Keep recreated units' volumes for their replacements.
    pub retain_volumes: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecreateUnit {
    pub name: String,
    pub volumes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InPlaceUpdate {
    pub name: String,
    pub diff: InPlaceDiff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionFix {
    /// Declared readiness gate with no condition yet.
    Backfill,
    /// In-place update observed complete.
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    pub recreate: Vec<RecreateUnit>,
    pub in_place: Vec<InPlaceUpdate>,
    /// Units `InPlaceOnly` cannot move; surfaced as a `FailedUpdate` condition.
    pub blocked: Vec<String>,
    pub condition_fixes: Vec<(String, ConditionFix)>,
}

impl UpdatePlan {
    pub fn has_actions(&self) -> bool {
        !self.recreate.is_empty() || !self.in_place.is_empty() || !self.condition_fixes.is_empty()
    }
}

pub fn plan_update(input: &UpdateInput<'_>) -> Result<UpdatePlan, ControllerError> {
    let update_revision = input.revisions.update.name();
    let mut plan = UpdatePlan::default();

    for unit in input.units {
        let pod = &unit.pod;
        match unit_state(unit, update_revision) {
            UnitUpdateState::Current
                if pod.spec.has_readiness_gate(CONDITION_IN_PLACE_UPDATE_READY)
                    && pod.condition(CONDITION_IN_PLACE_UPDATE_READY).is_none() =>
            {
                plan.condition_fixes
                    .push((unit.name().to_string(), ConditionFix::Backfill));
            }
            UnitUpdateState::Updating => match inplace::is_update_completed(pod) {
                Ok(false) => {}
                Ok(true) => plan
                    .condition_fixes
                    .push((unit.name().to_string(), ConditionFix::Completed)),
                // Unreadable state cannot be checked; release the unit.
                Err(err) => {
                    let error = err.to_string();
                    log_warn(
                        "cloneset-update",
                        "Discarding unreadable in-place update state",
                        &[("unit", unit.name()), ("error", error.as_str())],
                    );
                    plan.condition_fixes
                        .push((unit.name().to_string(), ConditionFix::Completed));
                }
            },
            _ => {}
        }
    }

    if input.paused {
        return Ok(plan);
    }

    let wait = wait_update_indexes(input.units, update_revision, input.partition);
    let count = calculate_update_count(
        input.max_unavailable,
        input.total,
        &wait,
        input.units,
        input.min_ready_seconds,
        input.now,
    )?;
    if count == 0 {
        return Ok(plan);
    }
    let target = revision_template(&input.revisions.update)?;

    for &index in wait.iter().take(count) {
        let unit = &input.units[index];
        let diff = match unit.revision() {
            Some(name) => {
                let revision = input.revisions.find(name).ok_or_else(|| {
                    ControllerError::Internal(format!(
                        "unit {} references unknown revision {}",
                        unit.name(),
                        name
                    ))
                })?;
                inplace::diff_templates(&revision_template(revision)?, &target)
            }
            None => None,
        };
        match (input.strategy, diff) {
            (CloneSetUpdateStrategyType::InPlaceIfPossible, Some(diff))
            | (CloneSetUpdateStrategyType::InPlaceOnly, Some(diff)) => {
                plan.in_place.push(InPlaceUpdate {
                    name: unit.name().to_string(),
                    diff,
                });
            }
            (CloneSetUpdateStrategyType::InPlaceOnly, None) => {
                plan.blocked.push(unit.name().to_string());
            }
            _ => plan.recreate.push(RecreateUnit {
                name: unit.name().to_string(),
                volumes: if input.retain_volumes {
                    Vec::new()
                } else {
                    exclusive_volumes(unit, input.units)
                },
            }),
        }
    }
    Ok(plan)
}
