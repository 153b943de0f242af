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

use crate::armada::controller::inventory::Unit;
use std::cmp::{min, Reverse};
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Observed state the scale decision is made from.
pub struct ScaleInput<'a> {
    pub desired: u32,
    pub active: &'a [Unit],
    pub terminating: usize,
    pub update_revision: &'a str,
    pub pods_to_delete: &'a [String],
    /// Resolved surge allowance; only applies while an update is in progress.
    pub max_surge: u32,
    pub update_in_progress: bool,
    pub orphan_instance_ids: &'a [String],
    pub used_ordinals: &'a BTreeSet<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCreate {
    pub ordinal: u32,
    pub instance_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionReason {
    /// Named in `podsToDelete`.
    Requested,
    ScaleDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleDeletion {
    pub name: String,
    pub reason: DeletionReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalePlan {
    pub creates: Vec<PlannedCreate>,
    /// Creates held back by the surge headroom; re-planned next pass.
    pub deferred: u32,
    pub deletions: Vec<ScaleDeletion>,
}

impl ScalePlan {
    /// True when the pass has scale work to issue.
    pub fn has_actions(&self) -> bool {
        !self.creates.is_empty() || !self.deletions.is_empty()
    }
}

/// Scale-down order: not ready, then stale, then highest ordinal, then
/// newest, then name.
fn deletion_priority<'a>(
    unit: &'a Unit,
    update_revision: &str,
) -> (
    bool,
    bool,
    Reverse<u32>,
    Reverse<Option<chrono::DateTime<chrono::Utc>>>,
    &'a str,
) {
    (
        unit.is_ready(),
        unit.revision() == Some(update_revision),
        Reverse(unit.ordinal),
        Reverse(unit.created_at()),
        unit.name(),
    )
}

pub fn plan_scale(input: &ScaleInput<'_>, mut next_id: impl FnMut() -> String) -> ScalePlan {
    let mut plan = ScalePlan::default();
    let requested: HashSet<&str> = input.pods_to_delete.iter().map(String::as_str).collect();

    let mut remaining = Vec::new();
    for unit in input.active {
        if requested.contains(unit.name()) {
            plan.deletions.push(ScaleDeletion {
                name: unit.name().to_string(),
                reason: DeletionReason::Requested,
            });
        } else {
            remaining.push(unit);
        }
    }

    let desired = input.desired as usize;
    if remaining.len() > desired {
        remaining.sort_by(|a, b| {
            deletion_priority(a, input.update_revision)
                .cmp(&deletion_priority(b, input.update_revision))
        });
        let excess = remaining.len() - desired;
        plan.deletions
            .extend(remaining.iter().take(excess).map(|unit| ScaleDeletion {
                name: unit.name().to_string(),
                reason: DeletionReason::ScaleDown,
            }));
        return plan;
    }

    let wanted = desired - remaining.len();
    if wanted == 0 {
        return plan;
    }
    let surge = if input.update_in_progress {
        input.max_surge as usize
    } else {
        0
    };
    let occupied = input.active.len() + input.terminating;
    let headroom = (desired + surge).saturating_sub(occupied);
    let to_create = min(wanted, headroom);
    plan.deferred = (wanted - to_create) as u32;

    let mut orphans: VecDeque<&String> = input.orphan_instance_ids.iter().collect();
    let mut ordinal = 0u32;
    for _ in 0..to_create {
        while input.used_ordinals.contains(&ordinal) {
            ordinal += 1;
        }
        let instance_id = orphans
            .pop_front()
            .cloned()
            .unwrap_or_else(&mut next_id);
        plan.creates.push(PlannedCreate {
            ordinal,
            instance_id,
        });
        ordinal += 1;
    }
    plan
}
