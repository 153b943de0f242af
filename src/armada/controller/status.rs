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

use crate::armada::k8s::cloneset::WorkloadCondition;
use chrono::{DateTime, Utc};
use std::fmt::{Display, Formatter};

/// Condition types reported on CloneSet and UnitedDeployment status.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum WorkloadConditionKind {
    FailedScale,
    FailedUpdate,
    SubsetProvisioned,
    SubsetUpdated,
}

impl WorkloadConditionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            WorkloadConditionKind::FailedScale => "FailedScale",
            WorkloadConditionKind::FailedUpdate => "FailedUpdate",
            WorkloadConditionKind::SubsetProvisioned => "SubsetProvisioned",
            WorkloadConditionKind::SubsetUpdated => "SubsetUpdated",
        }
    }

    pub const fn summary(self) -> &'static str {
        match self {
            WorkloadConditionKind::FailedScale => "Units could not be created or deleted.",
            WorkloadConditionKind::FailedUpdate => {
                "Units could not be moved to the update revision."
            }
            WorkloadConditionKind::SubsetProvisioned => {
                "Every topology subset has a backing object."
            }
            WorkloadConditionKind::SubsetUpdated => {
                "Every subset matches its replicas, partition and revision."
            }
        }
    }
}

impl Display for WorkloadConditionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reasons attached to condition transitions.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum WorkloadConditionReason {
    InvalidSpec,
    CreateFailed,
    DeleteFailed,
    InPlaceUnsupported,
    UpdateFailed,
    Provisioned,
    ProvisionFailed,
    Updated,
    UpdateSubsetFailed,
}

impl WorkloadConditionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            WorkloadConditionReason::InvalidSpec => "InvalidSpec",
            WorkloadConditionReason::CreateFailed => "CreateFailed",
            WorkloadConditionReason::DeleteFailed => "DeleteFailed",
            WorkloadConditionReason::InPlaceUnsupported => "InPlaceUnsupported",
            WorkloadConditionReason::UpdateFailed => "UpdateFailed",
            WorkloadConditionReason::Provisioned => "Provisioned",
            WorkloadConditionReason::ProvisionFailed => "ProvisionFailed",
            WorkloadConditionReason::Updated => "Updated",
            WorkloadConditionReason::UpdateSubsetFailed => "UpdateSubsetFailed",
        }
    }
}

impl Display for WorkloadConditionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn find_condition(
    conditions: &[WorkloadCondition],
    kind: WorkloadConditionKind,
) -> Option<&WorkloadCondition> {
    conditions
        .iter()
        .find(|condition| condition.condition_type == kind.as_str())
}

/// Upserts a condition. The transition time moves only when the status
/// flips.
pub fn set_condition(
    conditions: &mut Vec<WorkloadCondition>,
    kind: WorkloadConditionKind,
    status: bool,
    reason: WorkloadConditionReason,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    let status = if status { "True" } else { "False" }.to_string();
    let message = message.into();
    match conditions
        .iter_mut()
        .find(|condition| condition.condition_type == kind.as_str())
    {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Some(now);
            }
            existing.status = status;
            existing.reason = Some(reason.as_str().to_string());
            existing.message = Some(message);
        }
        None => conditions.push(WorkloadCondition {
            condition_type: kind.as_str().to_string(),
            status,
            last_transition_time: Some(now),
            reason: Some(reason.as_str().to_string()),
            message: Some(message),
        }),
    }
}

pub fn remove_condition(conditions: &mut Vec<WorkloadCondition>, kind: WorkloadConditionKind) {
    conditions.retain(|condition| condition.condition_type != kind.as_str());
}
