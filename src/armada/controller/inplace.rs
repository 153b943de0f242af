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

//! In-place unit updates.
//!
//! Only container images and template labels/annotations may change without
//! recreating a unit. The pre-patch container image IDs are recorded in a
//! typed annotation so completion can be detected once the runtime reports
//! new image IDs for every patched container.

use crate::armada::controller::error::ControllerError;
use crate::armada::controller::revision::LABEL_REVISION_HASH;
use crate::armada::k8s::pod::{Pod, PodCondition, CONDITION_IN_PLACE_UPDATE_READY};
use crate::armada::k8s::statefulset::PodTemplateSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

pub const ANNOTATION_INPLACE_STATE: &str = "apps.armada.io/inplace-update-state";
pub const REASON_START_INPLACE_UPDATE: &str = "StartInPlaceUpdate";

/// Annotation payload describing the last in-place update of a unit.
/// Fields written by newer controllers are carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InPlaceUpdateState {
    pub revision: String,
    pub update_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub last_container_statuses: BTreeMap<String, LastContainerStatus>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastContainerStatus {
    #[serde(rename = "imageID", default)]
    pub image_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Changes between two templates that can be applied to a running unit.
/// `None` values in the label and annotation maps are removals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InPlaceDiff {
    pub images: BTreeMap<String, String>,
    pub labels: BTreeMap<String, Option<String>>,
    pub annotations: BTreeMap<String, Option<String>>,
}

impl InPlaceDiff {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.labels.is_empty() && self.annotations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InPlaceOutcome {
    Patched(Pod),
    AlreadyCurrent,
}

fn map_diff(
    old: &HashMap<String, String>,
    new: &HashMap<String, String>,
) -> BTreeMap<String, Option<String>> {
    let mut diff = BTreeMap::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            diff.insert(key.clone(), Some(value.clone()));
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            diff.insert(key.clone(), None);
        }
    }
    diff
}

/// Returns the in-place diff from `old` to `new`, or `None` when anything
/// outside the image and metadata whitelist changed.
pub fn diff_templates(old: &PodTemplateSpec, new: &PodTemplateSpec) -> Option<InPlaceDiff> {
    let old_names: Vec<&str> = old.spec.containers.iter().map(|c| c.name.as_str()).collect();
    let new_names: Vec<&str> = new.spec.containers.iter().map(|c| c.name.as_str()).collect();
    if old_names != new_names {
        return None;
    }

    let mut old_spec = old.spec.clone();
    let mut new_spec = new.spec.clone();
    let mut images = BTreeMap::new();
    for (before, after) in old_spec.containers.iter_mut().zip(new_spec.containers.iter_mut()) {
        if before.image != after.image {
            images.insert(after.name.clone(), after.image.clone().unwrap_or_default());
        }
        before.image = None;
        after.image = None;
    }
    if old_spec != new_spec {
        return None;
    }

    let mut old_meta = old.metadata.clone();
    let mut new_meta = new.metadata.clone();
    let labels = map_diff(&old_meta.labels, &new_meta.labels);
    let annotations = map_diff(&old_meta.annotations, &new_meta.annotations);
    old_meta.labels.clear();
    old_meta.annotations.clear();
    new_meta.labels.clear();
    new_meta.annotations.clear();
    if old_meta != new_meta {
        return None;
    }

    Some(InPlaceDiff {
        images,
        labels,
        annotations,
    })
}

pub fn read_state(pod: &Pod) -> Result<Option<InPlaceUpdateState>, ControllerError> {
    match pod.metadata.annotations.get(ANNOTATION_INPLACE_STATE) {
        Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        None => Ok(None),
    }
}

/// Patches `pod` towards `target_revision`. A pod already labelled with the
/// target revision is left alone.
pub fn apply(
    pod: &Pod,
    target_revision: &str,
    diff: &InPlaceDiff,
    now: DateTime<Utc>,
) -> Result<InPlaceOutcome, ControllerError> {
    let current = pod.metadata.labels.get(LABEL_REVISION_HASH);
    if current.map(String::as_str) == Some(target_revision) {
        return Ok(InPlaceOutcome::AlreadyCurrent);
    }

    let observed: HashMap<&str, &str> = pod
        .status
        .as_ref()
        .map(|status| {
            status
                .container_statuses
                .iter()
                .map(|c| (c.name.as_str(), c.image_id.as_deref().unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default();

    let mut patched = pod.clone();
    let mut last_container_statuses = BTreeMap::new();
    for container in patched.spec.containers.iter_mut() {
        let Some(image) = diff.images.get(&container.name) else {
            continue;
        };
        last_container_statuses.insert(
            container.name.clone(),
            LastContainerStatus {
                image_id: observed
                    .get(container.name.as_str())
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
                extra: Map::new(),
            },
        );
        container.image = Some(image.clone());
    }

    apply_map(&mut patched.metadata.labels, &diff.labels);
    apply_map(&mut patched.metadata.annotations, &diff.annotations);
    patched
        .metadata
        .labels
        .insert(LABEL_REVISION_HASH.to_string(), target_revision.to_string());

    let state = InPlaceUpdateState {
        revision: target_revision.to_string(),
        update_timestamp: now,
        last_container_statuses,
        extra: Map::new(),
    };
    patched.metadata.annotations.insert(
        ANNOTATION_INPLACE_STATE.to_string(),
        serde_json::to_string(&state)?,
    );
    patched.set_condition(
        PodCondition::new(CONDITION_IN_PLACE_UPDATE_READY, false, now)
            .with_reason(REASON_START_INPLACE_UPDATE),
    );
    Ok(InPlaceOutcome::Patched(patched))
}

fn apply_map(target: &mut HashMap<String, String>, changes: &BTreeMap<String, Option<String>>) {
    for (key, value) in changes {
        if key == ANNOTATION_INPLACE_STATE {
            continue;
        }
        match value {
            Some(value) => {
                target.insert(key.clone(), value.clone());
            }
            None => {
                target.remove(key);
            }
        }
    }
}

/// True while the unit's in-place readiness condition is held false by an
/// update this controller started.
pub fn is_updating(pod: &Pod) -> bool {
    pod.condition(CONDITION_IN_PLACE_UPDATE_READY)
        .map(|condition| {
            !condition.is_true()
                && condition.reason.as_deref() == Some(REASON_START_INPLACE_UPDATE)
        })
        .unwrap_or(false)
}

/// Every patched container reports an image ID different from the one
/// recorded before the patch.
pub fn is_update_completed(pod: &Pod) -> Result<bool, ControllerError> {
    let Some(state) = read_state(pod)? else {
        return Ok(true);
    };
    let statuses = match pod.status.as_ref() {
        Some(status) => &status.container_statuses,
        None => return Ok(state.last_container_statuses.is_empty()),
    };
    Ok(state.last_container_statuses.iter().all(|(name, last)| {
        statuses
            .iter()
            .find(|status| &status.name == name)
            .and_then(|status| status.image_id.as_deref())
            .map(|image_id| image_id != last.image_id)
            .unwrap_or(false)
    }))
}

/// Copy of `pod` with the in-place readiness condition restored. The state
/// annotation is kept.
pub fn mark_completed(pod: &Pod, now: DateTime<Utc>) -> Pod {
    let mut completed = pod.clone();
    completed.set_condition(PodCondition::new(CONDITION_IN_PLACE_UPDATE_READY, true, now));
    completed
}
