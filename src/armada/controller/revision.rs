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

//! Content-addressed revision history for workload unit templates.

use crate::armada::controller::error::ControllerError;
use crate::armada::controller::inventory::WorkloadRef;
use crate::armada::k8s::client::{ObjectStore, ObjectStoreExt, ResourceKind};
use crate::armada::k8s::cloneset::CloneSet;
use crate::armada::k8s::pod::ObjectMeta;
use crate::armada::k8s::revision::ControllerRevision;
use crate::armada::k8s::statefulset::LabelSelector;
use crate::armada::k8s::uniteddeployment::UnitedDeployment;
use crate::armada::logger::log_debug;
use crate::armada::util::error::ErrorKind;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::collections::HashSet;

/// Label on units and revisions naming the template revision.
pub const LABEL_REVISION_HASH: &str = "controller-revision-hash";
pub const DEFAULT_REVISION_HISTORY_LIMIT: usize = 10;

const MAX_COLLISION_RETRIES: u32 = 5;
const REVISION_HASH_LENGTH: usize = 10;

/// Workload whose unit template is tracked as revisions.
pub trait RevisionedWorkload {
    fn workload_ref(&self) -> WorkloadRef;

    /// Snapshot stored in the revision; replicas and strategy are excluded.
    fn revision_payload(&self) -> Result<Value, ControllerError>;

    fn current_revision_name(&self) -> Option<&str>;

    fn collision_count(&self) -> u32;

    fn revision_history_limit(&self) -> Option<u32>;

    fn selector(&self) -> &LabelSelector;
}

impl RevisionedWorkload for CloneSet {
    fn workload_ref(&self) -> WorkloadRef {
        WorkloadRef::for_cloneset(self)
    }

    fn revision_payload(&self) -> Result<Value, ControllerError> {
        Ok(json!({ "spec": { "template": serde_json::to_value(&self.spec.template)? } }))
    }

    fn current_revision_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.current_revision.as_deref())
    }

    fn collision_count(&self) -> u32 {
        self.status
            .as_ref()
            .map(|status| status.collision_count)
            .unwrap_or(0)
    }

    fn revision_history_limit(&self) -> Option<u32> {
        self.spec.revision_history_limit
    }

    fn selector(&self) -> &LabelSelector {
        &self.spec.selector
    }
}

impl RevisionedWorkload for UnitedDeployment {
    fn workload_ref(&self) -> WorkloadRef {
        WorkloadRef::for_united_deployment(self)
    }

    fn revision_payload(&self) -> Result<Value, ControllerError> {
        Ok(json!({ "spec": { "template": serde_json::to_value(&self.spec.template)? } }))
    }

    fn current_revision_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.current_revision.as_deref())
    }

    fn collision_count(&self) -> u32 {
        self.status
            .as_ref()
            .map(|status| status.collision_count)
            .unwrap_or(0)
    }

    fn revision_history_limit(&self) -> Option<u32> {
        self.spec.revision_history_limit
    }

    fn selector(&self) -> &LabelSelector {
        &self.spec.selector
    }
}

/// Hex sha1 over the canonical payload and the collision count.
pub fn hash_revision(payload: &Value, collision_count: u32) -> Result<String, ControllerError> {
    // serde_json maps keep keys sorted, so the encoding is canonical.
    let mut bytes = serde_json::to_vec(payload)?;
    if collision_count > 0 {
        bytes.extend_from_slice(collision_count.to_string().as_bytes());
    }
    Ok(format!("{:x}", Sha1::digest(&bytes)))
}

pub fn revision_name(workload: &str, hash: &str) -> String {
    let end = hash.len().min(REVISION_HASH_LENGTH);
    format!("{}-{}", workload, &hash[..end])
}

/// Revisions resolved for one pass.
#[derive(Debug, Clone)]
pub struct RevisionSet {
    pub current: ControllerRevision,
    pub update: ControllerRevision,
    /// Every owned revision, oldest first.
    pub history: Vec<ControllerRevision>,
    pub collision_count: u32,
}

impl RevisionSet {
    pub fn find(&self, name: &str) -> Option<&ControllerRevision> {
        self.history.iter().find(|revision| revision.name() == name)
    }

    pub fn update_in_progress(&self) -> bool {
        self.current.name() != self.update.name()
    }
}

pub struct RevisionStore<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> RevisionStore<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self { store }
    }

    /// Owned revisions sorted by sequence, then name.
    pub fn list(
        &self,
        workload: &WorkloadRef,
        selector: &LabelSelector,
    ) -> Result<Vec<ControllerRevision>, ControllerError> {
        let mut revisions: Vec<ControllerRevision> = self
            .store
            .list_as::<ControllerRevision>(&workload.namespace, Some(selector))?
            .into_iter()
            .filter(|revision| revision.metadata.is_controlled_by(&workload.uid))
            .collect();
        revisions.sort_by(|a, b| {
            a.revision
                .cmp(&b.revision)
                .then_with(|| a.name().cmp(b.name()))
        });
        Ok(revisions)
    }

    /// Resolves current and update revisions, creating or re-sequencing the
    /// update revision as needed.
    pub fn reconcile<W: RevisionedWorkload>(
        &self,
        workload: &W,
    ) -> Result<RevisionSet, ControllerError> {
        let reference = workload.workload_ref();
        let payload = workload.revision_payload()?;
        let mut history = self.list(&reference, workload.selector())?;
        let mut collision_count = workload.collision_count();
        let max_revision = history.iter().map(|revision| revision.revision).max().unwrap_or(0);

        let equal = history
            .iter()
            .rposition(|revision| revision.data == payload);
        let update = match equal {
            Some(index) => {
                let existing = history[index].clone();
                let newest = existing.revision == max_revision
                    && history
                        .iter()
                        .filter(|revision| revision.revision == max_revision)
                        .count()
                        == 1;
                if newest {
                    existing
                } else {
                    let bumped = self.resequence(&reference, existing, max_revision + 1)?;
                    history[index] = bumped.clone();
                    bumped
                }
            }
            None => {
                let created = self.create_revision(
                    &reference,
                    workload.selector(),
                    &payload,
                    max_revision + 1,
                    &mut collision_count,
                )?;
                if let Some(index) = history.iter().position(|r| r.name() == created.name()) {
                    history[index] = created.clone();
                } else {
                    history.push(created.clone());
                }
                created
            }
        };
        history.sort_by(|a, b| {
            a.revision
                .cmp(&b.revision)
                .then_with(|| a.name().cmp(b.name()))
        });

        let current = workload
            .current_revision_name()
            .and_then(|name| history.iter().find(|revision| revision.name() == name))
            .cloned()
            .unwrap_or_else(|| update.clone());

        Ok(RevisionSet {
            current,
            update,
            history,
            collision_count,
        })
    }

    fn resequence(
        &self,
        workload: &WorkloadRef,
        mut revision: ControllerRevision,
        sequence: i64,
    ) -> Result<ControllerRevision, ControllerError> {
        let previous = revision.revision.to_string();
        revision.revision = sequence;
        let updated = self.store.update_as(&workload.namespace, &revision)?;
        let next = sequence.to_string();
        log_debug(
            "revision-store",
            "Re-sequenced revision",
            &[
                ("namespace", workload.namespace.as_str()),
                ("workload", workload.name.as_str()),
                ("revision", updated.name()),
                ("from", previous.as_str()),
                ("to", next.as_str()),
            ],
        );
        Ok(updated)
    }

    fn create_revision(
        &self,
        workload: &WorkloadRef,
        selector: &LabelSelector,
        payload: &Value,
        sequence: i64,
        collision_count: &mut u32,
    ) -> Result<ControllerRevision, ControllerError> {
        for _ in 0..=MAX_COLLISION_RETRIES {
            let hash = hash_revision(payload, *collision_count)?;
            let name = revision_name(&workload.name, &hash);
            let mut labels = selector.match_labels.clone();
            labels.insert(LABEL_REVISION_HASH.to_string(), name.clone());
            let revision = ControllerRevision::new(
                ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(workload.namespace.clone()),
                    labels,
                    owner_references: vec![workload.owner_reference()],
                    ..Default::default()
                },
                payload.clone(),
                sequence,
            );

            match self.store.create_as(&workload.namespace, &revision) {
                Ok(created) => {
                    let sequence = sequence.to_string();
                    log_debug(
                        "revision-store",
                        "Created revision",
                        &[
                            ("namespace", workload.namespace.as_str()),
                            ("workload", workload.name.as_str()),
                            ("revision", name.as_str()),
                            ("sequence", sequence.as_str()),
                        ],
                    );
                    return Ok(created);
                }
                Err(err) if err.kind == ErrorKind::AlreadyExists => {
                    let existing: ControllerRevision =
                        self.store.get_as(&workload.namespace, &name)?;
                    if existing.data == *payload
                        && existing.metadata.is_controlled_by(&workload.uid)
                    {
                        return Ok(existing);
                    }
                    *collision_count += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ControllerError::Internal(format!(
            "revision hash for {}/{} still collides after {} attempts",
            workload.namespace, workload.name, MAX_COLLISION_RETRIES
        )))
    }

    /// Deletes the oldest unprotected revisions beyond the history limit.
    /// Current, update and in-use revisions are never deleted and do not
    /// count toward the limit.
    pub fn truncate_history<W: RevisionedWorkload>(
        &self,
        workload: &W,
        revisions: &RevisionSet,
        in_use: &HashSet<String>,
        default_limit: usize,
    ) -> Result<Vec<String>, ControllerError> {
        let limit = workload
            .revision_history_limit()
            .map(|limit| limit as usize)
            .unwrap_or(default_limit);
        let candidates: Vec<&ControllerRevision> = revisions
            .history
            .iter()
            .filter(|revision| {
                let name = revision.name();
                name != revisions.current.name()
                    && name != revisions.update.name()
                    && !in_use.contains(name)
            })
            .collect();
        if candidates.len() <= limit {
            return Ok(Vec::new());
        }

        let reference = workload.workload_ref();
        let mut deleted = Vec::new();
        for revision in candidates.iter().take(candidates.len() - limit) {
            match self.store.delete(
                ResourceKind::ControllerRevision,
                &reference.namespace,
                revision.name(),
            ) {
                Ok(()) => deleted.push(revision.name().to_string()),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(deleted)
    }
}
