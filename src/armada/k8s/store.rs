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

//! In-memory `ObjectStore` used to drive the controllers end to end.
//!
//! Objects are kept as JSON keyed by kind, namespace and name. Writes bump a
//! store-wide resourceVersion and are broadcast to watchers while the state
//! lock is held, so subscribers observe them in commit order.

use super::client::{ObjectStore, ResourceKind, WatchEvent, WatchEventType};
use super::statefulset::LabelSelector;
use crate::armada::util::error::{ApiError, ErrorKind};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rand::Rng;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const WATCH_BUFFER_SIZE: usize = 1024;

pub(crate) fn normalize_namespace(namespace: Option<&str>) -> String {
    namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or("default")
        .to_string()
}

/// Store operation, used for call accounting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Patch,
    Delete,
}

impl Verb {
    fn is_mutation(self) -> bool {
        !matches!(self, Verb::Get | Verb::List)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
    kind: ResourceKind,
    namespace: String,
    name: String,
}

#[derive(Debug)]
struct Fault {
    kind: ResourceKind,
    verb: Verb,
    name: Option<String>,
    error: ApiError,
    /// Whether the call still takes effect before the error is returned.
    applies: bool,
}

struct StoreState {
    objects: BTreeMap<ObjectKey, Value>,
    resource_version: u64,
    clock: DateTime<Utc>,
    faults: VecDeque<Fault>,
    calls: HashMap<(Verb, ResourceKind), usize>,
}

pub struct MemoryStore {
    state: Mutex<StoreState>,
    events: broadcast::Sender<WatchEvent>,
    graceful_pod_deletion: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store with graceful pod deletion enabled.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Self {
            state: Mutex::new(StoreState {
                objects: BTreeMap::new(),
                resource_version: 0,
                clock: Utc::now(),
                faults: VecDeque::new(),
                calls: HashMap::new(),
            }),
            events,
            graceful_pod_deletion: true,
        }
    }

    /// When disabled, pod deletes remove the object immediately.
    pub fn with_graceful_pod_deletion(mut self, enabled: bool) -> Self {
        self.graceful_pod_deletion = enabled;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Fails the next matching call with `error` without applying it.
    pub fn inject_fault(&self, kind: ResourceKind, verb: Verb, error: ApiError) {
        self.push_fault(kind, verb, None, error, false);
    }

    /// Fails the next matching call on the named object.
    pub fn inject_fault_for(&self, kind: ResourceKind, verb: Verb, name: &str, error: ApiError) {
        self.push_fault(kind, verb, Some(name.to_string()), error, false);
    }

    /// Applies the next matching call but reports `Timeout`, as a request
    /// whose response was lost would.
    pub fn inject_lost_response(&self, kind: ResourceKind, verb: Verb) {
        self.push_fault(
            kind,
            verb,
            None,
            ApiError::new(ErrorKind::Timeout, "the server was unable to return a response in time"),
            true,
        );
    }

    fn push_fault(
        &self,
        kind: ResourceKind,
        verb: Verb,
        name: Option<String>,
        error: ApiError,
        applies: bool,
    ) {
        self.lock().faults.push_back(Fault {
            kind,
            verb,
            name,
            error,
            applies,
        });
    }

    pub fn call_count(&self, verb: Verb, kind: ResourceKind) -> usize {
        self.lock().calls.get(&(verb, kind)).copied().unwrap_or(0)
    }

    /// Number of mutating calls (successful or not) since the last reset.
    pub fn mutation_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|((verb, _), _)| verb.is_mutation())
            .map(|(_, count)| *count)
            .sum()
    }

    pub fn reset_call_counts(&self) {
        self.lock().calls.clear();
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.lock()
            .objects
            .keys()
            .filter(|key| key.kind == kind)
            .count()
    }

    /// Moves the store clock forward; timestamps stamped afterwards start
    /// from the new time.
    pub fn advance_clock(&self, duration: std::time::Duration) {
        let mut state = self.lock();
        if let Ok(step) = ChronoDuration::from_std(duration) {
            state.clock += step;
        }
    }

    /// Completes graceful deletion of one terminating object.
    pub fn finalize(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), ApiError> {
        let mut state = self.lock();
        let key = ObjectKey {
            kind,
            namespace: normalize_namespace(Some(namespace)),
            name: name.to_string(),
        };
        let object = state
            .objects
            .remove(&key)
            .ok_or_else(|| ApiError::not_found(kind.resource(), name))?;
        self.broadcast(WatchEventType::Deleted, kind, object);
        Ok(())
    }

    /// Completes graceful deletion of every terminating object of `kind`.
    pub fn finalize_terminating(&self, kind: ResourceKind) -> usize {
        let mut state = self.lock();
        let keys: Vec<ObjectKey> = state
            .objects
            .iter()
            .filter(|(key, object)| {
                key.kind == kind
                    && object
                        .pointer("/metadata/deletionTimestamp")
                        .map(|value| !value.is_null())
                        .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys.iter() {
            if let Some(object) = state.objects.remove(key) {
                self.broadcast(WatchEventType::Deleted, kind, object);
            }
        }
        keys.len()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn broadcast(&self, event_type: WatchEventType, kind: ResourceKind, object: Value) {
        let _ = self.events.send(WatchEvent {
            event_type,
            kind,
            object,
        });
    }

    /// Records the call. A matching fault either fails it immediately or,
    /// for lost responses, is handed back to fail it after it took effect.
    fn begin(
        state: &mut StoreState,
        verb: Verb,
        kind: ResourceKind,
        name: Option<&str>,
    ) -> Result<Option<Fault>, ApiError> {
        *state.calls.entry((verb, kind)).or_insert(0) += 1;
        let position = state.faults.iter().position(|fault| {
            fault.kind == kind
                && fault.verb == verb
                && fault
                    .name
                    .as_deref()
                    .map(|expected| Some(expected) == name)
                    .unwrap_or(true)
        });
        match position.and_then(|position| state.faults.remove(position)) {
            Some(fault) if !fault.applies => Err(fault.error),
            other => Ok(other),
        }
    }

    fn finish(fault: Option<Fault>, result: Result<Value, ApiError>) -> Result<Value, ApiError> {
        match fault {
            Some(fault) => Err(fault.error),
            None => result,
        }
    }
}

impl StoreState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    /// Strictly increasing timestamps keep creation order observable.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = if now > self.clock {
            now
        } else {
            self.clock + ChronoDuration::milliseconds(1)
        };
        self.clock = next;
        next
    }
}

fn object_name(kind: ResourceKind, object: &Value) -> Result<String, ApiError> {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ApiError::new(
                ErrorKind::Invalid,
                format!("{}: metadata.name is required", kind.resource()),
            )
        })
}

fn labels_of(object: &Value) -> HashMap<String, String> {
    object
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn metadata_mut(object: &mut Value) -> &mut Map<String, Value> {
    if !object.is_object() {
        *object = Value::Object(Map::new());
    }
    let root = match object {
        Value::Object(map) => map,
        _ => unreachable!("object normalized above"),
    };
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    match metadata {
        Value::Object(map) => map,
        _ => unreachable!("metadata normalized above"),
    }
}

fn timestamp(value: DateTime<Utc>) -> Value {
    Value::String(value.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn random_uid() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>(),
        rng.gen::<u16>(),
        rng.gen::<u64>() & 0xffff_ffff_ffff
    )
}

/// Applies an RFC 7386 JSON merge patch in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

/// Copies server-owned metadata from `stored` and bumps generation when the
/// spec changed.
fn carry_server_fields(kind: ResourceKind, stored: &Value, next: &mut Value, resource_version: String) {
    let spec_changed = stored.get("spec") != next.get("spec");
    let metadata = metadata_mut(next);
    for field in ["uid", "creationTimestamp", "deletionTimestamp", "namespace"] {
        match stored.pointer(&format!("/metadata/{field}")) {
            Some(value) => {
                metadata.insert(field.to_string(), value.clone());
            }
            None => {
                metadata.remove(field);
            }
        }
    }
    if kind.has_status_subresource() {
        let generation = stored
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let generation = if spec_changed { generation + 1 } else { generation };
        metadata.insert("generation".to_string(), Value::from(generation));
    }
    metadata.insert("resourceVersion".to_string(), Value::String(resource_version));
}

fn check_resource_version(
    kind: ResourceKind,
    name: &str,
    stored: &Value,
    incoming: &Value,
) -> Result<(), ApiError> {
    let Some(expected) = incoming
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
    else {
        return Ok(());
    };
    let current = stored
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if expected != current {
        return Err(ApiError::conflict(
            kind.resource(),
            name,
            "the object has been modified; please apply your changes to the latest version and try again",
        ));
    }
    Ok(())
}

impl ObjectStore for MemoryStore {
    fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Value, ApiError> {
        let mut state = self.lock();
        let fault = Self::begin(&mut state, Verb::Get, kind, Some(name))?;
        let key = ObjectKey {
            kind,
            namespace: normalize_namespace(Some(namespace)),
            name: name.to_string(),
        };
        let result = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::not_found(kind.resource(), name));
        Self::finish(fault, result)
    }

    fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<Value>, ApiError> {
        let mut state = self.lock();
        if let Some(fault) = Self::begin(&mut state, Verb::List, kind, None)? {
            return Err(fault.error);
        }
        let namespace = normalize_namespace(Some(namespace));
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind && key.namespace == namespace)
            .filter(|(_, object)| {
                selector
                    .map(|selector| selector.matches(&labels_of(object)))
                    .unwrap_or(true)
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        mut object: Value,
    ) -> Result<Value, ApiError> {
        let name = object_name(kind, &object)?;
        let mut state = self.lock();
        let fault = Self::begin(&mut state, Verb::Create, kind, Some(&name))?;
        let namespace = normalize_namespace(Some(namespace));
        let key = ObjectKey {
            kind,
            namespace: namespace.clone(),
            name: name.clone(),
        };
        if state.objects.contains_key(&key) {
            return Err(ApiError::already_exists(kind.resource(), &name));
        }

        let created_at = state.tick();
        let resource_version = state.next_resource_version();
        {
            let metadata = metadata_mut(&mut object);
            metadata.insert("namespace".to_string(), Value::String(namespace));
            metadata.insert("uid".to_string(), Value::String(random_uid()));
            metadata.insert("creationTimestamp".to_string(), timestamp(created_at));
            metadata.insert("resourceVersion".to_string(), Value::String(resource_version));
            metadata.remove("deletionTimestamp");
            if kind.has_status_subresource() {
                metadata.insert("generation".to_string(), Value::from(1));
            }
        }
        state.objects.insert(key, object.clone());
        self.broadcast(WatchEventType::Added, kind, object.clone());
        Self::finish(fault, Ok(object))
    }

    fn update(
        &self,
        kind: ResourceKind,
        namespace: &str,
        mut object: Value,
    ) -> Result<Value, ApiError> {
        let name = object_name(kind, &object)?;
        let mut state = self.lock();
        let fault = Self::begin(&mut state, Verb::Update, kind, Some(&name))?;
        let key = ObjectKey {
            kind,
            namespace: normalize_namespace(Some(namespace)),
            name: name.clone(),
        };
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::not_found(kind.resource(), &name))?;
        check_resource_version(kind, &name, &stored, &object)?;

        if kind.has_status_subresource() {
            if let Value::Object(map) = &mut object {
                match stored.get("status") {
                    Some(status) => map.insert("status".to_string(), status.clone()),
                    None => map.remove("status"),
                };
            }
        }
        let resource_version = state.next_resource_version();
        carry_server_fields(kind, &stored, &mut object, resource_version);
        state.objects.insert(key, object.clone());
        self.broadcast(WatchEventType::Modified, kind, object.clone());
        Self::finish(fault, Ok(object))
    }

    fn update_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        object: Value,
    ) -> Result<Value, ApiError> {
        let name = object_name(kind, &object)?;
        let mut state = self.lock();
        let fault = Self::begin(&mut state, Verb::UpdateStatus, kind, Some(&name))?;
        let key = ObjectKey {
            kind,
            namespace: normalize_namespace(Some(namespace)),
            name: name.clone(),
        };
        let mut stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::not_found(kind.resource(), &name))?;
        check_resource_version(kind, &name, &stored, &object)?;

        if let Value::Object(map) = &mut stored {
            match object.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }
        let resource_version = state.next_resource_version();
        metadata_mut(&mut stored).insert(
            "resourceVersion".to_string(),
            Value::String(resource_version),
        );
        state.objects.insert(key, stored.clone());
        self.broadcast(WatchEventType::Modified, kind, stored.clone());
        Self::finish(fault, Ok(stored))
    }

    fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Value, ApiError> {
        let mut state = self.lock();
        let fault = Self::begin(&mut state, Verb::Patch, kind, Some(name))?;
        let key = ObjectKey {
            kind,
            namespace: normalize_namespace(Some(namespace)),
            name: name.to_string(),
        };
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::not_found(kind.resource(), name))?;
        check_resource_version(kind, name, &stored, patch)?;

        let mut next = stored.clone();
        merge_patch(&mut next, patch);
        metadata_mut(&mut next).insert("name".to_string(), Value::String(name.to_string()));
        let resource_version = state.next_resource_version();
        carry_server_fields(kind, &stored, &mut next, resource_version);
        state.objects.insert(key, next.clone());
        self.broadcast(WatchEventType::Modified, kind, next.clone());
        Self::finish(fault, Ok(next))
    }

    fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), ApiError> {
        let mut state = self.lock();
        let fault = Self::begin(&mut state, Verb::Delete, kind, Some(name))?;
        let key = ObjectKey {
            kind,
            namespace: normalize_namespace(Some(namespace)),
            name: name.to_string(),
        };
        let Some(mut stored) = state.objects.get(&key).cloned() else {
            return Err(ApiError::not_found(kind.resource(), name));
        };

        if kind == ResourceKind::Pod && self.graceful_pod_deletion {
            let terminating = stored
                .pointer("/metadata/deletionTimestamp")
                .map(|value| !value.is_null())
                .unwrap_or(false);
            if !terminating {
                let deleted_at = state.tick();
                let resource_version = state.next_resource_version();
                let metadata = metadata_mut(&mut stored);
                metadata.insert("deletionTimestamp".to_string(), timestamp(deleted_at));
                metadata.insert("resourceVersion".to_string(), Value::String(resource_version));
                state.objects.insert(key, stored.clone());
                self.broadcast(WatchEventType::Modified, kind, stored);
            }
        } else if let Some(object) = state.objects.remove(&key) {
            self.broadcast(WatchEventType::Deleted, kind, object);
        }
        Self::finish(fault, Ok(Value::Null)).map(|_| ())
    }
}
