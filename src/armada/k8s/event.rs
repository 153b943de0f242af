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

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pod::ObjectMeta;
use super::store::normalize_namespace;
use crate::armada::logger::log_debug;

const DEFAULT_EVENT_RETENTION: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectReference {
    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Minimal representation of Kubernetes core/v1 Event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub metadata: ObjectMeta,
    #[serde(rename = "involvedObject")]
    pub involved_object: ObjectReference,
    pub reason: String,
    pub message: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(rename = "eventTime")]
    pub event_time: DateTime<Utc>,
    #[serde(rename = "reportingComponent")]
    pub reporting_component: String,
}

/// Sink for controller-emitted events.
pub trait EventRecorder: Send + Sync {
    fn record(
        &self,
        involved: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    );
}

struct EventStore {
    records: VecDeque<Event>,
    capacity: usize,
}

impl EventStore {
    fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, event: Event) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(event);
    }
}

/// Bounded in-memory recorder; the oldest events are dropped first.
pub struct MemoryEventRecorder {
    component: &'static str,
    store: Mutex<EventStore>,
    counter: AtomicU64,
}

impl MemoryEventRecorder {
    pub fn new(component: &'static str) -> Self {
        Self::with_capacity(component, DEFAULT_EVENT_RETENTION)
    }

    pub fn with_capacity(component: &'static str, capacity: usize) -> Self {
        Self {
            component,
            store: Mutex::new(EventStore::new(capacity.max(1))),
            counter: AtomicU64::new(1),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        let store = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        store.records.iter().cloned().collect()
    }

    /// Reasons of the retained events, oldest first.
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.reason).collect()
    }
}

impl EventRecorder for MemoryEventRecorder {
    fn record(
        &self,
        involved: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst);
        let namespace = normalize_namespace(involved.namespace.as_deref());
        let event = Event {
            metadata: ObjectMeta {
                name: Some(format!(
                    "{}.{}",
                    involved.name.as_deref().unwrap_or("unknown"),
                    sequence
                )),
                namespace: Some(namespace.clone()),
                resource_version: Some(sequence.to_string()),
                ..Default::default()
            },
            involved_object: involved.clone(),
            reason: reason.to_string(),
            message: message.to_string(),
            event_type,
            event_time: Utc::now(),
            reporting_component: self.component.to_string(),
        };

        let event_type = event_type.to_string();
        let object = involved.name.as_deref().unwrap_or_default();
        log_debug(
            self.component,
            "Recorded event",
            &[
                ("namespace", namespace.as_str()),
                ("object", object),
                ("type", event_type.as_str()),
                ("reason", reason),
            ],
        );

        let mut store = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        store.push(event);
    }
}
