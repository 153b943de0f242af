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

//! Object-store collaborator consumed by the controllers.
//!
//! The trait is object safe and speaks `serde_json::Value`; `ObjectStoreExt`
//! layers typed access on top for every `KubeObject`.

use super::cloneset::CloneSet;
use super::deployment::Deployment;
use super::persistentvolumeclaim::PersistentVolumeClaim;
use super::pod::{ObjectMeta, Pod};
use super::revision::ControllerRevision;
use super::statefulset::{LabelSelector, StatefulSet};
use super::uniteddeployment::UnitedDeployment;
use crate::armada::util::error::{ApiError, ErrorKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Pod,
    PersistentVolumeClaim,
    ControllerRevision,
    CloneSet,
    UnitedDeployment,
    StatefulSet,
    Deployment,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Pod,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::ControllerRevision,
        ResourceKind::CloneSet,
        ResourceKind::UnitedDeployment,
        ResourceKind::StatefulSet,
        ResourceKind::Deployment,
    ];

    /// Plural resource name used in error messages.
    pub const fn resource(self) -> &'static str {
        match self {
            ResourceKind::Pod => "pods",
            ResourceKind::PersistentVolumeClaim => "persistentvolumeclaims",
            ResourceKind::ControllerRevision => "controllerrevisions",
            ResourceKind::CloneSet => "clonesets",
            ResourceKind::UnitedDeployment => "uniteddeployments",
            ResourceKind::StatefulSet => "statefulsets",
            ResourceKind::Deployment => "deployments",
        }
    }

    pub const fn kind(self) -> &'static str {
        match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::ControllerRevision => "ControllerRevision",
            ResourceKind::CloneSet => "CloneSet",
            ResourceKind::UnitedDeployment => "UnitedDeployment",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Deployment => "Deployment",
        }
    }

    /// Whether `status` is only writable through `update_status`.
    pub const fn has_status_subresource(self) -> bool {
        matches!(
            self,
            ResourceKind::CloneSet
                | ResourceKind::UnitedDeployment
                | ResourceKind::StatefulSet
                | ResourceKind::Deployment
        )
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        ResourceKind::ALL
            .into_iter()
            .find(|candidate| candidate.kind() == kind)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Typed object stored under a `ResourceKind`.
pub trait KubeObject: Serialize + DeserializeOwned + Clone + Send + Sync {
    const KIND: ResourceKind;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

macro_rules! kube_object {
    ($ty:ty, $kind:expr) => {
        impl KubeObject for $ty {
            const KIND: ResourceKind = $kind;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

kube_object!(Pod, ResourceKind::Pod);
kube_object!(PersistentVolumeClaim, ResourceKind::PersistentVolumeClaim);
kube_object!(ControllerRevision, ResourceKind::ControllerRevision);
kube_object!(CloneSet, ResourceKind::CloneSet);
kube_object!(UnitedDeployment, ResourceKind::UnitedDeployment);
kube_object!(StatefulSet, ResourceKind::StatefulSet);
kube_object!(Deployment, ResourceKind::Deployment);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    #[serde(rename = "ADDED")]
    Added,
    #[serde(rename = "MODIFIED")]
    Modified,
    #[serde(rename = "DELETED")]
    Deleted,
}

/// Change notification delivered by the watch feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub kind: ResourceKind,
    pub object: Value,
}

impl WatchEvent {
    pub fn metadata(&self) -> Option<ObjectMeta> {
        self.object
            .get("metadata")
            .and_then(|metadata| serde_json::from_value(metadata.clone()).ok())
    }
}

/// CRUD surface of the cluster object store.
///
/// Implementations report failures as `ApiError` with one of the structured
/// kinds; callers never inspect message text.
pub trait ObjectStore: Send + Sync {
    fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Value, ApiError>;

    /// Lists objects in `namespace`; `selector` filters on labels when set.
    fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<Value>, ApiError>;

    fn create(&self, kind: ResourceKind, namespace: &str, object: Value)
        -> Result<Value, ApiError>;

    /// Replaces the object. A populated `resourceVersion` must match the
    /// stored one.
    fn update(&self, kind: ResourceKind, namespace: &str, object: Value)
        -> Result<Value, ApiError>;

    fn update_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        object: Value,
    ) -> Result<Value, ApiError>;

    /// Applies a JSON merge patch.
    fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Value, ApiError>;

    fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), ApiError>;
}

fn encode<T: Serialize>(kind: ResourceKind, object: &T) -> Result<Value, ApiError> {
    serde_json::to_value(object).map_err(|err| {
        ApiError::new(
            ErrorKind::Internal,
            format!("failed to encode {}: {err}", kind.resource()),
        )
    })
}

fn decode<T: DeserializeOwned>(kind: ResourceKind, value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|err| {
        ApiError::new(
            ErrorKind::Internal,
            format!("failed to decode {}: {err}", kind.resource()),
        )
    })
}

/// Typed helpers over any `ObjectStore`, including trait objects.
pub trait ObjectStoreExt: ObjectStore {
    fn get_as<T: KubeObject>(&self, namespace: &str, name: &str) -> Result<T, ApiError> {
        decode(T::KIND, self.get(T::KIND, namespace, name)?)
    }

    fn list_as<T: KubeObject>(
        &self,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<T>, ApiError> {
        self.list(T::KIND, namespace, selector)?
            .into_iter()
            .map(|value| decode(T::KIND, value))
            .collect()
    }

    fn create_as<T: KubeObject>(&self, namespace: &str, object: &T) -> Result<T, ApiError> {
        let created = self.create(T::KIND, namespace, encode(T::KIND, object)?)?;
        decode(T::KIND, created)
    }

    fn update_as<T: KubeObject>(&self, namespace: &str, object: &T) -> Result<T, ApiError> {
        let updated = self.update(T::KIND, namespace, encode(T::KIND, object)?)?;
        decode(T::KIND, updated)
    }

    fn update_status_as<T: KubeObject>(&self, namespace: &str, object: &T) -> Result<T, ApiError> {
        let updated = self.update_status(T::KIND, namespace, encode(T::KIND, object)?)?;
        decode(T::KIND, updated)
    }

    fn patch_as<T: KubeObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<T, ApiError> {
        decode(T::KIND, self.patch(T::KIND, namespace, name, patch)?)
    }
}

impl<S: ObjectStore + ?Sized> ObjectStoreExt for S {}
