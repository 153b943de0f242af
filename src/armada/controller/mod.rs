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

pub mod allocator;
pub mod cloneset;
pub mod error;
pub mod executor;
pub mod expectations;
pub mod inplace;
pub mod inventory;
pub mod reconcile;
pub mod revision;
pub mod runtime;
pub mod scale;
pub mod status;
pub mod subset;
pub mod uniteddeployment;
pub mod update;
pub mod watch;

pub use cloneset::CloneSetController;
pub use error::ControllerError;
pub use runtime::{ControllerRuntime, ControllerTarget, WorkQueue};
pub use uniteddeployment::UnitedDeploymentController;
pub use watch::WatchDispatcher;
