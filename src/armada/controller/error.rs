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

use crate::armada::util::error::{ApiError, ErrorKind};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Failure of a reconcile pass or of one of its actions.
#[derive(Debug)]
pub enum ControllerError {
    Api(ApiError),
    Serialization(serde_json::Error),
    /// Spec cannot be satisfied as written.
    Invalid(String),
    /// Planning invariant violated.
    Internal(String),
    Dependency(String),
    /// Per-unit failures collected from one pass.
    Aggregate(Vec<ControllerError>),
}

impl ControllerError {
    /// Structured kind used by the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::Api(err) => err.kind,
            ControllerError::Serialization(_) => ErrorKind::Internal,
            ControllerError::Invalid(_) => ErrorKind::Invalid,
            ControllerError::Internal(_) | ControllerError::Dependency(_) => ErrorKind::Internal,
            ControllerError::Aggregate(errors) => errors
                .first()
                .map(ControllerError::kind)
                .unwrap_or(ErrorKind::Internal),
        }
    }

    /// Terminal errors need an external spec correction and are not retried
    /// with backoff.
    pub fn is_terminal(&self) -> bool {
        match self {
            ControllerError::Api(err) => err.is_terminal(),
            ControllerError::Invalid(_) => true,
            ControllerError::Aggregate(errors) => {
                !errors.is_empty() && errors.iter().all(ControllerError::is_terminal)
            }
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            ControllerError::Api(err) => err.is_conflict(),
            ControllerError::Aggregate(errors) => errors.iter().any(ControllerError::is_conflict),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ControllerError::Api(err) if err.is_not_found())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ControllerError::Api(err) if err.is_timeout())
    }

    /// Collapses a list of errors: none is `Ok`, one is returned as is.
    pub fn aggregate(mut errors: Vec<ControllerError>) -> Result<(), ControllerError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ControllerError::Aggregate(errors)),
        }
    }
}

impl Display for ControllerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::Api(err) => write!(f, "object store error: {}", err),
            ControllerError::Serialization(err) => {
                write!(f, "serialization error: {}", err)
            }
            ControllerError::Invalid(message) => write!(f, "invalid spec: {}", message),
            ControllerError::Internal(message) => write!(f, "internal error: {}", message),
            ControllerError::Dependency(message) => {
                write!(f, "dependency error: {}", message)
            }
            ControllerError::Aggregate(errors) => {
                write!(f, "{} errors occurred: [", errors.len())?;
                for (index, err) in errors.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl Error for ControllerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ControllerError::Api(err) => Some(err),
            ControllerError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ApiError> for ControllerError {
    fn from(err: ApiError) -> Self {
        ControllerError::Api(err)
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(err: serde_json::Error) -> Self {
        ControllerError::Serialization(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_is_terminal_only_when_every_part_is() {
        let invalid = ControllerError::Invalid("bad partition".to_string());
        let forbidden = ControllerError::Api(ApiError::new(ErrorKind::Forbidden, "quota"));
        assert!(ControllerError::Aggregate(vec![invalid, forbidden]).is_terminal());

        let mixed = ControllerError::Aggregate(vec![
            ControllerError::Invalid("bad".to_string()),
            ControllerError::Api(ApiError::conflict("pods", "web-a", "stale")),
        ]);
        assert!(!mixed.is_terminal());
        assert!(mixed.is_conflict());
        assert!(mixed.to_string().starts_with("2 errors occurred"));
    }

    #[test]
    fn aggregate_collapses_single_errors() {
        assert!(ControllerError::aggregate(Vec::new()).is_ok());
        let err = ControllerError::aggregate(vec![ControllerError::Internal("x".into())])
            .unwrap_err();
        assert!(matches!(err, ControllerError::Internal(_)));
    }
}
