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

use serde::{Deserialize, Serialize};
use std::fmt;

/// Absolute count or percentage (`"25%"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum IntOrString {
    Int(i32),
    String(String),
}

/// Rounding applied when a percentage is scaled against a total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Up,
    Down,
}

impl IntOrString {
    pub fn percent(value: u32) -> Self {
        IntOrString::String(format!("{value}%"))
    }

    /// Percentage value when this is a `"N%"` string.
    pub fn as_percent(&self, field: &str) -> Result<Option<u32>, String> {
        match self {
            IntOrString::Int(_) => Ok(None),
            IntOrString::String(value) => match value.trim().strip_suffix('%') {
                Some(percent) => percent
                    .trim()
                    .parse::<u32>()
                    .map(Some)
                    .map_err(|err| format!("{field} percentage '{value}' is invalid: {err}")),
                None => Ok(None),
            },
        }
    }

    /// Resolves against `total`. Percentages above 100 are accepted (surge).
    pub fn scaled_value(&self, total: u32, rounding: Rounding, field: &str) -> Result<u32, String> {
        match self {
            IntOrString::Int(value) => {
                if *value < 0 {
                    return Err(format!("{field} must be non-negative, received {value}"));
                }
                Ok(*value as u32)
            }
            IntOrString::String(value) => {
                if let Some(percent) = self.as_percent(field)? {
                    let scaled = u64::from(total) * u64::from(percent);
                    let computed = match rounding {
                        Rounding::Up => scaled.div_ceil(100),
                        Rounding::Down => scaled / 100,
                    };
                    Ok(computed.min(u64::from(u32::MAX)) as u32)
                } else {
                    let parsed = value
                        .trim()
                        .parse::<i32>()
                        .map_err(|err| format!("{field} value '{value}' is invalid: {err}"))?;
                    if parsed < 0 {
                        return Err(format!("{field} must be non-negative, received {value}"));
                    }
                    Ok(parsed as u32)
                }
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            IntOrString::Int(value) => *value == 0,
            IntOrString::String(value) => {
                let trimmed = value.trim().trim_end_matches('%').trim();
                trimmed.parse::<i64>().map(|parsed| parsed == 0).unwrap_or(false)
            }
        }
    }
}

impl fmt::Display for IntOrString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntOrString::Int(value) => write!(f, "{value}"),
            IntOrString::String(value) => f.write_str(value),
        }
    }
}
