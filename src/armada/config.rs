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

use crate::armada::logger::LogFormat;
use crate::armada::util::error::with_context;
use humantime::parse_duration;
use std::env;
use std::error::Error;
use std::time::Duration;

/// Enum for supported controller tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    Workers,
    ExpectationTimeout,
    BackoffBase,
    BackoffMax,
    SlowStartInitialBatch,
    RevisionHistoryLimit,
    LogFormat,
}

impl Config {
    /// Returns the associated environment variable for the tunable.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Workers => "ARMADA_WORKERS",
            Config::ExpectationTimeout => "ARMADA_EXPECTATION_TIMEOUT",
            Config::BackoffBase => "ARMADA_BACKOFF_BASE",
            Config::BackoffMax => "ARMADA_BACKOFF_MAX",
            Config::SlowStartInitialBatch => "ARMADA_SLOW_START_INITIAL",
            Config::RevisionHistoryLimit => "ARMADA_REVISION_HISTORY_LIMIT",
            Config::LogFormat => "ARMADA_LOG_FORMAT",
        }
    }

    /// Returns the default used when the environment variable is unset.
    pub fn default_value(&self) -> &'static str {
        match self {
            Config::Workers => "4",
            Config::ExpectationTimeout => "5m",
            Config::BackoffBase => {
                #[cfg(test)]
                {
                    "1ms"
                }
                #[cfg(not(test))]
                {
                    "5ms"
                }
            }
            Config::BackoffMax => {
                #[cfg(test)]
                {
                    "50ms"
                }
                #[cfg(not(test))]
                {
                    "1000s"
                }
            }
            Config::SlowStartInitialBatch => "1",
            Config::RevisionHistoryLimit => "10",
            Config::LogFormat => "text",
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get_value(&self) -> String {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.default_value().to_string())
    }

    fn get_duration(&self) -> Result<Duration, Box<dyn Error + Send + Sync>> {
        let raw = self.get_value();
        parse_duration(&raw).map_err(|err| {
            with_context(err, format!("{} has invalid duration '{}'", self.env_var(), raw))
        })
    }

    fn get_usize(&self) -> Result<usize, Box<dyn Error + Send + Sync>> {
        let raw = self.get_value();
        raw.parse::<usize>()
            .map_err(|err| with_context(err, format!("{} has invalid count '{}'", self.env_var(), raw)))
    }
}

/// Resolved controller settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub workers: usize,
    pub expectation_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub slow_start_initial_batch: usize,
    pub revision_history_limit: usize,
    pub log_format: LogFormat,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            expectation_timeout: Duration::from_secs(300),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            slow_start_initial_batch: 1,
            revision_history_limit: 10,
            log_format: LogFormat::Text,
        }
    }
}

impl ControllerConfig {
    /// Reads every tunable from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, Box<dyn Error + Send + Sync>> {
        let workers = Config::Workers.get_usize()?.max(1);
        let slow_start_initial_batch = Config::SlowStartInitialBatch.get_usize()?.max(1);
        let backoff_base = Config::BackoffBase.get_duration()?;
        let backoff_max = Config::BackoffMax.get_duration()?;
        if backoff_max < backoff_base {
            return Err(format!(
                "{} ({:?}) must not be smaller than {} ({:?})",
                Config::BackoffMax.env_var(),
                backoff_max,
                Config::BackoffBase.env_var(),
                backoff_base
            )
            .into());
        }

        Ok(Self {
            workers,
            expectation_timeout: Config::ExpectationTimeout.get_duration()?,
            backoff_base,
            backoff_max,
            slow_start_initial_batch,
            revision_history_limit: Config::RevisionHistoryLimit.get_usize()?,
            log_format: LogFormat::parse(&Config::LogFormat.get_value()),
        })
    }
}
