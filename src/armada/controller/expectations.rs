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

//! Ledger of unit mutations a workload issued but has not yet observed.
//!
//! A pass that finds its workload's expectations unsatisfied only refreshes
//! status, so a watch event that races the executor never causes the same
//! action to be issued twice. Entries are keyed by workload identity and
//! guarded by their own mutex. Recording takes the map lock and then the
//! entry lock; an entry with nothing pending is dropped from the map.

use crate::armada::logger::log_warn;
use crate::armada::observability::metrics;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Default)]
struct ExpectationEntry {
    creations: HashSet<String>,
    deletions: HashSet<String>,
    /// Unit name to the revision it is being moved to.
    updates: HashMap<String, String>,
    last_set: Option<Instant>,
}

impl ExpectationEntry {
    fn pending(&self) -> usize {
        self.creations.len() + self.deletions.len() + self.updates.len()
    }
}

/// Unit state as seen by an inventory listing.
#[derive(Debug, Clone, Copy)]
pub struct ObservedUnit<'a> {
    pub name: &'a str,
    pub terminating: bool,
    pub revision: Option<&'a str>,
}

pub struct Expectations {
    controller: &'static str,
    timeout: Duration,
    entries: Mutex<HashMap<String, Arc<Mutex<ExpectationEntry>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Expectations {
    /// `timeout` bounds how long an unobserved expectation blocks its
    /// workload before it is dropped.
    pub fn new(controller: &'static str, timeout: Duration) -> Self {
        Self {
            controller,
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` on the entry for `key`, creating it if needed. The map lock
    /// is held throughout so a concurrent prune cannot orphan the entry.
    fn record(&self, key: &str, f: impl FnOnce(&mut ExpectationEntry)) {
        let mut entries = lock(&self.entries);
        let entry = entries.entry(key.to_string()).or_default();
        let mut entry = lock(&**entry);
        let before = entry.pending();
        f(&mut entry);
        entry.last_set = Some(Instant::now());
        self.record_delta(before, entry.pending());
    }

    fn prune(&self, key: &str) {
        let mut entries = lock(&self.entries);
        let idle = entries
            .get(key)
            .map(|entry| lock(entry).pending() == 0)
            .unwrap_or(false);
        if idle {
            entries.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        lock(&self.entries).len()
    }

    fn existing(&self, key: &str) -> Option<Arc<Mutex<ExpectationEntry>>> {
        lock(&self.entries).get(key).cloned()
    }

    fn record_delta(&self, before: usize, after: usize) {
        metrics::adjust_expectations_pending(self.controller, after as i64 - before as i64);
    }

    pub fn expect_creations(&self, key: &str, names: &[String]) {
        self.record(key, |entry| entry.creations.extend(names.iter().cloned()));
    }

    pub fn expect_deletions(&self, key: &str, names: &[String]) {
        self.record(key, |entry| entry.deletions.extend(names.iter().cloned()));
    }

    pub fn expect_update(&self, key: &str, name: &str, revision: &str) {
        self.record(key, |entry| {
            entry.updates.insert(name.to_string(), revision.to_string());
        });
    }

    /// Also used to roll back a creation that definitely failed.
    pub fn creation_observed(&self, key: &str, name: &str) {
        self.observe(key, |entry| {
            entry.creations.remove(name);
        });
    }

    pub fn deletion_observed(&self, key: &str, name: &str) {
        self.observe(key, |entry| {
            entry.deletions.remove(name);
        });
    }

    pub fn update_observed(&self, key: &str, name: &str) {
        self.observe(key, |entry| {
            entry.updates.remove(name);
        });
    }

    fn observe(&self, key: &str, f: impl FnOnce(&mut ExpectationEntry)) {
        let Some(entry) = self.existing(key) else {
            return;
        };
        let settled = {
            let mut entry = lock(&entry);
            let before = entry.pending();
            f(&mut entry);
            self.record_delta(before, entry.pending());
            entry.pending() == 0
        };
        if settled {
            self.prune(key);
        }
    }

    /// Settles expectations against a fresh listing: creations are met by
    /// presence, deletions by absence or termination, updates by the unit
    /// carrying the expected revision or being gone.
    pub fn observe_inventory<'a>(
        &self,
        key: &str,
        units: impl IntoIterator<Item = ObservedUnit<'a>>,
    ) {
        let Some(entry) = self.existing(key) else {
            return;
        };
        let observed: HashMap<&str, ObservedUnit<'a>> =
            units.into_iter().map(|unit| (unit.name, unit)).collect();
        let settled = {
            let mut entry = lock(&entry);
            let before = entry.pending();
            entry
                .creations
                .retain(|name| !observed.contains_key(name.as_str()));
            entry.deletions.retain(|name| {
                observed
                    .get(name.as_str())
                    .map(|unit| !unit.terminating)
                    .unwrap_or(false)
            });
            entry.updates.retain(|name, revision| {
                observed
                    .get(name.as_str())
                    .map(|unit| unit.revision != Some(revision.as_str()))
                    .unwrap_or(false)
            });
            self.record_delta(before, entry.pending());
            entry.pending() == 0
        };
        if settled {
            self.prune(key);
        }
    }

    /// Settles expectations for one unit seen on the watch feed. Other
    /// units are untouched.
    pub fn observe_unit(&self, key: &str, unit: ObservedUnit<'_>) {
        self.observe(key, |entry| {
            entry.creations.remove(unit.name);
            if unit.terminating {
                entry.deletions.remove(unit.name);
            }
            if entry.updates.get(unit.name).map(String::as_str) == unit.revision
                || unit.terminating
            {
                entry.updates.remove(unit.name);
            }
        });
    }

    /// A unit removed from the store settles every expectation on it.
    pub fn unit_gone(&self, key: &str, name: &str) {
        self.observe(key, |entry| {
            entry.creations.remove(name);
            entry.deletions.remove(name);
            entry.updates.remove(name);
        });
    }

    /// True when nothing is outstanding. An entry older than the timeout is
    /// dropped with a warning and counts as satisfied.
    pub fn satisfied(&self, key: &str) -> bool {
        let Some(entry) = self.existing(key) else {
            return true;
        };
        {
            let mut entry = lock(&entry);
            let pending = entry.pending();
            if pending > 0 {
                let expired = entry
                    .last_set
                    .map(|set| set.elapsed() >= self.timeout)
                    .unwrap_or(true);
                if !expired {
                    return false;
                }
                let outstanding = pending.to_string();
                log_warn(
                    self.controller,
                    "Expectations timed out; resuming reconciliation",
                    &[("workload", key), ("outstanding", outstanding.as_str())],
                );
                *entry = ExpectationEntry::default();
                self.record_delta(pending, 0);
            }
        }
        self.prune(key);
        true
    }

    pub fn pending(&self, key: &str) -> usize {
        self.existing(key)
            .map(|entry| lock(&entry).pending())
            .unwrap_or(0)
    }

    /// Drops all state for a deleted workload.
    pub fn forget(&self, key: &str) {
        let removed = lock(&self.entries).remove(key);
        if let Some(entry) = removed {
            let pending = lock(&entry).pending();
            self.record_delta(pending, 0);
        }
    }
}
