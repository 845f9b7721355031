// This file is part of the terraform-provider-converge project
//
// Copyright (C) ANEO, 2024-2024. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License")
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug)]
struct Entry {
    lock: Arc<AsyncMutex<()>>,
    refs: usize,
}

/// Mutual exclusion by resource name.
///
/// Entries are reference counted: an entry lives as long as someone holds or waits for it.
#[derive(Debug, Default)]
pub struct NamedLocks {
    entries: Mutex<HashMap<String, Entry>>,
}

/// Releases every held name when dropped
#[derive(Debug)]
pub struct NamedGuard<'l> {
    registry: &'l NamedLocks,
    held: Vec<(String, Option<OwnedMutexGuard<()>>)>,
}

impl NamedLocks {
    #[cfg(test)]
    pub fn new() -> Self {
        Default::default()
    }

    #[cfg(test)]
    pub async fn lock(&self, resource_type: &str, name: &str) -> NamedGuard<'_> {
        self.lock_many(resource_type, [name]).await
    }

    /// Lock several names at once.
    ///
    /// Names are acquired in sorted order so that overlapping calls cannot deadlock.
    pub async fn lock_many<I, S>(&self, resource_type: &str, names: I) -> NamedGuard<'_>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = names
            .into_iter()
            .map(|name| format!("{resource_type}.{}", name.as_ref()))
            .collect::<BTreeSet<_>>();

        let mut guard = NamedGuard {
            registry: self,
            held: Vec::with_capacity(keys.len()),
        };

        for key in keys {
            let lock = self.reserve(&key);
            guard.held.push((key, None));
            let acquired = lock.lock_owned().await;
            if let Some((key, slot)) = guard.held.last_mut() {
                debug!(key = key.as_str(), "lock acquired");
                *slot = Some(acquired);
            }
        }

        guard
    }

    /// Number of names currently held or waited for
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn reserve(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_owned()).or_insert_with(|| Entry {
            lock: Default::default(),
            refs: 0,
        });
        entry.refs += 1;
        entry.lock.clone()
    }

    fn release(&self, key: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(key);
            }
        }
    }
}

impl<'l> NamedGuard<'l> {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.held.iter().map(|(key, _)| key.as_str())
    }
}

impl<'l> Drop for NamedGuard<'l> {
    fn drop(&mut self) {
        // Unlock in reverse acquisition order
        while let Some((key, guard)) = self.held.pop() {
            drop(guard);
            self.registry.release(&key);
            debug!(key = key.as_str(), "lock released");
        }
    }
}
