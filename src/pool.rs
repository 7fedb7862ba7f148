//! Temporary-Table Pool (C4).
//!
//! Tracks the mapping from a canonicalized `CREATE TEMPORARY TABLE ... AS`
//! script to the warehouse table name materializing it, an MRU access
//! order, and a size/count-capped eviction policy. An entry in this pool is
//! a promise that the underlying warehouse-session temp table exists; the
//! Create Engine is responsible for keeping that promise true.
//!
//! This module does not talk to a warehouse — eviction and reset report
//! which table names the caller must `DROP TABLE IF EXISTS`; the caller
//! (the async Create Engine adapter in `speql-server`) does so and reports
//! back whether the drop succeeded.

use std::collections::HashMap;

/// Metrics collected by the Create Engine about a materialization.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CreateMetrics {
    pub elapsed_ms: f64,
    pub execution_ms: f64,
    pub compile_ms: f64,
    pub planning_ms: f64,
    pub create_size_bytes: u64,
}

struct Entry {
    name: String,
    is_sample: bool,
    size_bytes: u64,
}

/// Result of [`TempTablePool::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// Existing table name if `script` is known, otherwise the provisional
    /// name the next [`TempTablePool::update`] for this script must use.
    pub name: String,
    pub is_new: bool,
}

/// Outcome of an eviction pass: table names the caller must drop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    pub to_drop: Vec<String>,
}

/// LRU-ordered pool of canonical-script-to-temp-table mappings.
pub struct TempTablePool {
    system_name: String,
    count_cap: usize,
    size_cap: u64,
    entries: HashMap<String, Entry>,
    /// MRU-ordered script keys; front is most recently used.
    mru: Vec<String>,
    index: u64,
}

impl TempTablePool {
    pub fn new(system_name: impl Into<String>, count_cap: usize, size_cap: u64) -> Self {
        Self {
            system_name: system_name.into(),
            count_cap,
            size_cap,
            entries: HashMap::new(),
            mru: Vec::new(),
            index: 0,
        }
    }

    fn provisional_name(&self) -> String {
        format!(
            "\"{}_TEMP_TABLE_{}\"",
            self.system_name.to_uppercase(),
            self.index + 1
        )
    }

    /// Look up `script`. If known and `update_mru`, promote it to the front
    /// of the MRU list. If unknown, returns the name the *next* `update`
    /// call for this script must register (without reserving it).
    pub fn check(&mut self, script: &str, update_mru: bool) -> CheckResult {
        if let Some(entry) = self.entries.get(script) {
            if update_mru {
                if let Some(pos) = self.mru.iter().position(|s| s == script) {
                    let key = self.mru.remove(pos);
                    self.mru.insert(0, key);
                }
            }
            CheckResult {
                name: entry.name.clone(),
                is_new: false,
            }
        } else {
            CheckResult {
                name: self.provisional_name(),
                is_new: true,
            }
        }
    }

    /// Register a newly materialized script. The caller must not have
    /// already registered `script` (enforced as an invariant, not a soft
    /// check — a double `update` for the same script is a contract
    /// violation upstream in the Create Engine).
    pub fn update(&mut self, script: &str, is_sample: bool, metrics: CreateMetrics) {
        debug_assert!(
            !self.entries.contains_key(script),
            "script already registered in pool"
        );
        self.index += 1;
        let name = format!(
            "\"{}_TEMP_TABLE_{}\"",
            self.system_name.to_uppercase(),
            self.index
        );
        self.entries.insert(
            script.to_string(),
            Entry {
                name,
                is_sample,
                size_bytes: metrics.create_size_bytes,
            },
        );
        self.mru.insert(0, script.to_string());
    }

    /// Compute which entries must be dropped to bring the pool back under
    /// its count/size caps, starting from the least-recently-used end.
    /// Does not mutate the pool — call [`TempTablePool::confirm_evicted`]
    /// for each name the caller successfully dropped.
    pub fn plan_eviction(&self) -> EvictionPlan {
        let mut total_size: u64 = self.entries.values().map(|e| e.size_bytes).sum();
        let mut remaining = self.mru.len();
        let mut to_drop = Vec::new();

        for script in self.mru.iter().rev() {
            if remaining <= self.count_cap && total_size <= self.size_cap {
                break;
            }
            if let Some(entry) = self.entries.get(script) {
                to_drop.push(entry.name.clone());
                total_size = total_size.saturating_sub(entry.size_bytes);
                remaining -= 1;
            }
        }

        EvictionPlan { to_drop }
    }

    /// Remove `script`'s entry after the caller has confirmed the warehouse
    /// `DROP TABLE` succeeded. If the drop failed (e.g. a dependent temp
    /// table still references it), the caller should not call this and
    /// should instead retry eviction from an older entry next pass.
    pub fn confirm_dropped(&mut self, name: &str) {
        if let Some(script) = self
            .entries
            .iter()
            .find(|(_, e)| e.name == name)
            .map(|(s, _)| s.clone())
        {
            self.entries.remove(&script);
            self.mru.retain(|s| s != &script);
        }
    }

    /// MRU-ordered script list, truncated to `prefix_len`, for the
    /// Rewriter's cache-scan.
    pub fn query_cache_list(&self, prefix_len: usize) -> Vec<&str> {
        self.mru.iter().take(prefix_len).map(|s| s.as_str()).collect()
    }

    pub fn is_sample(&self, script: &str) -> Option<bool> {
        self.entries.get(script).map(|e| e.is_sample)
    }

    pub fn name_for(&self, script: &str) -> Option<&str> {
        self.entries.get(script).map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    /// All table names currently tracked, for a full `reset()`. Does not
    /// clear state — call [`TempTablePool::clear`] once every drop has been
    /// issued.
    pub fn all_names(&self) -> Vec<String> {
        self.mru
            .iter()
            .filter_map(|s| self.entries.get(s).map(|e| e.name.clone()))
            .collect()
    }

    /// Clear all tracked state. The caller is responsible for having
    /// already dropped every table returned by [`TempTablePool::all_names`].
    pub fn clear(&mut self) {
        self.entries.clear();
        self.mru.clear();
        self.index = 0;
    }
}
