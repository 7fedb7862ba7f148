//! Configuration surface for speql.
//!
//! Unlike the teacher extension — which runs inside the PostgreSQL process
//! and exposes `SET`-able GUC variables — speql is a standalone process, so
//! configuration is a plain `serde`-deserializable struct loaded once at
//! startup (from TOML, by `speql-server`) and shared read-only via `Arc`.
//! Every field below corresponds 1:1 to a line in `spec.md` §6
//! "Configuration surface".

use serde::{Deserialize, Serialize};

/// Feature flags, each documented with the behaviour it toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Run the background worker that consumes idle `db` capacity to
    /// pre-materialize predicted fragments (§4.10).
    pub background_thread: bool,
    /// Use the embedding-based similarity store for few-shot retrieval.
    /// When false, `SimilarityStore` lookups are skipped entirely.
    pub vector_db: bool,
    /// Allow the Sampling Strategy (C6) to rewrite scans to random-sample
    /// scans on warehouse timeout-cancel.
    pub sample: bool,
    /// Pass a "prediction" hint to the complex-rewrite LLM task to reduce
    /// latency when the output is close to the input.
    pub predict_inference: bool,
    /// Run Debug-Complex even when Debug-Simple already produced a valid
    /// rule set, to opportunistically improve the modification.
    pub aggressive_debug: bool,
    /// Disable the warehouse's server-side result cache for queries issued
    /// by this session.
    pub result_cache: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            background_thread: true,
            vector_db: false,
            sample: true,
            predict_inference: true,
            aggressive_debug: false,
            result_cache: true,
        }
    }
}

/// Dialect read/write targets for the parser/transpiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialectConfig {
    /// Dialect the client's raw input is assumed to be written in.
    pub input: String,
    /// Dialect the warehouse's `explain`/`execute` endpoint expects.
    pub endpoint: String,
    /// Dialect used when formatting dataset-qualified identifiers.
    pub dataset: String,
}

impl Default for DialectConfig {
    fn default() -> Self {
        Self {
            input: "generic".to_string(),
            endpoint: "generic".to_string(),
            dataset: "generic".to_string(),
        }
    }
}

/// Top-level configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Max preview rows returned to the client.
    pub preview: usize,
    /// Max preview bytes returned to the client.
    pub preview_char: usize,
    /// Max number of entries the temp-table pool retains before eviction.
    pub temporary_table_count: usize,
    /// Max total bytes the temp-table pool retains before eviction.
    pub temporary_table_size: u64,
    /// MRU prefix length shown to the Rewriter.
    pub query_cache_count: usize,
    /// Max number of messages kept in a Debug-Simple transcript.
    pub debug_simple_message_count: usize,
    /// Max total bytes kept in a Debug-Simple transcript.
    pub debug_simple_message_size: usize,
    /// Base retry budget (full retries per request under productive use).
    pub max_iteration: u32,
    /// Minimum token span for LCS-derived replacement rules.
    pub min_rule_length: usize,
    /// Below this normalized-edit-distance similarity, clear the rule set.
    pub similarity_threshold: f64,
    /// Feature flags (§ above).
    pub enable: FeatureFlags,
    /// Dialect targets.
    pub dialect: DialectConfig,
    /// Sentinel comment marking the cursor position.
    pub cursor_identifier: String,
    /// Directory under which per-run log files are appended.
    pub log_dir: String,
    /// Main HTTP/SSE port. The control port is `port + 1`.
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preview: 50,
            preview_char: 4_000,
            temporary_table_count: 12,
            temporary_table_size: 512 * 1024 * 1024,
            query_cache_count: 8,
            debug_simple_message_count: 20,
            debug_simple_message_size: 16_000,
            max_iteration: 3,
            min_rule_length: 5,
            similarity_threshold: 0.35,
            enable: FeatureFlags::default(),
            dialect: DialectConfig::default(),
            cursor_identifier: "/*CURSOR_IDENTIFIER*/".to_string(),
            log_dir: "./speql-run".to_string(),
            port: 8701,
        }
    }
}

impl Config {
    /// Parse configuration from a TOML document, falling back to defaults
    /// for any field the document omits.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// The control-path port (the main port + 1), per §6.
    pub fn control_port(&self) -> u16 {
        self.port + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = Config::default();
        assert_eq!(cfg.control_port(), cfg.port + 1);
        assert!(cfg.preview > 0);
        assert!(cfg.similarity_threshold > 0.0 && cfg.similarity_threshold < 1.0);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg = Config::from_toml("preview = 10\n").unwrap();
        assert_eq!(cfg.preview, 10);
        assert_eq!(cfg.temporary_table_count, Config::default().temporary_table_count);
    }

    #[test]
    fn feature_flags_default_sample_and_background_on() {
        let cfg = Config::default();
        assert!(cfg.enable.sample);
        assert!(cfg.enable.background_thread);
        assert!(!cfg.enable.vector_db);
    }
}
