//! Pipeline Orchestrator (C10) and the `Core` process-wide state (§9's
//! "encapsulate in a single process-scoped value" design note).
//!
//! Per request: Debug → Create → Preview, consulting/populating the
//! Pipeline Cache keyed by the canonicalized input, exactly as `spec.md`
//! §4.9 describes. The warehouse/LLM clients are injected as trait objects
//! so this module and its tests never depend on a live warehouse or model.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use speql::create_engine::{self, CreateOutcome, SchemaCache};
use speql::pool::TempTablePool;
use speql::{activity, activity::ActivityState, formatter, rewriter, sampling, sql, Config};

use crate::concurrency::{BackgroundSignal, JobSlot};
use crate::error::{Result, ServerError};
use crate::llm_client::{ChatMessage, LlmClient};
use crate::persistence::{NullPersistenceSink, PersistenceSink, Stream};
use crate::warehouse_client::WarehouseClient;

/// One frame of the SSE response stream.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum Frame {
    Modification { modification: String },
    ErrorInfo { error_info: String },
    Terminal {
        preview: String,
        modification: String,
        complete: bool,
        show: bool,
    },
}

#[derive(Debug, Clone)]
struct CachedResult {
    modification: String,
    preview: String,
}

/// Per-session Debug (C7) state: the accumulated Simple rule set and the
/// last SQL seen, so `run_debug` can detect a file-context switch (§4.7)
/// and clear the rules rather than replay stale find/replace patches.
#[derive(Debug, Clone, Default)]
struct DebugSessionState {
    rules: Vec<speql::debug::Rule>,
    last_sql: Option<String>,
}

/// Process-wide shared state: the temp-table pool, the pipeline cache, the
/// schema cache, the activity controller, and the two job slots. Mutated
/// only by `db`-slot holders (pool/schema cache) per §5's "Shared state"
/// invariant; the pipeline cache is append-only.
pub struct Core {
    pub config: Arc<Config>,
    pub llm: Arc<dyn LlmClient>,
    pub warehouse: Arc<dyn WarehouseClient>,

    pool: Mutex<TempTablePool>,
    schema_cache: Mutex<SchemaCache>,
    pipeline_cache: Mutex<HashMap<String, CachedResult>>,
    activity: Mutex<ActivityState>,
    last_speculated_sql: Mutex<Option<String>>,
    debug_state: Mutex<HashMap<String, DebugSessionState>>,

    pub llm_slot: Arc<JobSlot>,
    pub db_slot: Arc<JobSlot>,
    pub background_signal: Arc<BackgroundSignal>,
    pub persistence: Arc<dyn PersistenceSink>,
}

impl Core {
    pub fn new(config: Config, llm: Arc<dyn LlmClient>, warehouse: Arc<dyn WarehouseClient>) -> Arc<Self> {
        Self::with_persistence(config, llm, warehouse, Arc::new(NullPersistenceSink))
    }

    /// As [`Core::new`], but with an explicit [`PersistenceSink`] — used by
    /// `main` to append to `config.log_dir` instead of discarding events.
    pub fn with_persistence(
        config: Config,
        llm: Arc<dyn LlmClient>,
        warehouse: Arc<dyn WarehouseClient>,
        persistence: Arc<dyn PersistenceSink>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        Arc::new(Self {
            pool: Mutex::new(TempTablePool::new(
                "SPEQL",
                config.temporary_table_count,
                config.temporary_table_size,
            )),
            schema_cache: Mutex::new(SchemaCache::new()),
            pipeline_cache: Mutex::new(HashMap::new()),
            activity: Mutex::new(ActivityState::new(config.max_iteration)),
            last_speculated_sql: Mutex::new(None),
            debug_state: Mutex::new(HashMap::new()),
            llm_slot: Arc::new(JobSlot::new("llm")),
            db_slot: Arc::new(JobSlot::new("db")),
            background_signal: Arc::new(BackgroundSignal::new()),
            persistence,
            config,
            llm,
            warehouse,
        })
    }

    pub async fn set_last_speculated(&self, sql: String) {
        *self.last_speculated_sql.lock().await = Some(sql);
    }

    pub async fn last_speculated(&self) -> Option<String> {
        self.last_speculated_sql.lock().await.clone()
    }
}

/// Handle one request end-to-end, yielding frames as the pipeline makes
/// progress. `session_key` identifies this user's session for job-slot
/// claims. Priority and the CTE prefix/suffix used by `create`'s powerset
/// step are computed here from `formatter::prepare_sql`, rather than by the
/// HTTP edge, so the "cursor missing or buffer empty" signal (`None`) can be
/// turned into a single non-`show` terminal frame before any pipeline work
/// starts (§8 "empty input" boundary).
pub async fn handle_request(
    core: Arc<Core>,
    raw_content: String,
    session_key: String,
) -> Vec<Frame> {
    let cursor_id = &core.config.cursor_identifier;

    let Some(prepared) = formatter::prepare_sql(&raw_content, cursor_id) else {
        return vec![Frame::Terminal {
            preview: String::new(),
            modification: String::new(),
            complete: true,
            show: false,
        }];
    };
    let priority = prepared.priority.max(1) as u32;

    let canonical = formatter::format(&raw_content, cursor_id);

    core.persistence.append(
        Stream::Input,
        serde_json::json!({"session_key": session_key, "content": raw_content}),
    );

    if let Some(cached) = core.pipeline_cache.lock().await.get(&canonical).cloned() {
        return vec![Frame::Terminal {
            preview: cached.preview,
            modification: cached.modification,
            complete: true,
            show: true,
        }];
    }

    let mut frames = Vec::new();

    let llm_ticket = core.llm_slot.claim(priority, session_key.clone()).await;
    let debug_outcome = run_debug(&core, &canonical, &session_key, &llm_ticket).await;
    if !llm_ticket.is_current_holder().await {
        llm_ticket.release().await;
        return frames; // preempted: abandon silently, no state mutation.
    }
    llm_ticket.release().await;

    let modification = match debug_outcome {
        Ok(m) => {
            frames.push(Frame::Modification {
                modification: m.clone(),
            });
            m
        }
        Err(e) => {
            frames.push(Frame::ErrorInfo {
                error_info: e.to_string(),
            });
            return frames;
        }
    };

    let db_ticket = core.db_slot.claim(priority.max(1), session_key.clone()).await;
    let create_result = create_with_prefix_suffix(
        &core,
        &modification,
        priority,
        &session_key,
        &prepared.prefix,
        &prepared.suffix,
    )
    .await;
    if !db_ticket.is_current_holder().await {
        db_ticket.release().await;
        return frames;
    }

    match create_result {
        Ok(rewritten) => match preview(&core, &rewritten).await {
            Ok(preview_text) => {
                core.pipeline_cache.lock().await.insert(
                    canonical.clone(),
                    CachedResult {
                        modification: modification.clone(),
                        preview: preview_text.clone(),
                    },
                );
                core.activity.lock().await.reset(core.config.max_iteration);
                core.set_last_speculated(modification.clone()).await;
                core.persistence.append(
                    Stream::Preview,
                    serde_json::json!({"session_key": session_key, "preview": preview_text}),
                );
                frames.push(Frame::Terminal {
                    preview: preview_text,
                    modification,
                    complete: true,
                    show: true,
                });
            }
            Err(e) => {
                core.activity
                    .lock()
                    .await
                    .increase_active_period(core.config.max_iteration);
                core.persistence.append(
                    Stream::Error,
                    serde_json::json!({"session_key": session_key, "error": e.to_string()}),
                );
                frames.push(Frame::Terminal {
                    preview: String::new(),
                    modification,
                    complete: true,
                    show: e.is_silent_downgrade(),
                });
            }
        },
        Err(e) => {
            core.activity
                .lock()
                .await
                .increase_active_period(core.config.max_iteration);
            core.persistence.append(
                Stream::Error,
                serde_json::json!({"session_key": session_key, "error": e.to_string()}),
            );
            frames.push(Frame::Terminal {
                preview: String::new(),
                modification,
                complete: true,
                show: e.is_silent_downgrade(),
            });
        }
    }

    db_ticket.release().await;
    core.background_signal.signal();
    frames
}

trait SilentDowngrade {
    fn is_silent_downgrade(&self) -> bool;
}

impl SilentDowngrade for ServerError {
    fn is_silent_downgrade(&self) -> bool {
        match self {
            ServerError::Core(e) => !e.is_silent(),
            _ => true,
        }
    }
}

/// Debug (C7) driver (§4.8): per-session accumulated rules first (no LLM
/// call), then Simple, then Complex on Simple's failure. A context switch —
/// this SQL too dissimilar from the last one this session debugged — clears
/// the accumulated rule set rather than replaying stale find/replace
/// patches (§4.7's `check_new_sql` gate).
async fn run_debug(
    core: &Core,
    sql: &str,
    session_key: &str,
    ticket: &crate::concurrency::JobSlotTicket,
) -> Result<String> {
    let cursor_id = &core.config.cursor_identifier;

    let mut rules = {
        let mut state = core.debug_state.lock().await;
        let entry = state.entry(session_key.to_string()).or_default();
        if activity::check_new_sql(entry.last_sql.as_deref(), sql, core.config.similarity_threshold) {
            entry.rules.clear();
        }
        entry.last_sql = Some(sql.to_string());
        entry.rules.clone()
    };

    let retained = speql::debug::retained_rules(&rules, sql);
    let fast_path = speql::debug::apply_rules(sql, &retained);
    if !retained.is_empty() && core.warehouse.explain(&fast_path).await.is_ok() {
        save_session_rules(core, session_key, retained).await;
        return Ok(fast_path);
    }

    match run_debug_simple(core, sql, cursor_id, &mut rules, ticket).await {
        Ok(result) => {
            save_session_rules(core, session_key, rules).await;
            Ok(result)
        }
        Err(simple_err) => match run_debug_complex(core, sql, cursor_id, ticket).await {
            Ok((result, derived)) => {
                rules.extend(derived);
                save_session_rules(core, session_key, rules).await;
                Ok(result)
            }
            Err(_) => Err(simple_err),
        },
    }
}

async fn save_session_rules(core: &Core, session_key: &str, rules: Vec<speql::debug::Rule>) {
    core.debug_state
        .lock()
        .await
        .entry(session_key.to_string())
        .or_default()
        .rules = rules;
}

/// Debug-Simple (§4.8): each retry round asks the LLM for a fresh batch of
/// rules, validates them against `sql`, appends them to the session's
/// running set, and checks the combined rewrite with `EXPLAIN` — up to
/// `max_retry` rounds (§4.7's activity-controlled retry budget).
async fn run_debug_simple(
    core: &Core,
    sql: &str,
    cursor_id: &str,
    rules: &mut Vec<speql::debug::Rule>,
    ticket: &crate::concurrency::JobSlotTicket,
) -> Result<String> {
    let max_retry = core.activity.lock().await.max_retry().max(1);
    let mut first_err: Option<ServerError> = None;

    for _ in 0..max_retry {
        let message = ChatMessage {
            role: "user".into(),
            content: sql.to_string(),
        };

        let response = tokio::select! {
            r = core.llm.complete("simple", std::slice::from_ref(&message), Some(256), None) => r,
            _ = ticket.cancel_token.cancelled() => return Err(ServerError::Core(speql::SpeqlError::CancelledByPreemption)),
        };
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                first_err.get_or_insert(e);
                continue;
            }
        };

        let Some(json_block) = speql::debug::extract_json_fence(&response) else {
            first_err.get_or_insert(ServerError::Core(speql::SpeqlError::ValidationFailure(
                "no json fence in debug-simple response".into(),
            )));
            continue;
        };

        let proposed: Vec<RuleDto> = match serde_json::from_str(&json_block) {
            Ok(v) => v,
            Err(e) => {
                first_err.get_or_insert(ServerError::Core(speql::SpeqlError::ValidationFailure(e.to_string())));
                continue;
            }
        };
        let proposed: Vec<speql::debug::Rule> = proposed.into_iter().map(Into::into).collect();

        let validated = match speql::debug::validate_proposed_rules(&proposed, sql, cursor_id) {
            Ok(v) => v,
            Err(violation) => {
                first_err.get_or_insert(ServerError::Core(speql::SpeqlError::ValidationFailure(violation.message)));
                continue;
            }
        };

        let mut trial_rules = rules.clone();
        trial_rules.extend(validated);
        let rewritten = speql::debug::apply_rules(sql, &trial_rules);

        if core.warehouse.explain(&rewritten).await.is_ok() {
            *rules = speql::debug::retained_rules(&trial_rules, &rewritten);
            return Ok(rewritten);
        }
        first_err.get_or_insert(ServerError::Core(speql::SpeqlError::ValidationFailure(
            "explain rejected debug-simple rewrite".into(),
        )));
    }

    Err(first_err.unwrap_or(ServerError::Core(speql::SpeqlError::ValidationFailure(
        "debug-simple produced no rules".into(),
    ))))
}

/// Debug-Complex (§4.8): an "explain" call produces a short diagnosis, then
/// a "complex" call proposes a full rewrite fenced as ```sql```, which must
/// contain the cursor sentinel exactly once and pass `EXPLAIN`. On
/// acceptance, `get_replacement_rule` derives find/replace rules from the
/// diff so the next keystroke can skip straight to the Simple fast path.
async fn run_debug_complex(
    core: &Core,
    sql: &str,
    cursor_id: &str,
    ticket: &crate::concurrency::JobSlotTicket,
) -> Result<(String, Vec<speql::debug::Rule>)> {
    let max_retry = core.activity.lock().await.max_retry().max(1);
    let mut last_err = ServerError::Core(speql::SpeqlError::ValidationFailure(
        "debug-complex produced no runnable rewrite".into(),
    ));

    for _ in 0..max_retry {
        let explain_message = ChatMessage {
            role: "user".into(),
            content: sql.to_string(),
        };
        let diagnosis = tokio::select! {
            r = core.llm.complete("explain", std::slice::from_ref(&explain_message), Some(256), None) => r,
            _ = ticket.cancel_token.cancelled() => return Err(ServerError::Core(speql::SpeqlError::CancelledByPreemption)),
        };
        let diagnosis = match diagnosis {
            Ok(d) => d,
            Err(e) => {
                last_err = e;
                continue;
            }
        };

        let rewrite_message = ChatMessage {
            role: "user".into(),
            content: format!("{sql}\n{diagnosis}"),
        };
        let rewrite_response = tokio::select! {
            r = core.llm.complete("complex", std::slice::from_ref(&rewrite_message), None, None) => r,
            _ = ticket.cancel_token.cancelled() => return Err(ServerError::Core(speql::SpeqlError::CancelledByPreemption)),
        };
        let rewrite_response = match rewrite_response {
            Ok(r) => r,
            Err(e) => {
                last_err = e;
                continue;
            }
        };

        let Some(rewritten) = speql::debug::extract_sql_fence(&rewrite_response) else {
            last_err = ServerError::Core(speql::SpeqlError::ValidationFailure(
                "debug-complex rewrite missing a sql fence".into(),
            ));
            continue;
        };

        if !speql::debug::has_single_cursor_marker(&rewritten, cursor_id) {
            last_err = ServerError::Core(speql::SpeqlError::ValidationFailure(
                "debug-complex rewrite must contain the cursor sentinel exactly once".into(),
            ));
            continue;
        }

        if core.warehouse.explain(&rewritten).await.is_ok() {
            let derived = speql::debug::get_replacement_rule(sql, &rewritten, core.config.min_rule_length);
            return Ok((rewritten, derived));
        }
        last_err = ServerError::Core(speql::SpeqlError::ValidationFailure(
            "explain rejected debug-complex rewrite".into(),
        ));
    }

    Err(last_err)
}

#[derive(serde::Deserialize)]
struct RuleDto {
    old: String,
    new: String,
}

impl From<RuleDto> for speql::debug::Rule {
    fn from(d: RuleDto) -> Self {
        speql::debug::Rule {
            old: d.old,
            new: d.new,
        }
    }
}

/// `create(m)` (§4.9): canonicalize, rewrite against the pool's MRU list,
/// materialize on a cache miss, with the sampling-retry fallback on a
/// warehouse timeout-cancel. Thin wrapper over
/// [`create_with_prefix_suffix`] for callers (the background worker,
/// scenario tests) with no CTE-wrapper context to offer.
pub async fn create(
    core: &Core,
    modification: &str,
    priority: u32,
    session_key: &str,
) -> Result<String> {
    create_with_prefix_suffix(core, modification, priority, session_key, "", "").await
}

/// `create(m)` (§4.9) in full: walks `modification`'s `WITH`-clause scopes
/// one at a time (§4.9 step "each CTE is processed independently, in
/// declaration order"), substituting a materialized scope's temp-table name
/// into every later CTE and the main query before that scope is processed,
/// then materializes the main query — widening its projection via powerset
/// enrichment first when this is a non-urgent request (`priority <= 1`).
/// Any CTE that didn't fully materialize into a bare temp-table reference is
/// kept as a residual `WITH` entry wrapping the final result.
pub async fn create_with_prefix_suffix(
    core: &Core,
    modification: &str,
    priority: u32,
    session_key: &str,
    prefix: &str,
    suffix: &str,
) -> Result<String> {
    let cursor_id = &core.config.cursor_identifier;

    if priority > 1 {
        let _ = core.warehouse.cancel(session_key).await;
    }

    let (scopes, mut main_sql) = sql::split_ctes(modification).unwrap_or((Vec::new(), modification.to_string()));

    let mut substitutions: Vec<(String, String)> = Vec::new();
    let mut residual_ctes: Vec<(String, String)> = Vec::new();

    for scope in scopes {
        let mut body = scope.body;
        for (from_alias, temp_name) in &substitutions {
            body = sql::substitute_table_reference(&body, from_alias, temp_name);
        }

        match materialize_scope(core, &body, cursor_id).await {
            Ok(result) => match bare_temp_reference(&result) {
                Some(temp_name) => substitutions.push((scope.alias, temp_name.to_string())),
                None => residual_ctes.push((scope.alias, result)),
            },
            Err(_) => residual_ctes.push((scope.alias, body)),
        }
    }

    for (from_alias, temp_name) in &substitutions {
        main_sql = sql::substitute_table_reference(&main_sql, from_alias, temp_name);
    }

    let non_urgent = priority <= 1;
    let result = materialize_main_scope(core, &main_sql, cursor_id, non_urgent, prefix, suffix).await?;

    if residual_ctes.is_empty() {
        Ok(result)
    } else {
        let with_clause = residual_ctes
            .iter()
            .map(|(alias, body)| format!("{alias} AS ({body})"))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!("WITH {with_clause} {result}"))
    }
}

/// A materialization result of the exact shape `SELECT * FROM <name>` — the
/// output both a fresh `CREATE` and a bare exact-`FROM` rewrite produce —
/// qualifies a CTE scope to be substituted inline rather than kept as a
/// residual `WITH` entry.
fn bare_temp_reference(sql: &str) -> Option<&str> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    let rest = upper.strip_prefix("SELECT * FROM ")?;
    if rest.is_empty() || rest.contains(' ') {
        return None;
    }
    let start = trimmed.len() - rest.len();
    Some(&trimmed[start..])
}

/// Rewrite-or-materialize a single scope (a CTE body or, via
/// [`materialize_main_scope`], the main query) against the pool's MRU
/// candidate list, falling back to a fresh sampling-retry `CREATE` on a
/// cache miss.
async fn materialize_scope(core: &Core, script: &str, cursor_id: &str) -> Result<String> {
    let script = rewriter::resolve_alias_conflict(script, cursor_id);

    let candidates: Vec<String> = {
        let pool = core.pool.lock().await;
        pool.query_cache_list(core.config.query_cache_count)
            .into_iter()
            .map(|s| s.to_string())
            .collect()
    };

    let rewritten = {
        let pool = core.pool.lock().await;
        rewriter::rewrite(&pool, &candidates, &script, cursor_id).0
    };

    if rewritten != script {
        return Ok(rewritten);
    }

    if !formatter::support_rewrite(&script) {
        return Ok(script);
    }

    materialize_fresh(core, &script, cursor_id).await
}

/// The main query's scope: as [`materialize_scope`], but a non-urgent
/// request first widens the projection via powerset enrichment (§4.9) using
/// the base table's schema and the Debug-Middle speculated cursor-region
/// text, so a later, not-yet-typed query has a better chance of hitting
/// this cache entry.
async fn materialize_main_scope(
    core: &Core,
    script: &str,
    cursor_id: &str,
    non_urgent: bool,
    prefix: &str,
    suffix: &str,
) -> Result<String> {
    let script = rewriter::resolve_alias_conflict(script, cursor_id);

    let candidates: Vec<String> = {
        let pool = core.pool.lock().await;
        pool.query_cache_list(core.config.query_cache_count)
            .into_iter()
            .map(|s| s.to_string())
            .collect()
    };

    let rewritten = {
        let pool = core.pool.lock().await;
        rewriter::rewrite(&pool, &candidates, &script, cursor_id).0
    };

    if rewritten != script {
        return Ok(rewritten);
    }

    if !formatter::support_rewrite(&script) {
        return Ok(script);
    }

    let mut widened = script.clone();
    if non_urgent {
        if let Ok(tree) = sql::extract(&script) {
            if let Ok(alt_columns) = core.warehouse.table_schema(&tree.from.name).await {
                if !alt_columns.is_empty() {
                    let speculated_middle = speculate_middle(core, prefix, suffix).await.unwrap_or_default();
                    if let Ok(candidate) =
                        rewriter::get_powerset(&script, &alt_columns, &speculated_middle, cursor_id)
                    {
                        if formatter::support_rewrite(&candidate) {
                            widened = candidate;
                        }
                    }
                }
            }
        }
    }

    materialize_fresh(core, &widened, cursor_id).await
}

/// Debug-Middle (§4.8): predict the text the user will eventually type at
/// the cursor, from the surrounding CTE prefix/suffix, feeding powerset
/// enrichment's "is this candidate column actually about to be referenced"
/// check. An LLM failure here is not fatal to `create` — it just means no
/// extra columns are added (§8 scenario "no speculated-middle info").
async fn speculate_middle(core: &Core, prefix: &str, suffix: &str) -> Result<String> {
    let message = ChatMessage {
        role: "user".into(),
        content: format!("{prefix}{}{suffix}", core.config.cursor_identifier),
    };
    core.llm
        .complete("middle", std::slice::from_ref(&message), None, None)
        .await
}

/// The sampling-retry `CREATE` loop: on a warehouse timeout-cancel, retry
/// with a smaller random sample up to `max_iteration` times (C6).
async fn materialize_fresh(core: &Core, script: &str, cursor_id: &str) -> Result<String> {
    let dialect = sampling::SampleDialect::from_endpoint(&core.config.dialect.endpoint);
    let max_iteration = if core.config.enable.sample { core.config.max_iteration } else { 1 };
    let mut retry_k = 0u32;

    loop {
        let sampled = sampling::sample_script(script, retry_k, dialect, cursor_id);
        let check = core.pool.lock().await.check(&sampled, true);

        let outcome = match core.warehouse.execute(&format!(
            "CREATE TEMPORARY TABLE {} AS {sampled}",
            check.name
        )).await {
            Ok(exec) => CreateOutcome::Success(exec.metrics),
            Err(ServerError::Core(speql::SpeqlError::WarehouseTimeoutCancel)) => CreateOutcome::TimeoutCancel,
            Err(e) => CreateOutcome::Other(e.to_string()),
        };

        match &outcome {
            CreateOutcome::Success(metrics) => {
                core.pool.lock().await.update(&sampled, retry_k > 0, metrics.clone());
                if let Ok(columns) = core.warehouse.table_schema(&check.name).await {
                    core.schema_cache.lock().await.record(&check.name, columns);
                }
                evict_excess(core).await;
                return Ok(format!("SELECT * FROM {}", check.name));
            }
            CreateOutcome::Other(_) => {
                return Err(ServerError::Core(speql::SpeqlError::WarehouseOther(
                    "create failed".into(),
                )));
            }
            CreateOutcome::TimeoutCancel => {
                let decision = create_engine::next_retry(&outcome, retry_k, max_iteration);
                if !decision.should_retry {
                    return Err(ServerError::Core(speql::SpeqlError::WarehouseTimeoutCancel));
                }
                retry_k = decision.next_retry_k;
            }
        }
    }
}

/// Drop the pool's oldest entries down to its count/size caps (§4.4). Each
/// candidate is tried independently, oldest first; a `DROP TABLE` failure
/// leaves that entry in place (to be retried on a later pass) without
/// stopping the next-older candidate from being dropped in this same pass.
async fn evict_excess(core: &Core) {
    let plan = core.pool.lock().await.plan_eviction();
    for name in &plan.to_drop {
        match core
            .warehouse
            .execute(&format!("DROP TABLE IF EXISTS {name}"))
            .await
        {
            Ok(_) => core.pool.lock().await.confirm_dropped(name),
            Err(e) => tracing::warn!(table = %name, error = %e, "temp table eviction drop failed"),
        }
    }
}

/// `preview(q)` (§4.9): cap the LIMIT, execute, and truncate to the
/// configured row/byte budgets.
pub async fn preview(core: &Core, rewritten_sql: &str) -> Result<String> {
    let limited = if !rewritten_sql.to_uppercase().contains("LIMIT") {
        format!("{rewritten_sql} LIMIT {}", core.config.preview + 1)
    } else {
        rewritten_sql.to_string()
    };

    let exec = core.warehouse.execute(&limited).await?;
    let mut rendered = exec
        .rows
        .iter()
        .take(core.config.preview)
        .map(|r| r.join(","))
        .collect::<Vec<_>>()
        .join("\n");

    if rendered.len() > core.config.preview_char {
        rendered.truncate(core.config.preview_char);
        rendered.push_str("...[truncated]");
    }

    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::MockLlm;
    use crate::warehouse_client::MockWarehouse;

    fn test_core() -> Arc<Core> {
        let mut config = Config::default();
        config.cursor_identifier = "/*CUR*/".to_string();
        Core::new(config, Arc::new(MockLlm::new()), Arc::new(MockWarehouse::new()))
    }

    #[tokio::test]
    async fn exact_cache_hit_skips_llm_and_warehouse() {
        let core = test_core();
        core.pipeline_cache.lock().await.insert(
            formatter::format("SELECT 1 /*CUR*/", "/*CUR*/"),
            CachedResult {
                modification: "SELECT 1".into(),
                preview: "1".into(),
            },
        );

        let frames = handle_request(Arc::clone(&core), "SELECT 1 /*CUR*/".into(), "s1".into()).await;
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Terminal { complete, .. } => assert!(*complete),
            _ => panic!("expected terminal frame"),
        }
    }
}
