//! Debug loop (C7) — the synchronous, warehouse/LLM-independent half.
//!
//! Producing a runnable SQL query from a partial cursor-region edit happens
//! in two passes: a cheap, rule-based "simple" pass that replays previously
//! learned find/replace edits, and an LLM-assisted "complex" pass when that
//! fails. Both passes are orchestrated asynchronously in `speql-server`
//! (they call out to an LLM and a warehouse `EXPLAIN`); what lives here is
//! everything about them that's pure text manipulation: generating a rule
//! set from a diff between the pre-edit and post-edit query, validating an
//! LLM's proposed rule set before it's trusted, applying rules to a script,
//! and managing the bounded transcript each pass sends to the LLM.

use once_cell::sync::Lazy;
use regex::Regex;

/// One learned find/replace edit: `old` is a unique substring of the prior
/// script, `new` is what the LLM/diff decided it becomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub old: String,
    pub new: String,
}

/// A single exchange turn kept in a debug transcript sent to the LLM.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Bounded message history for one debug pass. Index 0 is always the
/// system prompt; everything after alternates user/assistant exchange
/// pairs, so truncation always removes a pair at a time to keep that
/// alternation intact.
#[derive(Debug, Clone, Default)]
pub struct DebugTranscript {
    messages: Vec<Message>,
}

impl DebugTranscript {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    pub fn set_system(&mut self, content: impl Into<String>) {
        if self.messages.is_empty() {
            self.messages.push(Message::system(content));
        } else {
            self.messages[0] = Message::system(content);
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    /// Drop a trailing unanswered user turn before reseeding the system
    /// prompt for a fresh call, matching the upstream pop-if-dangling-user
    /// step.
    pub fn drop_trailing_user(&mut self) {
        if self.messages.last().map(|m| m.role == "user").unwrap_or(false) {
            self.messages.pop();
        }
    }

    pub fn clear(&mut self) {
        self.messages.truncate(1);
    }

    fn approx_size(&self) -> usize {
        self.messages
            .iter()
            .map(|m| m.role.len() + m.content.len() + 6)
            .sum()
    }

    /// Drop the oldest (user, assistant) exchange pairs until the
    /// transcript fits both a byte-size budget and an exchange-count
    /// budget. Always keeps the system message and at least one pair.
    pub fn trim_to_budget(&mut self, size_budget: usize, count_budget: usize) {
        while self.approx_size() > size_budget && self.messages.len() >= 3 {
            self.messages.remove(1);
            self.messages.remove(1);
        }
        while self.messages.len() > count_budget * 2 + 1 {
            self.messages.remove(1);
            self.messages.remove(1);
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}

/// Extract the content of the first fenced ` ```sql ... ``` ` block. The
/// closing fence is the first one found after the opening, matching the
/// complex-debug pass's "take everything up to the next fence" behavior.
pub fn extract_sql_fence(text: &str) -> Option<String> {
    let start = text.find("```sql")? + "```sql".len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

/// Extract the content of a ` ```json ... ``` ` block. The closing fence is
/// the *last* one in the text, matching the simple-debug pass (an LLM
/// sometimes emits fences inside example strings in its reasoning before
/// the final block).
pub fn extract_json_fence(text: &str) -> Option<String> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let end = rest.rfind("```")?;
    if end < start {
        return None;
    }
    Some(rest[..end].trim().to_string())
}

/// Whether `cursor_identifier` appears exactly once in `text` — the
/// complex-debug pass's check before trusting a rewrite.
pub fn has_single_cursor_marker(text: &str, cursor_identifier: &str) -> bool {
    count_occurrences(text, cursor_identifier) == 1
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    haystack.matches(needle).count()
}

/// A rule that failed validation, with the feedback message that would be
/// sent back to the LLM to ask for a correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleViolation {
    pub message: String,
}

/// Validate and normalize one batch of LLM-proposed rules against the
/// script they were generated from, mirroring the simple-debug pass's
/// per-rule checks:
///   - if `old` isn't a literal substring, try to recover it via a
///     whitespace-tolerant match (the LLM often collapses/reformats
///     whitespace);
///   - the cursor identifier must appear in both `old` and `new`, or
///     neither — if it's only in `new`, it's silently stripped;
///   - `old` must occur exactly once in `sql`, or the rule is ambiguous.
///
/// Returns the normalized rules on success, or the first violation's
/// feedback message on failure (the caller is expected to append that
/// message to the transcript and retry).
pub fn validate_proposed_rules(
    rules: &[Rule],
    sql: &str,
    cursor_identifier: &str,
) -> Result<Vec<Rule>, RuleViolation> {
    let mut out = Vec::with_capacity(rules.len());
    for rule in rules {
        let mut rule = rule.clone();

        if !sql.contains(rule.old.as_str()) {
            if let Some(recovered) = recover_whitespace_tolerant(&rule.old, sql) {
                rule.old = recovered;
            }
        }

        let has_cursor_old = rule.old.contains(cursor_identifier);
        let has_cursor_new = rule.new.contains(cursor_identifier);

        if has_cursor_old && !has_cursor_new {
            return Err(RuleViolation {
                message: format!(
                    "Error: {cursor_identifier} is in rule old: \"{}\" it should also be in rule new: \"{}\", please fix it.",
                    rule.old, rule.new
                ),
            });
        }

        if !has_cursor_old && has_cursor_new {
            rule.new = rule.new.replace(cursor_identifier, "");
        }

        if count_occurrences(sql, &rule.old) != 1 {
            return Err(RuleViolation {
                message: format!(
                    "Error: rule old: \"{}\" should be unique, your output appears more than once, please fix it.",
                    rule.old
                ),
            });
        }

        out.push(rule);
    }

    Ok(out.into_iter().filter(|r| r.old != r.new).collect())
}

/// Recover the literal substring of `haystack` that an LLM's `old` pattern
/// refers to when whitespace doesn't line up exactly, by collapsing runs of
/// whitespace in the pattern to a `\s+` match.
fn recover_whitespace_tolerant(pattern: &str, haystack: &str) -> Option<String> {
    static WS_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
    let escaped = regex::escape(pattern);
    let tolerant = WS_RUN.replace_all(&escaped, r"\s+");
    let re = Regex::new(&tolerant).ok()?;
    re.find(haystack).map(|m| m.as_str().to_string())
}

/// Apply a sequence of rules to `sql`, each replacing *all* occurrences of
/// its `old` (rules are meant to already be validated unique, but a rule
/// generated earlier in the sequence can make a later one's `old` appear
/// more than once — that's accepted here, same as upstream).
pub fn apply_rules(sql: &str, rules: &[Rule]) -> String {
    let mut out = sql.to_string();
    for rule in rules {
        out = out.replace(rule.old.as_str(), rule.new.as_str());
    }
    out
}

/// Keep only the rules whose `old` still appears in `sql` — dropping ones
/// that an earlier rule in the same batch already made obsolete.
pub fn retained_rules(rules: &[Rule], sql: &str) -> Vec<Rule> {
    rules
        .iter()
        .filter(|r| sql.contains(r.old.as_str()))
        .cloned()
        .collect()
}

fn validate_unique_occurrence(part: &str, whole: &str) -> bool {
    if part.is_empty() {
        return false;
    }
    count_occurrences(whole, part) == 1
}

/// Split `s` into alternating whitespace/non-whitespace runs, preserving
/// every character — the token granularity the rule-diff algorithm works
/// over, matching `re.split(r"(\s+)", s)`.
fn split_whitespace_runs(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut current_is_ws: Option<bool> = None;

    for c in s.chars() {
        let is_ws = c.is_whitespace();
        if current_is_ws.is_some_and(|prev| prev != is_ws) {
            out.push(std::mem::take(&mut current));
        }
        current_is_ws = Some(is_ws);
        current.push(c);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[derive(Debug, Clone, Copy)]
struct ReplaceSpan {
    i1: usize,
    i2: usize,
    j1: usize,
    j2: usize,
}

/// Token-level diff between `a` and `b`, returning only the non-matching
/// spans (coalesced runs of differing tokens), in order. The reference
/// debug-rule generator only ever inspects non-"equal" opcodes, so this
/// collapses difflib's insert/delete/replace distinction into one span
/// kind, same effect for this algorithm's purposes.
fn diff_spans(a: &[String], b: &[String]) -> Vec<ReplaceSpan> {
    let n = a.len();
    let m = b.len();
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut spans = Vec::new();
    let mut i = 0usize;
    let mut j = 0usize;
    let mut run_start: Option<(usize, usize)> = None;

    while i < n || j < m {
        if i < n && j < m && a[i] == b[j] {
            if let Some((si, sj)) = run_start.take() {
                spans.push(ReplaceSpan {
                    i1: si,
                    i2: i,
                    j1: sj,
                    j2: j,
                });
            }
            i += 1;
            j += 1;
        } else {
            if run_start.is_none() {
                run_start = Some((i, j));
            }
            if i < n && (j >= m || lcs[i + 1][j] >= lcs[i][j + 1]) {
                i += 1;
            } else {
                j += 1;
            }
        }
    }
    if let Some((si, sj)) = run_start {
        spans.push(ReplaceSpan {
            i1: si,
            i2: n,
            j1: sj,
            j2: m,
        });
    }
    spans
}

const MAX_RULE_DERIVATION_ROUNDS: usize = 64;

/// Derive the minimal set of unique find/replace rules that transform `a`
/// into `b`, widening each differing region until it is both unique in `a`
/// and at least `min_rule_length` tokens long, then re-diffing the
/// rule-applied remainder until it matches `b` exactly. Used to seed the
/// simple-debug rule cache from a complex-debug or manually-confirmed
/// rewrite, so the next keystroke-triggered request can skip the LLM.
pub fn get_replacement_rule(a: &str, b: &str, min_rule_length: usize) -> Vec<Rule> {
    let mut rules = Vec::new();
    let b_tokens = split_whitespace_runs(b);
    let mut current = a.to_string();
    let mut rounds = 0;

    loop {
        rounds += 1;
        let before_round = current.clone();
        let a_tokens = split_whitespace_runs(&current);
        let spans = diff_spans(&a_tokens, &b_tokens);
        let mut mem_right = 0usize;
        let mut round_rules = Vec::new();

        for span in &spans {
            if span.i1 < mem_right {
                continue;
            }
            let (mut left, mut right) = (span.i1, span.i2);

            loop {
                let sub_a_unique =
                    validate_unique_occurrence(&a_tokens[left..right].concat(), &a_tokens.concat());

                if sub_a_unique && right - left >= min_rule_length {
                    let mut left_b = span.j1 as isize - (span.i1 as isize - left as isize);
                    let mut right_b = span.j2 as isize + (right as isize - span.i2 as isize);
                    left_b = left_b.max(0);
                    right_b = right_b.min(b_tokens.len() as isize);
                    let left_b = left_b as usize;
                    let mut right_b = right_b as usize;

                    if right != a_tokens.len()
                        && right_b != b_tokens.len()
                        && a_tokens[right] == b_tokens[right_b]
                    {
                        right += 1;
                        right_b += 1;
                    }

                    mem_right = right;
                    round_rules.push(Rule {
                        old: a_tokens[left..right].concat(),
                        new: b_tokens[left_b..right_b].concat(),
                    });
                    break;
                }

                if left > mem_right {
                    let step = (left - mem_right).min(min_rule_length.saturating_sub(right - left).max(1));
                    left -= step;
                } else if right < a_tokens.len() {
                    let step = (a_tokens.len() - right)
                        .min(min_rule_length.saturating_sub(right - left).max(1));
                    right += step;
                } else {
                    break;
                }
            }
        }

        rules.extend(round_rules.iter().cloned());
        current = before_round;
        for rule in &round_rules {
            current = current.replace(rule.old.as_str(), rule.new.as_str());
        }

        if current == b || round_rules.is_empty() || rounds >= MAX_RULE_DERIVATION_ROUNDS {
            break;
        }
    }

    rules
}
