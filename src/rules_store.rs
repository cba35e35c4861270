use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use regex::Regex;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{RuleCategory, RuleOrigin};

const SEED_RULES_CSV: &str = include_str!("../data/rules/date_corrections.csv");
const REQUIRED_HEADERS: &[&str] = &["title", "pattern", "replacement", "category", "notes"];
const RULE_FILE_HEADERS: &[&str] = &[
    "id",
    "title",
    "pattern",
    "replacement",
    "category",
    "notes",
    "origin",
    "success_count",
    "attempt_count",
];

/// A validated correction rule. Everything except the two counters is fixed
/// after construction.
#[derive(Debug)]
pub struct CorrectionRule {
    id: String,
    title: String,
    pattern: Regex,
    replacement: String,
    category: RuleCategory,
    notes: String,
    origin: RuleOrigin,
    success_count: AtomicU64,
    attempt_count: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleView {
    pub id: String,
    pub title: String,
    pub pattern: String,
    pub replacement: String,
    pub category: RuleCategory,
    pub notes: String,
    pub origin: RuleOrigin,
    pub success_count: u64,
    pub attempt_count: u64,
    pub success_rate: Option<f64>,
    pub deprioritized: bool,
}

pub struct RuleSpec<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub pattern: &'a str,
    pub replacement: &'a str,
    pub category: RuleCategory,
    pub notes: &'a str,
    pub origin: RuleOrigin,
}

impl CorrectionRule {
    pub fn new(spec: RuleSpec<'_>) -> Result<Self, String> {
        Self::with_counters(spec, 0, 0)
    }

    pub fn with_counters(
        spec: RuleSpec<'_>,
        success_count: u64,
        attempt_count: u64,
    ) -> Result<Self, String> {
        let id = spec.id.trim();
        if id.is_empty() {
            return Err("rule id is empty".to_string());
        }
        if spec.pattern.trim().is_empty() {
            return Err("pattern is empty".to_string());
        }
        let pattern =
            Regex::new(spec.pattern).map_err(|e| format!("pattern does not compile: {e}"))?;
        let replacement = normalize_replacement(spec.replacement, &pattern)?;
        if success_count > attempt_count {
            return Err(format!(
                "success_count {success_count} exceeds attempt_count {attempt_count}"
            ));
        }
        Ok(Self {
            id: id.to_string(),
            title: spec.title.trim().to_string(),
            pattern,
            replacement,
            category: spec.category,
            notes: spec.notes.trim().to_string(),
            origin: spec.origin,
            success_count: AtomicU64::new(success_count),
            attempt_count: AtomicU64::new(attempt_count),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    pub fn category(&self) -> RuleCategory {
        self.category
    }

    pub fn origin(&self) -> RuleOrigin {
        self.origin
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn attempt_count(&self) -> u64 {
        self.attempt_count.load(Ordering::Relaxed)
    }

    pub fn record_attempt(&self) {
        self.attempt_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a success. Never lets successes pass attempts; returns false
    /// when the increment was refused.
    pub fn record_success(&self) -> bool {
        let attempts = self.attempt_count();
        self.success_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
                (s < attempts).then_some(s + 1)
            })
            .is_ok()
    }

    pub fn success_rate(&self) -> Option<f64> {
        let attempts = self.attempt_count();
        if attempts == 0 {
            return None;
        }
        Some(self.success_count().min(attempts) as f64 / attempts as f64)
    }

    /// Laplace-smoothed rate used only for ordering.
    pub fn smoothed_rate(&self) -> f64 {
        (self.success_count() as f64 + 1.0) / (self.attempt_count() as f64 + 2.0)
    }

    /// Only auto-correct rules are ever skipped; flag rules never rewrite
    /// anything and keep annotating whatever their rate.
    pub fn is_deprioritized(&self, config: &EngineConfig) -> bool {
        self.category == RuleCategory::AutoCorrect
            && self.attempt_count() >= config.min_rule_sample
            && self
                .success_rate()
                .map(|rate| rate < config.deprioritize_below)
                .unwrap_or(false)
    }

    /// Output of the rule on `text`, or `None` when it does not match.
    pub fn rewrite(&self, text: &str) -> Option<String> {
        if !self.pattern.is_match(text) {
            return None;
        }
        Some(
            self.pattern
                .replace_all(text, self.replacement.as_str())
                .into_owned(),
        )
    }

    pub fn view(&self, config: &EngineConfig) -> RuleView {
        RuleView {
            id: self.id.clone(),
            title: self.title.clone(),
            pattern: self.pattern.as_str().to_string(),
            replacement: self.replacement.clone(),
            category: self.category,
            notes: self.notes.clone(),
            origin: self.origin,
            success_count: self.success_count(),
            attempt_count: self.attempt_count(),
            success_rate: self.success_rate(),
            deprioritized: self.is_deprioritized(config),
        }
    }

    fn to_row(&self) -> BTreeMap<String, String> {
        let mut row = BTreeMap::new();
        row.insert("id".to_string(), self.id.clone());
        row.insert("title".to_string(), self.title.clone());
        row.insert("pattern".to_string(), self.pattern.as_str().to_string());
        row.insert("replacement".to_string(), self.replacement.clone());
        row.insert("category".to_string(), self.category.as_str().to_string());
        row.insert("notes".to_string(), self.notes.clone());
        row.insert("origin".to_string(), self.origin.as_str().to_string());
        row.insert("success_count".to_string(), self.success_count().to_string());
        row.insert("attempt_count".to_string(), self.attempt_count().to_string());
        row
    }
}

/// Rewrites `\1`, `$1` and `$name` references to the `${..}` form and checks
/// that each one names a capture group of `pattern`.
fn normalize_replacement(replacement: &str, pattern: &Regex) -> Result<String, String> {
    let group_count = pattern.captures_len().saturating_sub(1);
    let names = pattern.capture_names().flatten().collect::<HashSet<_>>();
    let chars = replacement.chars().collect::<Vec<_>>();
    let mut out = String::with_capacity(replacement.len());

    let check = |name: &str, out: &mut String| -> Result<(), String> {
        if name.chars().all(|c| c.is_ascii_digit()) {
            let n = name
                .parse::<usize>()
                .map_err(|_| format!("back-reference {name} is not a group number"))?;
            if n > group_count {
                return Err(format!(
                    "back-reference {n} exceeds the {group_count} capture group(s) in pattern"
                ));
            }
        } else if !names.contains(name) {
            return Err(format!("back-reference {name:?} names no capture group"));
        }
        out.push_str("${");
        out.push_str(name);
        out.push('}');
        Ok(())
    };

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match (c, next) {
            ('\\', Some(d)) if d.is_ascii_digit() => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
                let name = chars[start..end].iter().collect::<String>();
                check(&name, &mut out)?;
                i = end;
            }
            ('$', Some('$')) => {
                out.push_str("$$");
                i += 2;
            }
            ('$', Some('{')) => {
                let start = i + 2;
                let close = chars[start..]
                    .iter()
                    .position(|ch| *ch == '}')
                    .map(|p| start + p)
                    .ok_or_else(|| "unterminated ${ in replacement".to_string())?;
                let name = chars[start..close].iter().collect::<String>();
                if name.is_empty() {
                    return Err("empty ${} in replacement".to_string());
                }
                check(&name, &mut out)?;
                i = close + 1;
            }
            ('$', Some(d)) if d.is_ascii_alphanumeric() || d == '_' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                let name = chars[start..end].iter().collect::<String>();
                check(&name, &mut out)?;
                i = end;
            }
            ('$', _) => {
                out.push_str("$$");
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleLoadIssue {
    pub line: u64,
    pub title: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleLoadReport {
    pub loaded: usize,
    pub rejected: Vec<RuleLoadIssue>,
}

pub(crate) fn rule_id_from_title(title: &str, pattern: &str) -> String {
    let slug = title
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>();
    let slug = slug.trim_matches('_').to_string();
    if !slug.is_empty() {
        return slug;
    }
    let mut hasher = Sha1::new();
    hasher.update(pattern.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    format!("rule_{}", &hex[..12])
}

/// A rule frozen into a batch snapshot together with its rate at snapshot time.
#[derive(Debug, Clone)]
pub struct SnapshotRule {
    pub rule: Arc<CorrectionRule>,
    /// Raw success rate once the rule has `min_rule_sample` attempts.
    pub sampled_rate: Option<f64>,
    pub active: bool,
}

/// Priority-ordered view of the store taken at batch start. Counter updates
/// made during the batch go to the shared rules but never reorder this view.
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    entries: Vec<SnapshotRule>,
}

impl RuleSnapshot {
    pub fn entries(&self) -> &[SnapshotRule] {
        &self.entries
    }

    pub fn active(&self, category: RuleCategory) -> impl Iterator<Item = &SnapshotRule> {
        self.entries
            .iter()
            .filter(move |e| e.active && e.rule.category() == category)
    }

    pub fn get(&self, id: &str) -> Option<&SnapshotRule> {
        self.entries.iter().find(|e| e.rule.id() == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.rule.id().to_string()).collect()
    }
}

#[derive(Debug, Default)]
pub struct RuleStore {
    rules: Vec<Arc<CorrectionRule>>,
    report: RuleLoadReport,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store built from the rule set compiled into the crate.
    pub fn seeded() -> EngineResult<Self> {
        Self::from_reader(SEED_RULES_CSV.as_bytes(), Path::new("<seed>"))
    }

    pub fn load_from_path(path: &Path) -> EngineResult<Self> {
        let file = fs::File::open(path).map_err(|e| EngineError::io(path, e))?;
        Self::from_reader(file, path)
    }

    pub fn from_reader<R: Read>(reader: R, origin: &Path) -> EngineResult<Self> {
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .from_reader(reader);
        let headers = reader.headers()?.clone();
        let index = header_index(&headers);
        let missing = REQUIRED_HEADERS
            .iter()
            .filter(|h| !index.contains_key(**h))
            .copied()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(EngineError::RuleFile {
                path: origin.to_path_buf(),
                reason: format!("missing column(s): {}", missing.join(", ")),
            });
        }

        let mut store = Self::new();
        let mut seen = HashSet::<String>::new();
        for rec in reader.records() {
            let record = rec?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            let field = |name: &str| -> String {
                index
                    .get(name)
                    .and_then(|idx| record.get(*idx))
                    .unwrap_or_default()
                    .trim()
                    .to_string()
            };
            if record.iter().all(|v| v.trim().is_empty()) {
                continue;
            }
            let title = field("title");
            match row_to_rule(&field, &title) {
                Ok(rule) if !seen.insert(rule.id().to_string()) => {
                    store.reject(line, title, format!("duplicate rule id {}", rule.id()));
                }
                Ok(rule) => store.rules.push(Arc::new(rule)),
                Err(reason) => store.reject(line, title, reason),
            }
        }
        store.report.loaded = store.rules.len();
        Ok(store)
    }

    fn reject(&mut self, line: u64, title: String, reason: String) {
        warn!(line, title = %title, reason = %reason, "correction rule rejected");
        self.report.rejected.push(RuleLoadIssue {
            line,
            title,
            reason,
        });
    }

    pub fn load_report(&self) -> &RuleLoadReport {
        &self.report
    }

    pub fn rules(&self) -> &[Arc<CorrectionRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<CorrectionRule>> {
        self.rules.iter().find(|r| r.id() == id)
    }

    /// Adds a learned rule. Returns false when a rule with the same id exists.
    pub fn add(&mut self, rule: CorrectionRule) -> bool {
        if self.get(rule.id()).is_some() {
            return false;
        }
        self.rules.push(Arc::new(rule));
        true
    }

    pub fn snapshot(&self, config: &EngineConfig) -> RuleSnapshot {
        let mut entries = self
            .rules
            .iter()
            .map(|rule| {
                let sampled_rate = if rule.attempt_count() >= config.min_rule_sample {
                    rule.success_rate()
                } else {
                    None
                };
                (
                    rule.smoothed_rate(),
                    SnapshotRule {
                        rule: Arc::clone(rule),
                        sampled_rate,
                        active: !rule.is_deprioritized(config),
                    },
                )
            })
            .collect::<Vec<_>>();
        entries.sort_by(|(rate_a, a), (rate_b, b)| {
            let group_a = a.rule.origin() == RuleOrigin::Learned;
            let group_b = b.rule.origin() == RuleOrigin::Learned;
            group_a
                .cmp(&group_b)
                .then_with(|| rate_b.total_cmp(rate_a))
        });
        RuleSnapshot {
            entries: entries.into_iter().map(|(_, e)| e).collect(),
        }
    }

    pub fn views(&self, config: &EngineConfig) -> Vec<RuleView> {
        self.snapshot(config)
            .entries()
            .iter()
            .map(|e| e.rule.view(config))
            .collect()
    }

    /// Writes every rule, counters included, in load order.
    pub fn save_to_path(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
            }
        }
        let tmp_path = path.with_extension("csv.tmp");
        {
            let mut writer = WriterBuilder::new()
                .has_headers(true)
                .from_path(&tmp_path)?;
            writer.write_record(RULE_FILE_HEADERS)?;
            for rule in &self.rules {
                let row = rule.to_row();
                let record = RULE_FILE_HEADERS
                    .iter()
                    .map(|h| row.get(*h).cloned().unwrap_or_default())
                    .collect::<Vec<_>>();
                writer.write_record(record)?;
            }
            writer.flush().map_err(|e| EngineError::io(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, path).map_err(|e| EngineError::io(path, e))
    }
}

fn header_index(headers: &StringRecord) -> BTreeMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, h)| (h.trim().to_ascii_lowercase(), idx))
        .collect()
}

fn parse_counter(raw: &str, name: &str) -> Result<u64, String> {
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse::<u64>()
        .map_err(|_| format!("{name} must be a non-negative integer, got {raw:?}"))
}

fn row_to_rule(field: &dyn Fn(&str) -> String, title: &str) -> Result<CorrectionRule, String> {
    let pattern = field("pattern");
    let category_raw = field("category");
    let category = RuleCategory::parse(&category_raw)
        .ok_or_else(|| format!("unknown category {category_raw:?}"))?;
    let origin_raw = field("origin");
    let origin =
        RuleOrigin::parse(&origin_raw).ok_or_else(|| format!("unknown origin {origin_raw:?}"))?;
    let mut id = field("id");
    if id.is_empty() {
        id = rule_id_from_title(title, &pattern);
    }
    let mut success = parse_counter(&field("success_count"), "success_count")?;
    let attempts = parse_counter(&field("attempt_count"), "attempt_count")?;
    if success > attempts {
        warn!(id = %id, success, attempts, "success_count clamped to attempt_count");
        success = attempts;
    }
    CorrectionRule::with_counters(
        RuleSpec {
            id: &id,
            title,
            pattern: &pattern,
            replacement: &field("replacement"),
            category,
            notes: &field("notes"),
            origin,
        },
        success,
        attempts,
    )
}

/// Writes the compiled-in seed rules to `path` unless a rule file is already there.
pub fn ensure_rules_file_seeded(path: &Path) -> EngineResult<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
    }
    fs::write(path, SEED_RULES_CSV).map_err(|e| EngineError::io(path, e))?;
    Ok(true)
}
