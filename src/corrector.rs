use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::model::RuleCategory;
use crate::rules_store::RuleSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Correction {
    pub original: String,
    pub cleaned: String,
    pub corrected: String,
    /// One entry per auto-correct application, in order.
    pub rules_applied: Vec<String>,
    /// Flag-review rules that matched `cleaned`.
    pub flagged_rules: Vec<String>,
    pub passes: usize,
    /// True when the last check found no auto-correct rule that would change the text.
    pub converged: bool,
}

fn ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("invalid ws regex"))
}

/// Trims, strips wrapping quotes and collapses whitespace runs.
pub fn clean_fragment(raw: &str) -> String {
    let mut text = raw.trim();
    loop {
        let stripped = ['\'', '"', '`'].iter().find_map(|q| {
            text.strip_prefix(*q)
                .and_then(|t| t.strip_suffix(*q))
                .map(str::trim)
        });
        match stripped {
            Some(inner) => text = inner,
            None => break,
        }
    }
    ws_re().replace_all(text, " ").into_owned()
}

/// First active auto-correct rule in priority order that changes `text`.
fn next_rewrite(snapshot: &RuleSnapshot, text: &str) -> Option<(String, String)> {
    snapshot.active(RuleCategory::AutoCorrect).find_map(|entry| {
        entry
            .rule
            .rewrite(text)
            .map(|out| clean_fragment(&out))
            .filter(|out| out != text)
            .map(|out| (entry.rule.id().to_string(), out))
    })
}

/// Applies at most one auto-correct rule per pass, repeating up to
/// `max_passes` times. Attempt counters move once per rule per fragment.
pub fn apply(snapshot: &RuleSnapshot, fragment: &str, max_passes: usize) -> Correction {
    let cleaned = clean_fragment(fragment);

    let mut flagged_rules = Vec::new();
    for entry in snapshot.active(RuleCategory::FlagReview) {
        if entry.rule.pattern().is_match(&cleaned) {
            entry.rule.record_attempt();
            flagged_rules.push(entry.rule.id().to_string());
        }
    }

    let mut corrected = cleaned.clone();
    let mut rules_applied = Vec::<String>::new();
    let mut passes = 0;
    let mut converged = false;
    while passes < max_passes {
        let Some((rule_id, out)) = next_rewrite(snapshot, &corrected) else {
            converged = true;
            break;
        };
        passes += 1;
        if !rules_applied.contains(&rule_id) {
            if let Some(entry) = snapshot.get(&rule_id) {
                entry.rule.record_attempt();
            }
        }
        rules_applied.push(rule_id);
        corrected = out;
    }
    if !converged {
        converged = next_rewrite(snapshot, &corrected).is_none();
    }

    Correction {
        original: fragment.to_string(),
        cleaned,
        corrected,
        rules_applied,
        flagged_rules,
        passes,
        converged,
    }
}
