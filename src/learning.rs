use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::corrector::clean_fragment;
use crate::date_parser::{self, month_from_name};
use crate::model::{RuleCategory, RuleOrigin};
use crate::review::{Suggestion, SuggestionSource};
use crate::rules_store::{CorrectionRule, RuleSpec};

const TOP_PATTERN_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenClass {
    Day,
    Year,
    Number(usize),
    Month,
    Alpha,
    Space,
    Punct(char),
}

impl TokenClass {
    fn key(self) -> String {
        match self {
            Self::Day => "DD".to_string(),
            Self::Year => "YYYY".to_string(),
            Self::Number(len) => format!("N{len}"),
            Self::Month => "MON".to_string(),
            Self::Alpha => "A".to_string(),
            Self::Space => "_".to_string(),
            Self::Punct(c) => c.to_string(),
        }
    }

    fn regex(self) -> String {
        match self {
            Self::Day => r"(\d{1,2})".to_string(),
            Self::Year => r"(\d{4})".to_string(),
            Self::Number(len) => format!(r"(\d{{{len}}})"),
            Self::Month => r"([A-Za-z]{3,9})".to_string(),
            Self::Alpha => r"([A-Za-z]+)".to_string(),
            Self::Space => r"\s+".to_string(),
            Self::Punct(c) => regex::escape(&c.to_string()),
        }
    }

    fn captures(self) -> bool {
        !matches!(self, Self::Space | Self::Punct(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub class: TokenClass,
    pub text: String,
}

fn digit_class(len: usize) -> TokenClass {
    match len {
        1 | 2 => TokenClass::Day,
        4 => TokenClass::Year,
        n => TokenClass::Number(n),
    }
}

pub fn tokenize(raw: &str) -> Vec<Token> {
    let cleaned = clean_fragment(raw);
    let chars = cleaned.chars().collect::<Vec<_>>();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let run = |pred: fn(char) -> bool, i: &mut usize| {
            while *i < chars.len() && pred(chars[*i]) {
                *i += 1;
            }
        };
        let class = if c.is_ascii_digit() {
            run(|ch| ch.is_ascii_digit(), &mut i);
            digit_class(i - start)
        } else if c.is_ascii_alphabetic() {
            run(|ch| ch.is_ascii_alphabetic(), &mut i);
            let word = chars[start..i].iter().collect::<String>();
            if month_from_name(&word).is_some() {
                TokenClass::Month
            } else {
                TokenClass::Alpha
            }
        } else if c.is_whitespace() {
            run(char::is_whitespace, &mut i);
            TokenClass::Space
        } else {
            i += 1;
            TokenClass::Punct(c)
        };
        tokens.push(Token {
            class,
            text: chars[start..i].iter().collect(),
        });
    }
    tokens
}

fn signature_of(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| t.class.key())
        .collect::<Vec<_>>()
        .join("|")
}

/// Structural shape of a fragment: "24Feb 2025" and "03Mar 2026" both give
/// `DD|MON|_|YYYY`.
pub fn signature(raw: &str) -> String {
    signature_of(&tokenize(raw))
}

/// Source of one date field: a token of the fragment or a fixed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Token(usize),
    Literal(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Template {
    pub day: Field,
    pub month: Field,
    pub year: Field,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// Every field comes from the fragment.
    Restructuring,
    /// The day is supplied by the template.
    Filling,
    /// Month or year are fixed values and do not generalize.
    Fixed,
}

impl Template {
    pub fn kind(&self) -> TemplateKind {
        match (self.day, self.month, self.year) {
            (_, Field::Literal(_), _) | (_, _, Field::Literal(_)) => TemplateKind::Fixed,
            (Field::Literal(_), _, _) => TemplateKind::Filling,
            _ => TemplateKind::Restructuring,
        }
    }

    /// How the reviewer's date is rebuilt from `tokens`.
    pub fn derive(tokens: &[Token], date: NaiveDate) -> Self {
        let value = |t: &Token| t.text.parse::<u32>().ok();
        let day = tokens
            .iter()
            .position(|t| t.class == TokenClass::Day && value(t) == Some(date.day()))
            .map(Field::Token)
            .unwrap_or(Field::Literal(date.day()));
        let day_idx = match day {
            Field::Token(idx) => Some(idx),
            Field::Literal(_) => None,
        };
        let month = tokens
            .iter()
            .position(|t| {
                t.class == TokenClass::Month && month_from_name(&t.text) == Some(date.month())
            })
            .or_else(|| {
                tokens.iter().enumerate().position(|(idx, t)| {
                    Some(idx) != day_idx
                        && t.class == TokenClass::Day
                        && value(t) == Some(date.month())
                })
            })
            .map(Field::Token)
            .unwrap_or(Field::Literal(date.month()));
        let year = tokens
            .iter()
            .position(|t| {
                t.class == TokenClass::Year
                    && t.text.parse::<i32>().ok() == Some(date.year())
            })
            .map(Field::Token)
            .unwrap_or_else(|| Field::Literal(u32::try_from(date.year()).unwrap_or_default()));
        Self { day, month, year }
    }

    /// Applies the template to another fragment with the same signature.
    pub fn render(&self, tokens: &[Token]) -> Option<NaiveDate> {
        let number = |field: Field| -> Option<u32> {
            match field {
                Field::Literal(v) => Some(v),
                Field::Token(idx) => tokens.get(idx)?.text.parse::<u32>().ok(),
            }
        };
        let month = match self.month {
            Field::Token(idx) => {
                let token = tokens.get(idx)?;
                match token.class {
                    TokenClass::Month => month_from_name(&token.text)?,
                    _ => token.text.parse::<u32>().ok()?,
                }
            }
            Field::Literal(v) => v,
        };
        let year = i32::try_from(number(self.year)?).ok()?;
        NaiveDate::from_ymd_opt(year, month, number(self.day)?)
    }

    fn named_month(&self, tokens: &[Token]) -> bool {
        match self.month {
            Field::Token(idx) => tokens
                .get(idx)
                .map(|t| t.class == TokenClass::Month)
                .unwrap_or(false),
            Field::Literal(_) => false,
        }
    }
}

/// Anchored pattern for the whole signature plus the replacement that
/// renders `template` in a form the parser reads without ambiguity.
fn synthesize_rule(tokens: &[Token], template: &Template) -> (String, String) {
    let mut pattern = String::from("^");
    let mut groups = BTreeMap::<usize, usize>::new();
    for (idx, token) in tokens.iter().enumerate() {
        pattern.push_str(&token.class.regex());
        if token.class.captures() {
            let next = groups.len() + 1;
            groups.insert(idx, next);
        }
    }
    pattern.push('$');

    let part = |field: Field| -> String {
        match field {
            Field::Token(idx) => groups
                .get(&idx)
                .map(|g| format!("${{{g}}}"))
                .unwrap_or_default(),
            Field::Literal(v) => v.to_string(),
        }
    };
    let replacement = if template.named_month(tokens) {
        format!(
            "{} {} {}",
            part(template.day),
            part(template.month),
            part(template.year)
        )
    } else {
        format!(
            "{}-{}-{}",
            part(template.year),
            part(template.month),
            part(template.day)
        )
    };
    (pattern, replacement)
}

pub fn learned_rule_id(signature: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(signature.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    format!("learned_{}", &hex[..12])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateCount {
    pub template: Template,
    pub count: u64,
}

/// Aggregate observations for one signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternStats {
    pub signature: String,
    pub occurrences: u64,
    pub rejections: u64,
    pub templates: Vec<TemplateCount>,
    pub promoted_rule_id: Option<String>,
    pub promoted_template: Option<Template>,
    pub example: String,
}

impl PatternStats {
    fn new(signature: String, example: String) -> Self {
        Self {
            signature,
            occurrences: 0,
            rejections: 0,
            templates: Vec::new(),
            promoted_rule_id: None,
            promoted_template: None,
            example,
        }
    }

    /// Most frequent template; the earliest one wins a tie.
    pub fn dominant(&self) -> Option<&TemplateCount> {
        self.templates
            .iter()
            .fold(None, |best: Option<&TemplateCount>, tc| match best {
                Some(b) if b.count >= tc.count => Some(b),
                _ => Some(tc),
            })
    }

    /// Template used for success accounting: the promoted one once a rule
    /// exists, otherwise the dominant one.
    pub fn reference_template(&self) -> Option<Template> {
        self.promoted_template
            .or_else(|| self.dominant().map(|tc| tc.template))
    }

    pub fn successes(&self) -> u64 {
        let Some(reference) = self.reference_template() else {
            return 0;
        };
        self.templates
            .iter()
            .find(|tc| tc.template == reference)
            .map(|tc| tc.count)
            .unwrap_or(0)
    }

    pub fn success_rate(&self) -> f64 {
        if self.occurrences == 0 {
            return 0.0;
        }
        self.successes() as f64 / self.occurrences as f64
    }

    pub fn is_promoted(&self) -> bool {
        self.promoted_rule_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternView {
    pub signature: String,
    pub occurrences: u64,
    pub successes: u64,
    pub rejections: u64,
    pub success_rate: f64,
    pub promoted_rule_id: Option<String>,
    pub example: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LearningSummary {
    pub total_observations: u64,
    pub total_rejections: u64,
    pub patterns: usize,
    pub promoted: usize,
    pub top_patterns: Vec<PatternView>,
}

#[derive(Debug, Clone)]
pub struct LearningEngine {
    promotion_threshold: f64,
    minimum_sample_size: u64,
    suggestion_threshold: f64,
    min_rule_sample: u64,
    patterns: BTreeMap<String, PatternStats>,
}

impl LearningEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            promotion_threshold: config.promotion_threshold,
            minimum_sample_size: config.minimum_sample_size,
            suggestion_threshold: config.suggestion_threshold,
            min_rule_sample: config.min_rule_sample,
            patterns: BTreeMap::new(),
        }
    }

    pub fn with_patterns(config: &EngineConfig, patterns: Vec<PatternStats>) -> Self {
        let mut engine = Self::new(config);
        engine.patterns = patterns
            .into_iter()
            .map(|p| (p.signature.clone(), p))
            .collect();
        engine
    }

    fn entry(&mut self, raw: &str, signature: String) -> &mut PatternStats {
        self.patterns
            .entry(signature.clone())
            .or_insert_with(|| PatternStats::new(signature, clean_fragment(raw)))
    }

    /// Records an accepted value (APPROVE or MODIFY) for `raw`. Returns the
    /// signature it was filed under.
    pub fn observe(&mut self, raw: &str, final_date: NaiveDate) -> String {
        let tokens = tokenize(raw);
        let signature = signature_of(&tokens);
        let template = Template::derive(&tokens, final_date);
        let stats = self.entry(raw, signature.clone());
        stats.occurrences += 1;
        match stats.templates.iter_mut().find(|tc| tc.template == template) {
            Some(tc) => tc.count += 1,
            None => stats.templates.push(TemplateCount { template, count: 1 }),
        }
        signature
    }

    /// A REJECT counts as an occurrence with no success.
    pub fn observe_rejection(&mut self, raw: &str) -> String {
        let signature = signature(raw);
        let stats = self.entry(raw, signature.clone());
        stats.occurrences += 1;
        stats.rejections += 1;
        signature
    }

    /// Emits one rule for every signature that newly crossed the promotion
    /// threshold. A signature is promoted at most once.
    pub fn promote(&mut self) -> Vec<CorrectionRule> {
        let mut promoted = Vec::new();
        for stats in self.patterns.values_mut() {
            if stats.is_promoted() || stats.occurrences < self.minimum_sample_size {
                continue;
            }
            let rate = stats.success_rate();
            if rate < self.promotion_threshold {
                continue;
            }
            let Some(template) = stats.dominant().map(|tc| tc.template) else {
                continue;
            };
            let category = match template.kind() {
                TemplateKind::Restructuring => RuleCategory::AutoCorrect,
                TemplateKind::Filling => RuleCategory::FlagReview,
                TemplateKind::Fixed => continue,
            };
            let tokens = tokenize(&stats.example);
            let (pattern, replacement) = synthesize_rule(&tokens, &template);
            let id = learned_rule_id(&stats.signature);
            let title = format!("Learned {}", stats.signature);
            let notes = format!(
                "{}/{} reviewed fragments like {:?}",
                stats.successes(),
                stats.occurrences,
                stats.example
            );
            match CorrectionRule::new(RuleSpec {
                id: &id,
                title: &title,
                pattern: &pattern,
                replacement: &replacement,
                category,
                notes: &notes,
                origin: RuleOrigin::Learned,
            }) {
                Ok(rule) => {
                    info!(
                        rule_id = %id,
                        signature = %stats.signature,
                        category = category.as_str(),
                        rate,
                        occurrences = stats.occurrences,
                        "promoted learned correction rule"
                    );
                    stats.promoted_rule_id = Some(id);
                    stats.promoted_template = Some(template);
                    promoted.push(rule);
                }
                Err(reason) => {
                    warn!(signature = %stats.signature, reason = %reason, "learned rule synthesis failed");
                }
            }
        }
        promoted
    }

    /// Dates suggested for `raw` by sufficiently reliable signatures and by
    /// learned flag-review rules whose pattern matches.
    pub fn suggest(&self, raw: &str, rules: &[Arc<CorrectionRule>]) -> Vec<Suggestion> {
        let tokens = tokenize(raw);
        let signature = signature_of(&tokens);
        let mut suggestions = Vec::new();
        if let Some(stats) = self.patterns.get(&signature) {
            let rate = stats.success_rate();
            if rate >= self.suggestion_threshold {
                if let Some(date) = stats.reference_template().and_then(|t| t.render(&tokens)) {
                    suggestions.push(Suggestion {
                        date,
                        confidence: rate,
                        source: SuggestionSource::Learned,
                        detail: format!(
                            "{} of {} reviews of {} agreed",
                            stats.successes(),
                            stats.occurrences,
                            stats.signature
                        ),
                        rule_id: stats.promoted_rule_id.clone(),
                    });
                }
            }
        }

        let cleaned = clean_fragment(raw);
        for rule in rules.iter().filter(|r| {
            r.origin() == RuleOrigin::Learned && r.category() == RuleCategory::FlagReview
        }) {
            let Some(date) = rule
                .rewrite(&cleaned)
                .and_then(|text| date_parser::parse(&text).resolved_date)
            else {
                continue;
            };
            // A fresh rule is as good as the rate that promoted it.
            let confidence = match rule.success_rate() {
                Some(rate) if rule.attempt_count() >= self.min_rule_sample => rate,
                _ => self.promotion_threshold,
            };
            if confidence < self.suggestion_threshold {
                continue;
            }
            if let Some(existing) = suggestions.iter_mut().find(|s| s.date == date) {
                existing.rule_id = Some(rule.id().to_string());
                continue;
            }
            suggestions.push(Suggestion {
                date,
                confidence,
                source: SuggestionSource::Learned,
                detail: format!("learned rule {}", rule.title()),
                rule_id: Some(rule.id().to_string()),
            });
        }
        suggestions
    }

    pub fn pattern(&self, signature: &str) -> Option<&PatternStats> {
        self.patterns.get(signature)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &PatternStats> {
        self.patterns.values()
    }

    pub fn summary(&self) -> LearningSummary {
        let mut views = self
            .patterns
            .values()
            .map(|p| PatternView {
                signature: p.signature.clone(),
                occurrences: p.occurrences,
                successes: p.successes(),
                rejections: p.rejections,
                success_rate: p.success_rate(),
                promoted_rule_id: p.promoted_rule_id.clone(),
                example: p.example.clone(),
            })
            .collect::<Vec<_>>();
        views.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        LearningSummary {
            total_observations: self.patterns.values().map(|p| p.occurrences).sum(),
            total_rejections: self.patterns.values().map(|p| p.rejections).sum(),
            patterns: self.patterns.len(),
            promoted: self.patterns.values().filter(|p| p.is_promoted()).count(),
            top_patterns: views.into_iter().take(TOP_PATTERN_LIMIT).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
    }

    fn engine() -> LearningEngine {
        LearningEngine::new(&EngineConfig::default())
    }

    #[test]
    fn signature_collapses_same_shape() {
        assert_eq!(signature("24Feb 2025"), "DD|MON|_|YYYY");
        assert_eq!(signature("03Mar 2026"), signature("24Feb 2025"));
        assert_eq!(signature("'Feb 2025'"), "MON|_|YYYY");
        assert_eq!(signature("2025/02/3x"), "YYYY|/|DD|/|DD|A");
    }

    #[test]
    fn template_kinds() {
        let tokens = tokenize("24Feb 2025");
        let t = Template::derive(&tokens, ymd(2025, 2, 24));
        assert_eq!(t.kind(), TemplateKind::Restructuring);
        assert_eq!(t.render(&tokenize("03Mar 2026")), Some(ymd(2026, 3, 3)));

        let tokens = tokenize("Feb 2025");
        let t = Template::derive(&tokens, ymd(2025, 2, 1));
        assert_eq!(t.kind(), TemplateKind::Filling);
        assert_eq!(t.render(&tokenize("Apr 2026")), Some(ymd(2026, 4, 1)));

        let t = Template::derive(&tokens, ymd(2024, 2, 1));
        assert_eq!(t.kind(), TemplateKind::Fixed);
    }

    #[test]
    fn single_observation_never_promotes() {
        let mut engine = engine();
        engine.observe("Feb 2025", ymd(2025, 2, 15));
        assert!(engine.promote().is_empty());
    }

    #[test]
    fn diverging_days_do_not_promote() {
        let mut engine = engine();
        engine.observe("Feb 2025", ymd(2025, 2, 15));
        engine.observe("Mar 2025", ymd(2025, 3, 1));
        engine.observe("Apr 2025", ymd(2025, 4, 1));
        let stats = engine.pattern("MON|_|YYYY").expect("stats");
        assert_eq!((stats.successes(), stats.occurrences), (2, 3));
        assert!(engine.promote().is_empty());
    }

    #[test]
    fn converging_fill_promotes_flag_review_rule() {
        let mut engine = engine();
        for (raw, date) in [
            ("Feb 2025", ymd(2025, 2, 1)),
            ("Mar 2025", ymd(2025, 3, 1)),
            ("Apr 2025", ymd(2025, 4, 1)),
        ] {
            engine.observe(raw, date);
        }
        let rules = engine.promote();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.category(), RuleCategory::FlagReview);
        assert_eq!(rule.origin(), RuleOrigin::Learned);
        assert_eq!(rule.rewrite("Jun 2026").as_deref(), Some("1 Jun 2026"));
        assert!(engine.promote().is_empty(), "promotion happens once");
    }

    #[test]
    fn restructuring_promotes_auto_correct_rule() {
        let mut engine = engine();
        engine.observe("2025 Feb 10:00 48", ymd(2025, 2, 10));
        engine.observe("2025 Mar 12:30 05", ymd(2025, 3, 12));
        engine.observe("2024 Dec 3:15 22", ymd(2024, 12, 3));
        let rules = engine.promote();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.category(), RuleCategory::AutoCorrect);
        assert_eq!(
            rule.rewrite("2026 Jan 07:45 11").as_deref(),
            Some("07 Jan 2026")
        );
    }

    #[test]
    fn promotion_is_monotonic_under_later_disagreement() {
        let mut engine = engine();
        for (raw, m) in [("Jan 2025", 1), ("Feb 2025", 2), ("Mar 2025", 3), ("Apr 2025", 4)] {
            engine.observe(raw, ymd(2025, m, 1));
        }
        let rules = engine.promote();
        assert_eq!(rules.len(), 1);
        for _ in 0..6 {
            engine.observe_rejection("Feb 2025");
        }
        let stats = engine.pattern("MON|_|YYYY").expect("stats");
        assert!(stats.success_rate() < 0.5);
        assert!(stats.is_promoted());
        assert!(engine.promote().is_empty());
        assert_eq!(engine.summary().promoted, 1);
    }

    #[test]
    fn suggestions_need_a_reliable_pattern() {
        let mut engine = engine();
        engine.observe("Feb 2025", ymd(2025, 2, 1));
        engine.observe("Mar 2025", ymd(2025, 3, 1));
        let s = engine.suggest("Jul 2026", &[]);
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].date, ymd(2026, 7, 1));
        assert_eq!(s[0].source, SuggestionSource::Learned);

        engine.observe_rejection("Aug 2025");
        engine.observe_rejection("Sep 2025");
        assert!(engine.suggest("Jul 2026", &[]).is_empty());
    }

    #[test]
    fn learned_flag_rules_contribute_suggestions() {
        let mut engine = engine();
        for (raw, m) in [("Jan 2025", 1), ("Feb 2025", 2), ("Mar 2025", 3)] {
            engine.observe(raw, ymd(2025, m, 1));
        }
        let rules = engine.promote().into_iter().map(Arc::new).collect::<Vec<_>>();
        let s = engine.suggest("Sep 2026", &rules);
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].date, ymd(2026, 9, 1));
        assert_eq!(s[0].rule_id.as_deref(), Some(rules[0].id()));
    }
}
