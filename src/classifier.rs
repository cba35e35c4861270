use chrono::{Days, Months, NaiveDate, Utc};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::model::{ActionRequired, AmbiguityFlag, Confidence, DateIssue, ParseOutcome, WarningLevel};
use crate::rules_store::RuleSnapshot;

/// Classifier state, listed in precedence order. The first state whose
/// condition holds wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClassifierState {
    /// Nothing resolved and no recognizable partial shape.
    Unparseable,
    /// A recognized shape with day, month or year missing.
    Incomplete,
    /// A time suffix was dropped.
    MalformedTime,
    /// Day-first and month-first readings disagree.
    Ambiguous,
    /// A flag-review rule matched the cleaned original.
    OcrPattern,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub state: ClassifierState,
    pub issue: DateIssue,
    pub warning_level: WarningLevel,
    pub action_required: ActionRequired,
    pub confidence: Confidence,
}

pub fn state_for(outcome: &ParseOutcome, flagged_by: &[String]) -> ClassifierState {
    if outcome.is_incomplete_shape() {
        return ClassifierState::Incomplete;
    }
    if outcome.resolved_date.is_none() {
        return ClassifierState::Unparseable;
    }
    if outcome.has_flag(AmbiguityFlag::TruncatedTime) {
        return ClassifierState::MalformedTime;
    }
    if outcome.has_flag(AmbiguityFlag::ConflictingOrder) {
        return ClassifierState::Ambiguous;
    }
    if !flagged_by.is_empty() {
        return ClassifierState::OcrPattern;
    }
    ClassifierState::Resolved
}

/// Advisory flag for a date outside the configured plausibility window.
/// It never changes the classification.
pub fn plausibility_flag(date: NaiveDate, config: &EngineConfig) -> Option<AmbiguityFlag> {
    let today = config
        .reference_date
        .unwrap_or_else(|| Utc::now().date_naive());
    let latest = today.checked_add_days(Days::new(config.plausible_future_days));
    let earliest =
        today.checked_sub_months(Months::new(config.plausible_past_years.saturating_mul(12)));
    if latest.is_some_and(|latest| date > latest) {
        return Some(AmbiguityFlag::TooFarFuture);
    }
    if earliest.is_some_and(|earliest| date < earliest) {
        return Some(AmbiguityFlag::TooFarPast);
    }
    None
}

/// HIGH only when every applied rule has a sampled rate at or above the
/// configured threshold. An unsampled rule caps the result at MEDIUM.
fn correction_confidence(
    rules_applied: &[String],
    snapshot: &RuleSnapshot,
    config: &EngineConfig,
) -> Confidence {
    let mut lowest = 1.0_f64;
    for id in rules_applied {
        match snapshot.get(id).and_then(|entry| entry.sampled_rate) {
            Some(rate) => lowest = lowest.min(rate),
            None => return Confidence::Medium,
        }
    }
    if lowest >= config.high_confidence_threshold {
        Confidence::High
    } else {
        Confidence::Medium
    }
}

pub fn classify(
    outcome: &ParseOutcome,
    rules_applied: &[String],
    flagged_by: &[String],
    snapshot: &RuleSnapshot,
    config: &EngineConfig,
) -> Classification {
    let state = state_for(outcome, flagged_by);
    let (issue, warning_level, action_required, confidence) = match state {
        ClassifierState::Unparseable => (
            DateIssue::Unparseable,
            WarningLevel::Error,
            ActionRequired::ImmediateReview,
            Confidence::Low,
        ),
        ClassifierState::Incomplete => (
            DateIssue::Incomplete,
            WarningLevel::Warning,
            ActionRequired::ManualReview,
            Confidence::Low,
        ),
        ClassifierState::MalformedTime => (
            DateIssue::MalformedTime,
            WarningLevel::Warning,
            ActionRequired::ManualReview,
            Confidence::Medium,
        ),
        ClassifierState::Ambiguous => (
            DateIssue::Ambiguous,
            WarningLevel::Warning,
            ActionRequired::ManualReview,
            Confidence::Low,
        ),
        ClassifierState::OcrPattern => (
            DateIssue::OcrPattern,
            WarningLevel::Warning,
            ActionRequired::ManualReview,
            Confidence::Medium,
        ),
        ClassifierState::Resolved => (
            DateIssue::Ok,
            WarningLevel::Info,
            ActionRequired::None,
            correction_confidence(rules_applied, snapshot, config),
        ),
    };
    Classification {
        state,
        issue,
        warning_level,
        action_required,
        confidence,
    }
}
