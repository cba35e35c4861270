use chrono::{Datelike, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::ReviewError;
use crate::model::{
    ActionRequired, AmbiguityFlag, Confidence, DateIssue, FragmentInput, PartialDate,
    ResolutionSource, ReviewAction, ValidationResult, WarningLevel,
};

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionSource {
    /// The corrector produced a full date for an incomplete fragment.
    Correction,
    /// Neighbouring transactions share the fragment's month and year.
    Context,
    Learned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub date: NaiveDate,
    pub confidence: f64,
    pub source: SuggestionSource,
    pub detail: String,
    /// Learned rule whose output this is, if any.
    #[serde(default)]
    pub rule_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewCandidate {
    pub candidate_id: String,
    /// Position of the fragment in its batch.
    pub index: usize,
    pub result: ValidationResult,
    pub context: Vec<NaiveDate>,
    pub suggestions: Vec<Suggestion>,
    pub closed_by: Option<ReviewAction>,
}

impl ReviewCandidate {
    /// `None` when the result needs no human attention.
    pub fn from_result(
        index: usize,
        result: &ValidationResult,
        context: &[NaiveDate],
    ) -> Option<Self> {
        if !result.needs_review() {
            return None;
        }
        let mut candidate = Self {
            candidate_id: Uuid::new_v4().to_string(),
            index,
            result: result.clone(),
            context: context.to_vec(),
            suggestions: Vec::new(),
            closed_by: None,
        };
        if let Some(date) = result.withheld_date {
            candidate.push_suggestion(Suggestion {
                date,
                confidence: 0.5,
                source: SuggestionSource::Correction,
                detail: format!("corrected to {:?}", result.corrected_fragment),
                rule_id: None,
            });
        }
        for s in context_suggestions(result, context) {
            candidate.push_suggestion(s);
        }
        Some(candidate)
    }

    pub fn is_open(&self) -> bool {
        self.closed_by.is_none()
    }

    /// Keeps one suggestion per date, the most confident one.
    pub fn push_suggestion(&mut self, suggestion: Suggestion) {
        match self
            .suggestions
            .iter_mut()
            .find(|s| s.date == suggestion.date)
        {
            Some(existing) if existing.confidence < suggestion.confidence => *existing = suggestion,
            Some(_) => {}
            None => self.suggestions.push(suggestion),
        }
    }
}

/// For a fragment missing only its day, neighbours in the same month and
/// year hint at a day. The hint is the earliest such neighbour and is never
/// applied on its own.
fn context_suggestions(result: &ValidationResult, context: &[NaiveDate]) -> Vec<Suggestion> {
    if result.ambiguity_flags != [AmbiguityFlag::MissingDay] || context.is_empty() {
        return Vec::new();
    }
    let Some(PartialDate {
        year: Some(year),
        month: Some(month),
        ..
    }) = result.partial
    else {
        return Vec::new();
    };
    let in_month = context
        .iter()
        .filter(|d| d.year() == year && d.month() == month)
        .collect::<Vec<_>>();
    let Some(earliest) = in_month.iter().min().copied() else {
        return Vec::new();
    };
    let share = in_month.len() as f64 / context.len() as f64;
    vec![Suggestion {
        date: *earliest,
        confidence: share * 0.5,
        source: SuggestionSource::Context,
        detail: format!(
            "{} of {} neighbouring dates fall in {year}-{month:02}",
            in_month.len(),
            context.len()
        ),
        rule_id: None,
    }]
}

/// Builds candidates for every result that needs review. `inputs` supplies
/// the context for each index.
pub fn candidates_from_results(
    results: &[ValidationResult],
    inputs: &[FragmentInput],
) -> Vec<ReviewCandidate> {
    results
        .iter()
        .enumerate()
        .filter_map(|(idx, result)| {
            let context = inputs
                .get(idx)
                .map(|i| i.context.as_slice())
                .unwrap_or_default();
            ReviewCandidate::from_result(idx, result, context)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Closed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
            Self::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub decision_id: String,
    pub session_id: String,
    pub candidate_id: String,
    pub action: ReviewAction,
    pub corrected_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub decided_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionRequest {
    pub action: Option<String>,
    pub corrected_date: Option<String>,
    pub notes: Option<String>,
}

impl DecisionRequest {
    pub fn new(action: ReviewAction) -> Self {
        Self {
            action: Some(action.as_str().to_string()),
            ..Self::default()
        }
    }

    pub fn modify(date: &str) -> Self {
        Self {
            action: Some(ReviewAction::Modify.as_str().to_string()),
            corrected_date: Some(date.to_string()),
            notes: None,
        }
    }
}

pub fn parse_review_date(raw: &str) -> Result<NaiveDate, ReviewError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| ReviewError::InvalidDate {
        value: raw.to_string(),
    })
}

fn resolve_action(raw: Option<&str>) -> Result<ReviewAction, ReviewError> {
    let raw = raw.map(str::trim).unwrap_or_default();
    ReviewAction::parse(raw).ok_or_else(|| ReviewError::InvalidAction {
        value: raw.to_string(),
    })
}

fn resolve_notes(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub total: usize,
    pub reviewed: usize,
    pub pending: usize,
    pub completion_rate: f64,
    pub action_breakdown: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSession {
    pub session_id: String,
    pub created_at: String,
    pub status: SessionStatus,
    pub closed_at: Option<String>,
    pub candidates: Vec<ReviewCandidate>,
    /// Append-only, in decision order.
    pub decisions: Vec<ReviewDecision>,
}

pub fn open_session(candidates: Vec<ReviewCandidate>) -> ReviewSession {
    ReviewSession::open(candidates)
}

impl ReviewSession {
    pub fn open(candidates: Vec<ReviewCandidate>) -> Self {
        let mut session = Self {
            session_id: Uuid::new_v4().to_string(),
            created_at: now_rfc3339(),
            status: SessionStatus::InProgress,
            closed_at: None,
            candidates,
            decisions: Vec::new(),
        };
        session.close_if_complete();
        session
    }

    pub fn candidate(&self, candidate_id: &str) -> Option<&ReviewCandidate> {
        self.candidates
            .iter()
            .find(|c| c.candidate_id == candidate_id)
    }

    /// Applies one decision. On error nothing in the session changes.
    pub fn decide(
        &mut self,
        candidate_id: &str,
        request: &DecisionRequest,
    ) -> Result<ValidationResult, ReviewError> {
        if self.status != SessionStatus::InProgress {
            return Err(ReviewError::SessionClosed {
                session_id: self.session_id.clone(),
            });
        }
        let pos = self
            .candidates
            .iter()
            .position(|c| c.candidate_id == candidate_id)
            .ok_or_else(|| ReviewError::CandidateNotFound {
                session_id: self.session_id.clone(),
                candidate_id: candidate_id.to_string(),
            })?;
        let candidate = &self.candidates[pos];
        if let Some(action) = candidate.closed_by {
            return Err(ReviewError::Conflict {
                candidate_id: candidate_id.to_string(),
                action,
            });
        }

        let action = resolve_action(request.action.as_deref())?;
        let corrected_date = match request.corrected_date.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(parse_review_date(raw)?),
            _ => None,
        };
        let updated = decided_result(&candidate.result, candidate_id, action, corrected_date)?;

        self.decisions.push(ReviewDecision {
            decision_id: Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            candidate_id: candidate_id.to_string(),
            action,
            corrected_date: match action {
                ReviewAction::Modify => corrected_date,
                ReviewAction::Approve => updated.resolved_date,
                _ => None,
            },
            notes: resolve_notes(request.notes.as_deref()),
            decided_at: now_rfc3339(),
        });
        let candidate = &mut self.candidates[pos];
        if action != ReviewAction::Skip {
            candidate.result = updated.clone();
            candidate.closed_by = Some(action);
        }
        self.close_if_complete();
        Ok(updated)
    }

    fn close_if_complete(&mut self) {
        if self.status == SessionStatus::InProgress
            && self.candidates.iter().all(|c| !c.is_open())
        {
            self.status = SessionStatus::Closed;
            self.closed_at = Some(now_rfc3339());
        }
    }

    /// Ends the session without deciding what is still open.
    pub fn abandon(&mut self) {
        if self.status == SessionStatus::InProgress {
            self.status = SessionStatus::Abandoned;
            self.closed_at = Some(now_rfc3339());
        }
    }

    /// Hands the open candidates to a later session and abandons this one,
    /// so each carried candidate can only be decided in its new session.
    /// Returns nothing once the session is no longer in progress.
    pub fn carry_over(&mut self) -> Vec<ReviewCandidate> {
        if self.status != SessionStatus::InProgress {
            return Vec::new();
        }
        let carried = self
            .candidates
            .iter()
            .filter(|c| c.is_open())
            .cloned()
            .collect();
        self.abandon();
        carried
    }

    pub fn audit_trail(&self) -> &[ReviewDecision] {
        &self.decisions
    }

    pub fn summary(&self) -> ReviewSummary {
        let total = self.candidates.len();
        let reviewed = self.candidates.iter().filter(|c| !c.is_open()).count();
        let mut action_breakdown = BTreeMap::new();
        for d in &self.decisions {
            *action_breakdown
                .entry(d.action.as_str().to_string())
                .or_insert(0) += 1;
        }
        ReviewSummary {
            session_id: self.session_id.clone(),
            status: self.status,
            total,
            reviewed,
            pending: total - reviewed,
            completion_rate: if total == 0 {
                1.0
            } else {
                reviewed as f64 / total as f64
            },
            action_breakdown,
        }
    }
}

fn decided_result(
    current: &ValidationResult,
    candidate_id: &str,
    action: ReviewAction,
    corrected_date: Option<NaiveDate>,
) -> Result<ValidationResult, ReviewError> {
    let mut next = current.clone();
    match action {
        ReviewAction::Approve => {
            let Some(date) = current.resolved_date else {
                return Err(ReviewError::NothingToApprove {
                    candidate_id: candidate_id.to_string(),
                });
            };
            next.resolved_date = Some(date);
            next.confidence = Confidence::High;
            next.issue = DateIssue::Ok;
            next.warning_level = WarningLevel::Info;
            next.action_required = ActionRequired::None;
            next.source = ResolutionSource::Approved;
        }
        ReviewAction::Modify => {
            let Some(date) = corrected_date else {
                return Err(ReviewError::MissingCorrectedDate {
                    candidate_id: candidate_id.to_string(),
                });
            };
            next.resolved_date = Some(date);
            next.confidence = Confidence::High;
            next.issue = DateIssue::Ok;
            next.warning_level = WarningLevel::Info;
            next.action_required = ActionRequired::None;
            next.source = ResolutionSource::Manual;
        }
        ReviewAction::Reject => {
            next.resolved_date = None;
            next.resolved_time = None;
            next.warning_level = WarningLevel::Error;
            next.confidence = Confidence::Low;
            next.action_required = ActionRequired::None;
            next.source = ResolutionSource::Rejected;
            next.not_auto_correctable = true;
        }
        ReviewAction::Skip => {}
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::pipeline::{validate_fragment, NoopObserver};
    use crate::rules_store::RuleStore;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
    }

    fn session_for(fragments: &[&str]) -> ReviewSession {
        let store = RuleStore::seeded().expect("seed");
        let cfg = EngineConfig::default();
        let snapshot = store.snapshot(&cfg);
        let results = fragments
            .iter()
            .enumerate()
            .map(|(i, f)| validate_fragment(&snapshot, &cfg, f, i, &NoopObserver))
            .collect::<Vec<_>>();
        let inputs = fragments
            .iter()
            .map(|f| FragmentInput::new(*f))
            .collect::<Vec<_>>();
        open_session(candidates_from_results(&results, &inputs))
    }

    #[test]
    fn only_results_needing_review_become_candidates() {
        let session = session_for(&["23 Feb 2025", "Feb 2025", "13:45:67"]);
        assert_eq!(session.candidates.len(), 2);
        assert_eq!(session.candidates[0].index, 1);
        assert_eq!(session.status, SessionStatus::InProgress);
    }

    #[test]
    fn modify_resolves_with_manual_source() {
        let mut session = session_for(&["Feb 2025"]);
        let id = session.candidates[0].candidate_id.clone();
        let updated = session
            .decide(&id, &DecisionRequest::modify("2025-02-15"))
            .expect("modify");
        assert_eq!(updated.resolved_date, Some(ymd(2025, 2, 15)));
        assert_eq!(updated.confidence, Confidence::High);
        assert_eq!(updated.source, ResolutionSource::Manual);
        assert_eq!(updated.issue, DateIssue::Ok);
        assert_eq!(session.status, SessionStatus::Closed);
        assert_eq!(session.audit_trail().len(), 1);
        assert_eq!(session.audit_trail()[0].corrected_date, Some(ymd(2025, 2, 15)));
    }

    #[test]
    fn redeciding_a_closed_candidate_conflicts() {
        let mut session = session_for(&["Feb 2025", "24 2025"]);
        let id = session.candidates[0].candidate_id.clone();
        session
            .decide(&id, &DecisionRequest::new(ReviewAction::Reject))
            .expect("reject");
        let err = session
            .decide(&id, &DecisionRequest::modify("2025-02-01"))
            .expect_err("second decision must conflict");
        assert!(matches!(err, ReviewError::Conflict { action: ReviewAction::Reject, .. }));
        assert_eq!(session.audit_trail().len(), 1);
        let rejected = &session.candidates[0].result;
        assert_eq!(rejected.resolved_date, None);
        assert_eq!(rejected.warning_level, WarningLevel::Error);
        assert!(rejected.not_auto_correctable);
    }

    #[test]
    fn failed_calls_leave_session_untouched() {
        let mut session = session_for(&["Feb 2025"]);
        let id = session.candidates[0].candidate_id.clone();
        let before = session.clone();

        let err = session
            .decide(&id, &DecisionRequest::new(ReviewAction::Approve))
            .expect_err("nothing to approve");
        assert!(matches!(err, ReviewError::NothingToApprove { .. }));
        let err = session
            .decide(&id, &DecisionRequest::modify("2025-02-30"))
            .expect_err("invalid date");
        assert!(matches!(err, ReviewError::InvalidDate { .. }));
        let err = session
            .decide(&id, &DecisionRequest::new(ReviewAction::Modify))
            .expect_err("missing date");
        assert!(matches!(err, ReviewError::MissingCorrectedDate { .. }));
        let err = session
            .decide("nope", &DecisionRequest::new(ReviewAction::Skip))
            .expect_err("unknown candidate");
        assert!(matches!(err, ReviewError::CandidateNotFound { .. }));

        assert_eq!(session, before);
    }

    #[test]
    fn approve_accepts_the_best_guess() {
        let mut session = session_for(&["2025 Feb 23 09:05 38"]);
        let id = session.candidates[0].candidate_id.clone();
        let updated = session
            .decide(&id, &DecisionRequest::new(ReviewAction::Approve))
            .expect("approve");
        assert_eq!(updated.resolved_date, Some(ymd(2025, 2, 23)));
        assert_eq!(updated.source, ResolutionSource::Approved);
        assert_eq!(updated.action_required, ActionRequired::None);
    }

    #[test]
    fn skip_keeps_candidate_open_and_is_audited() {
        let mut session = session_for(&["Feb 2025", "24 2025"]);
        let first = session.candidates[0].candidate_id.clone();
        let second = session.candidates[1].candidate_id.clone();
        session
            .decide(&first, &DecisionRequest::new(ReviewAction::Skip))
            .expect("skip");
        session
            .decide(&second, &DecisionRequest::modify("2025-03-24"))
            .expect("modify");
        assert_eq!(session.status, SessionStatus::InProgress);
        assert_eq!(session.audit_trail().len(), 2);

        let summary = session.summary();
        assert_eq!((summary.reviewed, summary.pending), (1, 1));
        assert_eq!(summary.completion_rate, 0.5);
        assert_eq!(summary.action_breakdown.get("skip"), Some(&1));

        session.abandon();
        assert_eq!(session.status, SessionStatus::Abandoned);
        let err = session
            .decide(&first, &DecisionRequest::modify("2025-02-01"))
            .expect_err("abandoned session");
        assert!(matches!(err, ReviewError::SessionClosed { .. }));
        assert!(session.carry_over().is_empty());
    }

    #[test]
    fn carried_candidates_are_decided_only_in_the_new_session() {
        let mut old = session_for(&["Feb 2025", "24 2025"]);
        let first = old.candidates[0].candidate_id.clone();
        let second = old.candidates[1].candidate_id.clone();
        old.decide(&second, &DecisionRequest::modify("2025-03-24"))
            .expect("modify");

        let carried = old.carry_over();
        assert_eq!(carried.len(), 1);
        assert_eq!(carried[0].candidate_id, first);
        assert_eq!(old.status, SessionStatus::Abandoned);

        let mut new = ReviewSession::open(carried);
        new.decide(&first, &DecisionRequest::modify("2025-02-01"))
            .expect("decide in new session");
        let err = old
            .decide(&first, &DecisionRequest::modify("2025-02-02"))
            .expect_err("old copy is closed");
        assert!(matches!(err, ReviewError::SessionClosed { .. }));
        assert_eq!(old.audit_trail().len(), 1);
        assert_eq!(new.audit_trail().len(), 1);
    }

    #[test]
    fn context_in_one_month_becomes_a_suggestion() {
        let store = RuleStore::seeded().expect("seed");
        let cfg = EngineConfig::default();
        let result = validate_fragment(&store.snapshot(&cfg), &cfg, "Feb 2025", 0, &NoopObserver);
        let context = vec![ymd(2025, 2, 20), ymd(2025, 2, 14), ymd(2025, 3, 1)];
        let candidate = ReviewCandidate::from_result(0, &result, &context).expect("candidate");
        assert_eq!(candidate.result.resolved_date, None);
        assert_eq!(candidate.suggestions.len(), 1);
        assert_eq!(candidate.suggestions[0].date, ymd(2025, 2, 14));
        assert_eq!(candidate.suggestions[0].source, SuggestionSource::Context);
    }
}
