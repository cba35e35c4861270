use serde::Serialize;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{EngineResult, ReviewError};
use crate::learning::{LearningEngine, LearningSummary, PatternStats};
use crate::model::{DateIssue, FragmentInput, ReviewAction, ValidationResult, WarningLevel};
use crate::pipeline::{validate_batch, BatchReport, NoopObserver, PipelineObserver};
use crate::review::{candidates_from_results, DecisionRequest, ReviewCandidate, ReviewSession};
use crate::rules_store::RuleStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingStats {
    pub total_processed: u64,
    pub auto_corrected: u64,
    pub flagged_review: u64,
    pub flagged_critical: u64,
    pub manually_reviewed: u64,
    pub learning_updates: u64,
    pub rules_promoted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingSummary {
    pub stats: ProcessingStats,
    pub auto_correction_rate: f64,
    pub review_rate: f64,
    pub critical_rate: f64,
    pub rule_count: usize,
    pub learned_rule_count: usize,
    pub learning: LearningSummary,
}

/// What one review call changed beyond the candidate itself.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub result: ValidationResult,
    pub action: ReviewAction,
    pub credited_rules: Vec<String>,
    pub promoted_rules: Vec<String>,
}

/// Owns the rule set and the learning state across batches and review
/// sessions.
pub struct DateProcessor {
    config: EngineConfig,
    rules: RuleStore,
    learning: LearningEngine,
    observer: Box<dyn PipelineObserver + Send>,
    stats: ProcessingStats,
}

impl DateProcessor {
    pub fn new(config: EngineConfig, rules: RuleStore) -> EngineResult<Self> {
        config.validate()?;
        let learning = LearningEngine::new(&config);
        Ok(Self {
            config,
            rules,
            learning,
            observer: Box::new(NoopObserver),
            stats: ProcessingStats::default(),
        })
    }

    pub fn with_learning(mut self, patterns: Vec<PatternStats>) -> Self {
        self.learning = LearningEngine::with_patterns(&self.config, patterns);
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn PipelineObserver + Send>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn learning(&self) -> &LearningEngine {
        &self.learning
    }

    pub fn stats(&self) -> &ProcessingStats {
        &self.stats
    }

    /// Validates a batch against a snapshot of the current rules and opens a
    /// review session when anything needs attention.
    pub fn process_batch(&mut self, inputs: &[FragmentInput]) -> (BatchReport, Option<ReviewSession>) {
        let snapshot = self.rules.snapshot(&self.config);
        let report = validate_batch(&snapshot, &self.config, inputs, self.observer.as_ref());

        self.stats.total_processed += report.summary.total as u64;
        for r in &report.results {
            match r.warning_level {
                WarningLevel::Warning => self.stats.flagged_review += 1,
                WarningLevel::Error => self.stats.flagged_critical += 1,
                WarningLevel::Info => {}
            }
            if r.issue == DateIssue::Ok && !r.rules_applied.is_empty() {
                self.stats.auto_corrected += 1;
            }
        }

        let mut candidates = candidates_from_results(&report.results, inputs);
        for candidate in &mut candidates {
            self.attach_learned_suggestions(candidate);
        }
        let session = (!candidates.is_empty()).then(|| ReviewSession::open(candidates));
        (report, session)
    }

    fn attach_learned_suggestions(&self, candidate: &mut ReviewCandidate) {
        for s in self
            .learning
            .suggest(&candidate.result.raw_fragment, self.rules.rules())
        {
            candidate.push_suggestion(s);
        }
    }

    /// Moves the open candidates of `previous` into a new session with
    /// fresh learned suggestions. `previous` ends abandoned.
    pub fn reopen(&self, previous: &mut ReviewSession) -> Option<ReviewSession> {
        let mut carried = previous.carry_over();
        if carried.is_empty() {
            return None;
        }
        for candidate in &mut carried {
            self.attach_learned_suggestions(candidate);
        }
        Some(ReviewSession::open(carried))
    }

    /// Applies a review decision, then feeds it back into rule counters and
    /// the learning engine. Newly promoted rules join the store immediately.
    pub fn decide(
        &mut self,
        session: &mut ReviewSession,
        candidate_id: &str,
        request: &DecisionRequest,
    ) -> Result<DecisionOutcome, ReviewError> {
        let before = session
            .candidate(candidate_id)
            .map(|c| (c.result.clone(), c.suggestions.clone()));
        let updated = session.decide(candidate_id, request)?;
        let action = session
            .decisions
            .last()
            .map(|d| d.action)
            .unwrap_or(ReviewAction::Skip);
        let Some((before_result, suggestions)) = before else {
            return Ok(DecisionOutcome {
                result: updated,
                action,
                credited_rules: Vec::new(),
                promoted_rules: Vec::new(),
            });
        };

        // Annotation-only flag rules were right whenever the reviewer had
        // to change or reject the fragment. Rules that offered a date are
        // credited only when the reviewer picked that date.
        let offers_date = |id: &str| suggestions.iter().any(|s| s.rule_id.as_deref() == Some(id));
        let mut confirmed = Vec::<&str>::new();
        match (action, updated.resolved_date) {
            (ReviewAction::Modify, Some(date)) => {
                confirmed.extend(
                    suggestions
                        .iter()
                        .filter(|s| s.date == date)
                        .filter_map(|s| s.rule_id.as_deref()),
                );
                confirmed.extend(
                    before_result
                        .flagged_by
                        .iter()
                        .map(String::as_str)
                        .filter(|id| !offers_date(*id)),
                );
                self.learning.observe(&before_result.raw_fragment, date);
                self.stats.learning_updates += 1;
            }
            (ReviewAction::Approve, Some(date)) => {
                self.learning.observe(&before_result.raw_fragment, date);
                self.stats.learning_updates += 1;
            }
            (ReviewAction::Reject, _) => {
                confirmed.extend(
                    before_result
                        .flagged_by
                        .iter()
                        .map(String::as_str)
                        .filter(|id| !offers_date(*id)),
                );
                self.learning.observe_rejection(&before_result.raw_fragment);
                self.stats.learning_updates += 1;
            }
            _ => {}
        }
        let credited_rules = self.credit_rules(&before_result, &confirmed);
        if action != ReviewAction::Skip {
            self.stats.manually_reviewed += 1;
        }

        let mut promoted_rules = Vec::new();
        for rule in self.learning.promote() {
            let id = rule.id().to_string();
            if self.rules.add(rule) {
                promoted_rules.push(id);
            }
        }
        self.stats.rules_promoted += promoted_rules.len() as u64;
        debug!(
            candidate_id,
            action = action.as_str(),
            credited = ?credited_rules,
            promoted = ?promoted_rules,
            "review decision applied"
        );

        Ok(DecisionOutcome {
            result: updated,
            action,
            credited_rules,
            promoted_rules,
        })
    }

    /// Adds one success per distinct rule. A rule that never saw the
    /// fragment, e.g. one promoted after the batch ran, is charged the
    /// attempt first so its counters stay consistent.
    fn credit_rules(&self, before: &ValidationResult, ids: &[&str]) -> Vec<String> {
        let mut credited = Vec::<String>::new();
        for id in ids {
            if credited.iter().any(|c| c == id) {
                continue;
            }
            let Some(rule) = self.rules.get(id) else {
                continue;
            };
            let saw_fragment = before.flagged_by.iter().any(|f| f == id)
                || before.rules_applied.iter().any(|a| a == id);
            if !saw_fragment {
                rule.record_attempt();
            }
            if rule.record_success() {
                credited.push(id.to_string());
            }
        }
        credited
    }

    pub fn processing_summary(&self) -> ProcessingSummary {
        let total = self.stats.total_processed;
        let rate = |n: u64| {
            if total == 0 {
                0.0
            } else {
                n as f64 / total as f64
            }
        };
        ProcessingSummary {
            stats: self.stats.clone(),
            auto_correction_rate: rate(self.stats.auto_corrected),
            review_rate: rate(self.stats.flagged_review + self.stats.flagged_critical),
            critical_rate: rate(self.stats.flagged_critical),
            rule_count: self.rules.len(),
            learned_rule_count: self
                .rules
                .rules()
                .iter()
                .filter(|r| r.origin() == crate::model::RuleOrigin::Learned)
                .count(),
            learning: self.learning.summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Confidence, ResolutionSource, RuleCategory};
    use crate::review::SuggestionSource;
    use chrono::NaiveDate;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
    }

    fn processor() -> DateProcessor {
        DateProcessor::new(EngineConfig::default(), RuleStore::seeded().expect("seed"))
            .expect("processor")
    }

    fn review_one(p: &mut DateProcessor, raw: &str, request: DecisionRequest) -> DecisionOutcome {
        let (_, session) = p.process_batch(&[FragmentInput::new(raw)]);
        let mut session = session.expect("candidate");
        let id = session.candidates[0].candidate_id.clone();
        p.decide(&mut session, &id, &request).expect("decide")
    }

    #[test]
    fn modify_month_year_then_learn_day_one() {
        let mut p = processor();
        let first = review_one(&mut p, "Feb 2025", DecisionRequest::modify("2025-02-15"));
        assert_eq!(first.result.resolved_date, Some(ymd(2025, 2, 15)));
        assert_eq!(first.result.confidence, Confidence::High);
        assert_eq!(first.result.source, ResolutionSource::Manual);
        assert!(first.promoted_rules.is_empty());

        let mut promoted = Vec::new();
        for (raw, date) in [
            ("Mar 2025", "2025-03-01"),
            ("Apr 2025", "2025-04-01"),
            ("May 2025", "2025-05-01"),
        ] {
            let outcome = review_one(&mut p, raw, DecisionRequest::modify(date));
            promoted.extend(outcome.promoted_rules);
        }
        assert!(promoted.is_empty(), "3 of 4 agree, below 0.8");

        let outcome = review_one(&mut p, "Jun 2025", DecisionRequest::modify("2025-06-01"));
        assert_eq!(outcome.promoted_rules.len(), 1);
        let rule = p.rules().get(&outcome.promoted_rules[0]).expect("promoted");
        assert_eq!(rule.category(), RuleCategory::FlagReview);

        let (report, session) = p.process_batch(&[FragmentInput::new("Jul 2026")]);
        assert_eq!(report.results[0].issue, DateIssue::Incomplete);
        assert_eq!(report.results[0].resolved_date, None);
        let session = session.expect("still needs review");
        let suggestion = &session.candidates[0].suggestions[0];
        assert_eq!(suggestion.date, ymd(2026, 7, 1));
        assert_eq!(suggestion.source, SuggestionSource::Learned);
    }

    #[test]
    fn modify_matching_learned_suggestion_credits_rule() {
        let mut p = processor();
        for (raw, date) in [
            ("Jan 2025", "2025-01-01"),
            ("Feb 2025", "2025-02-01"),
            ("Mar 2025", "2025-03-01"),
        ] {
            review_one(&mut p, raw, DecisionRequest::modify(date));
        }
        assert_eq!(p.stats().rules_promoted, 1);
        let outcome = review_one(&mut p, "Aug 2026", DecisionRequest::modify("2026-08-01"));
        assert_eq!(outcome.credited_rules.len(), 1);
        let rule = p.rules().get(&outcome.credited_rules[0]).expect("rule");
        assert_eq!(rule.success_count(), 1);
    }

    #[test]
    fn approve_does_not_recount_a_credited_repair() {
        let mut p = processor();
        let (report, session) = p.process_batch(&[FragmentInput::new("2025 Feb 2310:00 48")]);
        assert_eq!(report.results[0].issue, DateIssue::MalformedTime);
        let rule = p.rules().get("day_glued_to_hour").expect("rule");
        assert_eq!((rule.success_count(), rule.attempt_count()), (1, 1));

        let mut session = session.expect("candidate");
        let id = session.candidates[0].candidate_id.clone();
        let outcome = p
            .decide(&mut session, &id, &DecisionRequest::new(ReviewAction::Approve))
            .expect("approve");
        assert!(outcome.credited_rules.is_empty());
        assert_eq!(outcome.result.resolved_date, Some(ymd(2025, 2, 23)));
        let rule = p.rules().get("day_glued_to_hour").expect("rule");
        assert_eq!((rule.success_count(), rule.attempt_count()), (1, 1));
    }

    #[test]
    fn seed_rules_stay_active_across_batches() {
        let mut p = processor();
        for _ in 0..7 {
            let (report, _) = p.process_batch(&[
                FragmentInput::new("Feb2025"),
                FragmentInput::new("2025 Feb 2310:00 48"),
                FragmentInput::new("2025 Feb 10:00 48"),
            ]);
            assert_eq!(report.results[0].corrected_fragment, "Feb 2025");
            assert_eq!(report.results[1].corrected_fragment, "2025 Feb 23 10:00 48");
            assert_eq!(
                report.results[2].flagged_by,
                vec!["time_in_day_slot".to_string(), "month_then_time".to_string()]
            );
        }
        let cfg = p.config().clone();
        for id in ["month_year_space", "day_glued_to_hour", "time_in_day_slot"] {
            let rule = p.rules().get(id).expect("rule");
            assert!(!rule.is_deprioritized(&cfg), "{id}");
        }

        let (report, _) = p.process_batch(&[FragmentInput::new("24Feb2025")]);
        assert_eq!(report.results[0].resolved_date, Some(ymd(2025, 2, 24)));
    }

    #[test]
    fn rejecting_a_flagged_fragment_credits_the_flag() {
        let mut p = processor();
        let outcome = review_one(
            &mut p,
            "2025 Feb 10:00 48",
            DecisionRequest::new(ReviewAction::Reject),
        );
        assert_eq!(
            outcome.credited_rules,
            vec!["time_in_day_slot".to_string(), "month_then_time".to_string()]
        );
        let rule = p.rules().get("time_in_day_slot").expect("rule");
        assert_eq!((rule.success_count(), rule.attempt_count()), (1, 1));
    }

    #[test]
    fn learned_rule_credited_after_reopen_survives_reload() {
        let mut p = processor();
        let inputs = ["Jan 2025", "Feb 2025", "Mar 2025", "Apr 2025"]
            .into_iter()
            .map(FragmentInput::new)
            .collect::<Vec<_>>();
        let (_, session) = p.process_batch(&inputs);
        let mut session = session.expect("session");
        let ids = session
            .candidates
            .iter()
            .map(|c| c.candidate_id.clone())
            .collect::<Vec<_>>();
        p.decide(&mut session, &ids[3], &DecisionRequest::new(ReviewAction::Skip))
            .expect("skip");
        for (id, date) in ids.iter().zip(["2025-01-01", "2025-02-01", "2025-03-01"]) {
            p.decide(&mut session, id, &DecisionRequest::modify(date))
                .expect("modify");
        }
        assert_eq!(p.stats().rules_promoted, 1);

        let mut next = p.reopen(&mut session).expect("one candidate carried");
        assert_eq!(session.status, crate::review::SessionStatus::Abandoned);
        let carried = next.candidates[0].candidate_id.clone();
        assert_eq!(carried, ids[3]);
        let outcome = p
            .decide(&mut next, &carried, &DecisionRequest::modify("2025-04-01"))
            .expect("modify carried");
        assert_eq!(outcome.credited_rules.len(), 1);
        let learned_id = outcome.credited_rules[0].clone();
        let rule = p.rules().get(&learned_id).expect("learned rule");
        assert_eq!((rule.success_count(), rule.attempt_count()), (1, 1));

        let path = std::env::temp_dir().join(format!("kw_rules_{}.csv", uuid::Uuid::new_v4()));
        p.rules().save_to_path(&path).expect("save");
        let reloaded = RuleStore::load_from_path(&path).expect("reload");
        assert!(reloaded.load_report().rejected.is_empty());
        for rule in reloaded.rules() {
            assert!(rule.success_count() <= rule.attempt_count(), "{}", rule.id());
        }
        assert!(reloaded.get(&learned_id).is_some());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn failed_decision_changes_nothing() {
        let mut p = processor();
        let (_, session) = p.process_batch(&[FragmentInput::new("Feb 2025")]);
        let mut session = session.expect("candidate");
        let id = session.candidates[0].candidate_id.clone();
        let err = p
            .decide(&mut session, &id, &DecisionRequest::new(ReviewAction::Approve))
            .expect_err("nothing to approve");
        assert!(matches!(err, ReviewError::NothingToApprove { .. }));
        assert!(session.decisions.is_empty());
        assert_eq!(p.stats().manually_reviewed, 0);
        assert_eq!(p.learning().summary().total_observations, 0);
    }

    #[test]
    fn summary_reports_rates() {
        let mut p = processor();
        let inputs = ["23 Feb 2025", "'24Feb 2025'", "Feb 2025", ""]
            .into_iter()
            .map(FragmentInput::new)
            .collect::<Vec<_>>();
        let (report, session) = p.process_batch(&inputs);
        assert_eq!(report.summary.total, 4);
        assert_eq!(session.expect("session").candidates.len(), 2);
        let summary = p.processing_summary();
        assert_eq!(summary.stats.total_processed, 4);
        assert_eq!(summary.stats.auto_corrected, 1);
        assert!((summary.auto_correction_rate - 0.25).abs() < 1e-9);
        assert!((summary.review_rate - 0.5).abs() < 1e-9);
    }
}
