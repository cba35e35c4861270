use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::classifier::{classify, plausibility_flag, Classification};
use crate::config::EngineConfig;
use crate::corrector::{self, Correction};
use crate::date_parser;
use crate::model::{
    AmbiguityFlag, FragmentInput, ParseOutcome, ResolutionSource, ValidationResult,
    WarningLevel,
};
use crate::rules_store::RuleSnapshot;

/// One event per pipeline stage for one fragment.
#[derive(Debug)]
pub enum StageEvent<'a> {
    Corrected {
        index: usize,
        correction: &'a Correction,
    },
    Parsed {
        index: usize,
        text: &'a str,
        outcome: &'a ParseOutcome,
    },
    Classified {
        index: usize,
        classification: &'a Classification,
        result: &'a ValidationResult,
    },
}

/// Subscriber for per-stage events. Called from rayon workers, so
/// implementations must be `Sync`.
pub trait PipelineObserver: Sync {
    fn on_stage(&self, event: &StageEvent<'_>);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {
    fn on_stage(&self, _event: &StageEvent<'_>) {}
}

/// Forwards stage events to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_stage(&self, event: &StageEvent<'_>) {
        match event {
            StageEvent::Corrected { index, correction } => debug!(
                index,
                cleaned = %correction.cleaned,
                corrected = %correction.corrected,
                rules = ?correction.rules_applied,
                flagged = ?correction.flagged_rules,
                "stage corrected"
            ),
            StageEvent::Parsed {
                index,
                text,
                outcome,
            } => debug!(
                index,
                text = %text,
                format = ?outcome.matched_format,
                resolved = ?outcome.resolved_date,
                flags = ?outcome.ambiguity_flags,
                "stage parsed"
            ),
            StageEvent::Classified {
                index,
                classification,
                ..
            } => debug!(
                index,
                state = ?classification.state,
                confidence = ?classification.confidence,
                "stage classified"
            ),
        }
    }
}

/// Runs one fragment through Corrector, Parser and Classifier.
///
/// The only shared state touched is the atomic counter pair on each rule in
/// `snapshot`. A fragment whose cleaned original is an incomplete shape stays
/// INCOMPLETE even when a rule turned it into a full date; that date is
/// kept in `withheld_date` for the reviewer and earns the rule no success.
/// Parsed dates outside the plausibility window get an advisory flag that
/// leaves the classification alone.
pub fn validate_fragment(
    snapshot: &RuleSnapshot,
    config: &EngineConfig,
    raw: &str,
    index: usize,
    observer: &dyn PipelineObserver,
) -> ValidationResult {
    let correction = corrector::apply(snapshot, raw, config.max_correction_passes);
    observer.on_stage(&StageEvent::Corrected {
        index,
        correction: &correction,
    });

    let corrected_outcome = date_parser::parse(&correction.corrected);
    observer.on_stage(&StageEvent::Parsed {
        index,
        text: &correction.corrected,
        outcome: &corrected_outcome,
    });

    // Rules are judged by what their output parses to, not by the final
    // issue: "Feb2025" -> "Feb 2025" is a good repair that still ends
    // INCOMPLETE.
    let output_recognized =
        corrected_outcome.resolved_date.is_some() || corrected_outcome.is_incomplete_shape();
    let mut withheld_date = None;
    let outcome = if correction.rules_applied.is_empty() {
        corrected_outcome
    } else {
        let original_outcome = date_parser::parse(&correction.cleaned);
        if original_outcome.is_incomplete_shape() {
            withheld_date = corrected_outcome.resolved_date;
            original_outcome
        } else {
            corrected_outcome
        }
    };

    let classification = classify(
        &outcome,
        &correction.rules_applied,
        &correction.flagged_rules,
        snapshot,
        config,
    );

    let mut ambiguity_flags = outcome.ambiguity_flags.clone();
    if let Some(flag) = outcome
        .resolved_date
        .and_then(|date| plausibility_flag(date, config))
    {
        ambiguity_flags.push(flag);
    }

    let source = match (outcome.resolved_date, correction.rules_applied.is_empty()) {
        (None, _) => ResolutionSource::Unresolved,
        (Some(_), true) => ResolutionSource::Parser,
        (Some(_), false) => ResolutionSource::Corrected,
    };
    let result = ValidationResult {
        raw_fragment: raw.to_string(),
        corrected_fragment: correction.corrected.clone(),
        resolved_date: outcome.resolved_date,
        resolved_time: outcome.resolved_time,
        warning_level: classification.warning_level,
        issue: classification.issue,
        confidence: classification.confidence,
        action_required: classification.action_required,
        rules_applied: correction.rules_applied.clone(),
        flagged_by: correction.flagged_rules.clone(),
        matched_format: outcome.matched_format.clone(),
        ambiguity_flags,
        partial: outcome.partial,
        withheld_date,
        source,
        not_auto_correctable: false,
    };

    if output_recognized && withheld_date.is_none() {
        let mut credited = Vec::<&str>::new();
        for id in &result.rules_applied {
            if credited.contains(&id.as_str()) {
                continue;
            }
            if let Some(entry) = snapshot.get(id) {
                entry.rule.record_success();
            }
            credited.push(id.as_str());
        }
    }

    observer.on_stage(&StageEvent::Classified {
        index,
        classification: &classification,
        result: &result,
    });
    result
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub info: usize,
    pub warning: usize,
    pub error: usize,
    pub by_issue: BTreeMap<String, usize>,
    pub corrected: usize,
    pub needs_review: usize,
    pub truncated_time: usize,
    pub implausible: usize,
}

impl BatchSummary {
    pub fn from_results(results: &[ValidationResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for r in results {
            match r.warning_level {
                WarningLevel::Info => summary.info += 1,
                WarningLevel::Warning => summary.warning += 1,
                WarningLevel::Error => summary.error += 1,
            }
            *summary
                .by_issue
                .entry(r.issue.as_str().to_string())
                .or_insert(0) += 1;
            if !r.rules_applied.is_empty() {
                summary.corrected += 1;
            }
            if r.needs_review() {
                summary.needs_review += 1;
            }
            if r.ambiguity_flags.contains(&AmbiguityFlag::TruncatedTime) {
                summary.truncated_time += 1;
            }
            if r.ambiguity_flags.iter().any(|f| {
                matches!(f, AmbiguityFlag::TooFarFuture | AmbiguityFlag::TooFarPast)
            }) {
                summary.implausible += 1;
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub results: Vec<ValidationResult>,
    pub summary: BatchSummary,
}

/// Evaluates every fragment in parallel against one snapshot. Results keep
/// input order.
pub fn validate_batch(
    snapshot: &RuleSnapshot,
    config: &EngineConfig,
    inputs: &[FragmentInput],
    observer: &dyn PipelineObserver,
) -> BatchReport {
    let results = inputs
        .par_iter()
        .enumerate()
        .map(|(index, input)| validate_fragment(snapshot, config, &input.raw, index, observer))
        .collect::<Vec<_>>();
    let summary = BatchSummary::from_results(&results);
    BatchReport { results, summary }
}
