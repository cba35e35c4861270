use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{EngineError, EngineResult};

const DEFAULT_MAX_CORRECTION_PASSES: usize = 3;
const DEFAULT_HIGH_CONFIDENCE_THRESHOLD: f64 = 0.90;
const DEFAULT_MIN_RULE_SAMPLE: u64 = 5;
const DEFAULT_DEPRIORITIZE_BELOW: f64 = 0.50;
const DEFAULT_PROMOTION_THRESHOLD: f64 = 0.80;
const DEFAULT_MINIMUM_SAMPLE_SIZE: u64 = 3;
const DEFAULT_SUGGESTION_THRESHOLD: f64 = 0.60;
const DEFAULT_PLAUSIBLE_FUTURE_DAYS: u64 = 365;
const DEFAULT_PLAUSIBLE_PAST_YEARS: u32 = 50;
const MAX_CORRECTION_PASSES_LIMIT: usize = 10;

/// Thresholds shared by the corrector, classifier and learning engine.
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_correction_passes: usize,
    /// An auto-correct rule must reach this sampled success rate before a
    /// fragment it repaired is reported with HIGH confidence.
    pub high_confidence_threshold: f64,
    /// Attempts a rule needs before its live success rate is trusted.
    pub min_rule_sample: u64,
    pub deprioritize_below: f64,
    pub promotion_threshold: f64,
    pub minimum_sample_size: u64,
    pub suggestion_threshold: f64,
    /// Dates later than this many days after `reference_date` are flagged.
    pub plausible_future_days: u64,
    /// Dates earlier than this many years before `reference_date` are flagged.
    pub plausible_past_years: u32,
    /// "Today" for the plausibility window. Unset means the current UTC date.
    pub reference_date: Option<NaiveDate>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_correction_passes: DEFAULT_MAX_CORRECTION_PASSES,
            high_confidence_threshold: DEFAULT_HIGH_CONFIDENCE_THRESHOLD,
            min_rule_sample: DEFAULT_MIN_RULE_SAMPLE,
            deprioritize_below: DEFAULT_DEPRIORITIZE_BELOW,
            promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,
            minimum_sample_size: DEFAULT_MINIMUM_SAMPLE_SIZE,
            suggestion_threshold: DEFAULT_SUGGESTION_THRESHOLD,
            plausible_future_days: DEFAULT_PLAUSIBLE_FUTURE_DAYS,
            plausible_past_years: DEFAULT_PLAUSIBLE_PAST_YEARS,
            reference_date: None,
        }
    }
}

fn check_rate(name: &str, v: f64) -> EngineResult<()> {
    if !(0.0..=1.0).contains(&v) {
        return Err(EngineError::Config(format!(
            "{name} must be within 0..=1, got {v}"
        )));
    }
    Ok(())
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(1..=MAX_CORRECTION_PASSES_LIMIT).contains(&self.max_correction_passes) {
            return Err(EngineError::Config(format!(
                "max_correction_passes must be within 1..={MAX_CORRECTION_PASSES_LIMIT}, got {}",
                self.max_correction_passes
            )));
        }
        check_rate("high_confidence_threshold", self.high_confidence_threshold)?;
        check_rate("deprioritize_below", self.deprioritize_below)?;
        check_rate("promotion_threshold", self.promotion_threshold)?;
        check_rate("suggestion_threshold", self.suggestion_threshold)?;
        if self.minimum_sample_size == 0 {
            return Err(EngineError::Config(
                "minimum_sample_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_json_str(raw: &str) -> EngineResult<Self> {
        let cfg: EngineConfig = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: &Path) -> EngineResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{"promotion_threshold": 0.75}"#)
            .expect("parse partial config");
        assert_eq!(cfg.promotion_threshold, 0.75);
        assert_eq!(cfg.max_correction_passes, 3);
        assert_eq!(cfg.minimum_sample_size, 3);
        assert_eq!(cfg.suggestion_threshold, 0.60);
        assert_eq!(cfg.plausible_future_days, 365);
        assert_eq!(cfg.reference_date, None);
    }

    #[test]
    fn rejects_rates_outside_unit_interval() {
        let err = EngineConfig::from_json_str(r#"{"high_confidence_threshold": 1.5}"#)
            .expect_err("rate above 1 must fail");
        assert!(err.to_string().contains("high_confidence_threshold"));
    }

    #[test]
    fn rejects_zero_correction_passes() {
        let cfg = EngineConfig {
            max_correction_passes: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }
}
