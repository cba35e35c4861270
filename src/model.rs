use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DateIssue {
    Ok,
    Unparseable,
    Incomplete,
    OcrPattern,
    MalformedTime,
    Ambiguous,
}

impl DateIssue {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Unparseable => "UNPARSEABLE",
            Self::Incomplete => "INCOMPLETE",
            Self::OcrPattern => "OCR_PATTERN",
            Self::MalformedTime => "MALFORMED_TIME",
            Self::Ambiguous => "AMBIGUOUS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionRequired {
    None,
    ManualReview,
    ImmediateReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleCategory {
    AutoCorrect,
    FlagReview,
}

impl RuleCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoCorrect => "AUTO_CORRECT",
            Self::FlagReview => "FLAG_REVIEW",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "AUTO_CORRECT" => Some(Self::AutoCorrect),
            "FLAG_REVIEW" => Some(Self::FlagReview),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOrigin {
    Seed,
    Learned,
}

impl RuleOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Learned => "learned",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "seed" => Some(Self::Seed),
            "learned" => Some(Self::Learned),
            _ => None,
        }
    }
}

/// Why the parser could not (or would not) commit to a single date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityFlag {
    MissingDay,
    MissingMonth,
    MissingYear,
    ConflictingOrder,
    TruncatedTime,
    OutOfRange,
    Empty,
    /// Resolved, but further ahead than the plausibility window allows.
    TooFarFuture,
    /// Resolved, but further back than the plausibility window allows.
    TooFarPast,
}

impl AmbiguityFlag {
    pub fn is_missing_field(self) -> bool {
        matches!(
            self,
            Self::MissingDay | Self::MissingMonth | Self::MissingYear
        )
    }
}

/// Fields recognized in an incomplete fragment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialDate {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseOutcome {
    pub resolved_date: Option<NaiveDate>,
    pub resolved_time: Option<NaiveTime>,
    pub matched_format: Option<String>,
    pub ambiguity_flags: Vec<AmbiguityFlag>,
    /// Other valid readings of the same digits, e.g. month-first.
    pub alternatives: Vec<NaiveDate>,
    pub partial: Option<PartialDate>,
}

impl ParseOutcome {
    pub fn has_flag(&self, flag: AmbiguityFlag) -> bool {
        self.ambiguity_flags.contains(&flag)
    }

    pub fn is_incomplete_shape(&self) -> bool {
        self.ambiguity_flags.iter().any(|f| f.is_missing_field())
    }

    pub(crate) fn flag(&mut self, flag: AmbiguityFlag) {
        if !self.ambiguity_flags.contains(&flag) {
            self.ambiguity_flags.push(flag);
        }
    }
}

/// Where the value in `ValidationResult::resolved_date` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Parser,
    Corrected,
    Approved,
    Manual,
    Rejected,
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    Approve,
    Reject,
    Modify,
    Skip,
}

impl ReviewAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Modify => "modify",
            Self::Skip => "skip",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "modify" => Some(Self::Modify),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

/// One raw fragment plus the already-resolved dates of its neighbouring
/// transactions. Context is advisory only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentInput {
    pub raw: String,
    #[serde(default)]
    pub context: Vec<NaiveDate>,
}

impl FragmentInput {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            context: Vec::new(),
        }
    }

    pub fn with_context(raw: impl Into<String>, context: Vec<NaiveDate>) -> Self {
        Self {
            raw: raw.into(),
            context,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub raw_fragment: String,
    pub corrected_fragment: String,
    pub resolved_date: Option<NaiveDate>,
    pub resolved_time: Option<NaiveTime>,
    pub warning_level: WarningLevel,
    pub issue: DateIssue,
    pub confidence: Confidence,
    pub action_required: ActionRequired,
    /// Auto-correct rule ids in application order.
    pub rules_applied: Vec<String>,
    /// Flag-review rule ids that matched the cleaned original fragment.
    pub flagged_by: Vec<String>,
    pub matched_format: Option<String>,
    pub ambiguity_flags: Vec<AmbiguityFlag>,
    pub partial: Option<PartialDate>,
    /// A date the corrector produced for an incomplete fragment. It is never
    /// promoted to `resolved_date` without a reviewer.
    pub withheld_date: Option<NaiveDate>,
    pub source: ResolutionSource,
    pub not_auto_correctable: bool,
}

impl ValidationResult {
    pub fn correction_applied(&self) -> Option<&str> {
        self.rules_applied.first().map(String::as_str)
    }

    pub fn needs_review(&self) -> bool {
        self.action_required != ActionRequired::None
    }
}
