pub mod classifier;
pub mod config;
pub mod corrector;
pub mod date_parser;
pub mod error;
pub mod learning;
pub mod model;
pub mod pipeline;
pub mod processor;
pub mod review;
pub mod review_db;
pub mod rules_store;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, ReviewError};
pub use learning::{LearningEngine, LearningSummary, PatternStats};
pub use model::{
    ActionRequired, AmbiguityFlag, Confidence, DateIssue, FragmentInput, ParseOutcome,
    ResolutionSource, ReviewAction, RuleCategory, RuleOrigin, ValidationResult, WarningLevel,
};
pub use pipeline::{
    validate_batch, validate_fragment, BatchReport, BatchSummary, NoopObserver, PipelineObserver,
    StageEvent, TracingObserver,
};
pub use processor::{DateProcessor, DecisionOutcome, ProcessingStats, ProcessingSummary};
pub use review::{open_session, DecisionRequest, ReviewCandidate, ReviewDecision, ReviewSession};
pub use rules_store::{ensure_rules_file_seeded, CorrectionRule, RuleSnapshot, RuleStore};
