use keepwise_dates_lib::review_db::{
    inspect_status_at_path, load_audit_trail, load_learning, load_session, open_review_db,
    save_learning, save_session,
};
use keepwise_dates_lib::{
    ensure_rules_file_seeded, DateProcessor, DecisionRequest, EngineConfig, EngineError,
    FragmentInput, LearningEngine, ReviewError, RuleStore, TracingObserver,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct AdapterRequest {
    schema_version: u64,
    case: Option<AdapterCaseMeta>,
    endpoint: AdapterEndpoint,
    #[serde(default)]
    query: Value,
    dataset: AdapterDataset,
}

#[derive(Debug, Deserialize)]
struct AdapterCaseMeta {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdapterEndpoint {
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AdapterDataset {
    db_path: Option<String>,
    rules_path: Option<String>,
    config_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct AdapterErrorBody {
    category: String,
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status")]
enum AdapterResponse {
    #[serde(rename = "success")]
    Success { payload: Value },
    #[serde(rename = "error")]
    Error { error: AdapterErrorBody },
}

#[derive(Debug, thiserror::Error)]
enum AdapterError {
    #[error("{0}")]
    Protocol(String),

    #[error("unsupported endpoint path: {0}")]
    UnsupportedEndpoint(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl AdapterError {
    fn category(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "ADAPTER_PROTOCOL_ERROR",
            Self::UnsupportedEndpoint(_) => "UNSUPPORTED_ENDPOINT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Engine(err) => engine_error_category(err),
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::Engine(EngineError::Review(_)) => "ReviewError",
            Self::Engine(_) => "EngineError",
            _ => "AdapterError",
        }
    }
}

impl From<ReviewError> for AdapterError {
    fn from(err: ReviewError) -> Self {
        Self::Engine(EngineError::Review(err))
    }
}

fn engine_error_category(err: &EngineError) -> &'static str {
    match err {
        EngineError::Review(review) => match review {
            ReviewError::Conflict { .. } | ReviewError::SessionClosed { .. } => "REVIEW_CONFLICT",
            ReviewError::CandidateNotFound { .. } => "NOT_FOUND",
            ReviewError::NothingToApprove { .. }
            | ReviewError::MissingCorrectedDate { .. }
            | ReviewError::InvalidAction { .. }
            | ReviewError::InvalidDate { .. } => "VALIDATION_ERROR",
        },
        EngineError::SessionNotFound(_) => "NOT_FOUND",
        EngineError::Config(_) | EngineError::RuleFile { .. } => "VALIDATION_ERROR",
        EngineError::Csv(_)
        | EngineError::Io { .. }
        | EngineError::Storage(_)
        | EngineError::Json(_) => "STORAGE_ERROR",
    }
}

fn error_response(
    category: impl Into<String>,
    message: impl Into<String>,
    error_type: impl Into<String>,
) -> AdapterResponse {
    AdapterResponse::Error {
        error: AdapterErrorBody {
            category: category.into(),
            message: message.into(),
            error_type: error_type.into(),
        },
    }
}

fn parse_bool_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| arg == flag)
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn read_stdin_json() -> Result<Value, AdapterError> {
    let mut raw = String::new();
    io::stdin()
        .read_to_string(&mut raw)
        .map_err(|e| AdapterError::Protocol(format!("read stdin failed: {e}")))?;
    if raw.trim().is_empty() {
        return Err(AdapterError::Protocol("empty stdin request".to_string()));
    }
    serde_json::from_str::<Value>(&raw)
        .map_err(|e| AdapterError::Protocol(format!("invalid JSON request: {e}")))
}

/// A fragment given either as a bare string or with its context dates.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FragmentArg {
    Raw(String),
    Full(FragmentInput),
}

impl From<FragmentArg> for FragmentInput {
    fn from(arg: FragmentArg) -> Self {
        match arg {
            FragmentArg::Raw(raw) => FragmentInput::new(raw),
            FragmentArg::Full(input) => input,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FragmentsQuery {
    fragments: Vec<FragmentArg>,
}

#[derive(Debug, Deserialize)]
struct DecideQuery {
    session_id: String,
    candidate_id: String,
    #[serde(flatten)]
    decision: DecisionRequest,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session_id: String,
}

fn parse_query<T: serde::de::DeserializeOwned>(query: Value, endpoint: &str) -> Result<T, AdapterError> {
    serde_json::from_value(query)
        .map_err(|e| AdapterError::Validation(format!("request.query invalid for {endpoint}: {e}")))
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

struct Workspace {
    db_path: Option<PathBuf>,
    rules_path: Option<PathBuf>,
    config: EngineConfig,
    verbose: bool,
}

impl Workspace {
    fn from_dataset(dataset: &AdapterDataset, verbose: bool) -> Result<Self, AdapterError> {
        let config = match non_empty(dataset.config_path.as_deref()) {
            Some(path) => EngineConfig::from_json_file(Path::new(path))?,
            None => EngineConfig::default(),
        };
        Ok(Self {
            db_path: non_empty(dataset.db_path.as_deref()).map(PathBuf::from),
            rules_path: non_empty(dataset.rules_path.as_deref()).map(PathBuf::from),
            config,
            verbose,
        })
    }

    fn require_db(&self) -> Result<&Path, AdapterError> {
        self.db_path
            .as_deref()
            .ok_or_else(|| AdapterError::Protocol("request.dataset.db_path missing".to_string()))
    }

    fn load_rules(&self) -> Result<RuleStore, AdapterError> {
        match &self.rules_path {
            Some(path) => {
                if ensure_rules_file_seeded(path)? {
                    info!(path = %path.display(), "seeded rule file");
                }
                Ok(RuleStore::load_from_path(path)?)
            }
            None => Ok(RuleStore::seeded()?),
        }
    }

    fn save_rules(&self, rules: &RuleStore) -> Result<(), AdapterError> {
        if let Some(path) = &self.rules_path {
            rules.save_to_path(path)?;
        }
        Ok(())
    }

    fn processor(&self, rules: RuleStore, db: Option<&rusqlite::Connection>) -> Result<DateProcessor, AdapterError> {
        let mut processor = DateProcessor::new(self.config.clone(), rules)?;
        if let Some(conn) = db {
            processor = processor.with_learning(load_learning(conn)?);
        }
        if self.verbose {
            processor = processor.with_observer(Box::new(TracingObserver));
        }
        Ok(processor)
    }
}

fn validate_endpoint(ws: &Workspace, query: Value) -> Result<Value, AdapterError> {
    let q: FragmentsQuery = parse_query(query, "validate")?;
    let inputs = q.fragments.into_iter().map(FragmentInput::from).collect::<Vec<_>>();
    let rules = ws.load_rules()?;
    let rejected = rules.load_report().rejected.clone();
    let mut processor = ws.processor(rules, None)?;
    let (report, _) = processor.process_batch(&inputs);
    ws.save_rules(processor.rules())?;
    Ok(json!({
        "results": report.results,
        "summary": report.summary,
        "rule_load_issues": rejected,
    }))
}

fn review_session_endpoint(ws: &Workspace, query: Value) -> Result<Value, AdapterError> {
    let q: FragmentsQuery = parse_query(query, "review/session")?;
    let inputs = q.fragments.into_iter().map(FragmentInput::from).collect::<Vec<_>>();
    let mut conn = open_review_db(ws.require_db()?)?;
    let mut processor = ws.processor(ws.load_rules()?, Some(&conn))?;
    let (report, session) = processor.process_batch(&inputs);
    if let Some(session) = &session {
        save_session(&mut conn, session)?;
    }
    ws.save_rules(processor.rules())?;
    let review = session.as_ref().map(|s| s.summary());
    Ok(json!({
        "summary": report.summary,
        "results": report.results,
        "session": session,
        "review": review,
    }))
}

fn review_decide_endpoint(ws: &Workspace, query: Value) -> Result<Value, AdapterError> {
    let q: DecideQuery = parse_query(query, "review/decide")?;
    let mut conn = open_review_db(ws.require_db()?)?;
    let mut session = load_session(&conn, &q.session_id)?;
    let mut processor = ws.processor(ws.load_rules()?, Some(&conn))?;
    let outcome = processor.decide(&mut session, &q.candidate_id, &q.decision)?;
    let saved = save_session(&mut conn, &session)?;
    save_learning(&mut conn, processor.learning().patterns())?;
    ws.save_rules(processor.rules())?;
    Ok(json!({
        "outcome": outcome,
        "saved": saved,
        "review": session.summary(),
    }))
}

fn review_audit_endpoint(ws: &Workspace, query: Value) -> Result<Value, AdapterError> {
    let q: SessionQuery = parse_query(query, "review/audit")?;
    let conn = open_review_db(ws.require_db()?)?;
    let session = load_session(&conn, &q.session_id)?;
    let decisions = load_audit_trail(&conn, &q.session_id)?;
    Ok(json!({
        "session_id": q.session_id,
        "review": session.summary(),
        "decisions": decisions,
    }))
}

fn rules_endpoint(ws: &Workspace) -> Result<Value, AdapterError> {
    let rules = ws.load_rules()?;
    Ok(json!({
        "rules": rules.views(&ws.config),
        "load_report": rules.load_report(),
    }))
}

fn learning_summary_endpoint(ws: &Workspace) -> Result<Value, AdapterError> {
    let conn = open_review_db(ws.require_db()?)?;
    let engine = LearningEngine::with_patterns(&ws.config, load_learning(&conn)?);
    serde_json::to_value(engine.summary()).map_err(|e| AdapterError::Engine(e.into()))
}

fn db_status_endpoint(ws: &Workspace) -> Result<Value, AdapterError> {
    let status = inspect_status_at_path(ws.require_db()?)?;
    serde_json::to_value(status).map_err(|e| AdapterError::Engine(e.into()))
}

fn dispatch(req: AdapterRequest, verbose: bool) -> Result<Value, AdapterError> {
    if req.schema_version != 1 {
        return Err(AdapterError::Protocol(format!(
            "unsupported schema_version: {}",
            req.schema_version
        )));
    }
    let path = non_empty(req.endpoint.path.as_deref())
        .ok_or_else(|| AdapterError::Protocol("request.endpoint.path missing".to_string()))?
        .to_string();
    let ws = Workspace::from_dataset(&req.dataset, verbose)?;

    match path.as_str() {
        "/api/dates/validate" => validate_endpoint(&ws, req.query),
        "/api/dates/review/session" => review_session_endpoint(&ws, req.query),
        "/api/dates/review/decide" => review_decide_endpoint(&ws, req.query),
        "/api/dates/review/audit" => review_audit_endpoint(&ws, req.query),
        "/api/dates/rules" => rules_endpoint(&ws),
        "/api/dates/learning/summary" => learning_summary_endpoint(&ws),
        "/api/dates/db/status" => db_status_endpoint(&ws),
        _ => Err(AdapterError::UnsupportedEndpoint(path)),
    }
}

fn main() {
    let args = env::args().skip(1).collect::<Vec<_>>();
    let pretty = parse_bool_flag(&args, "--pretty");
    let verbose = parse_bool_flag(&args, "--verbose");
    init_tracing(verbose);

    let resp = match read_stdin_json()
        .and_then(|v| {
            serde_json::from_value::<AdapterRequest>(v)
                .map_err(|e| AdapterError::Protocol(format!("request root invalid: {e}")))
        })
        .and_then(|req| {
            debug!(
                case = req.case.as_ref().and_then(|c| c.id.as_deref()).unwrap_or("-"),
                endpoint = req.endpoint.path.as_deref().unwrap_or("-"),
                db = req.dataset.db_path.as_deref().unwrap_or("-"),
                "adapter request"
            );
            dispatch(req, verbose)
        }) {
        Ok(payload) => AdapterResponse::Success { payload },
        Err(err) => error_response(err.category(), err.to_string(), err.error_type()),
    };
    let out = if pretty {
        serde_json::to_string_pretty(&resp)
    } else {
        serde_json::to_string(&resp)
    }
    .unwrap_or_else(|e| {
        json!({
            "status": "error",
            "error": {
                "category": "ADAPTER_PROTOCOL_ERROR",
                "message": format!("serialize response failed: {e}"),
                "type": "SerializeError",
            }
        })
        .to_string()
    });
    print!("{out}");
}
