use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult, ReviewError};
use crate::learning::PatternStats;
use crate::model::ReviewAction;
use crate::review::{parse_review_date, ReviewDecision, ReviewSession};

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_review_ledger.sql",
        include_str!("../db/migrations/0001_review_ledger.sql"),
    ),
    (
        "0002_learning_patterns.sql",
        include_str!("../db/migrations/0002_learning_patterns.sql"),
    ),
];

#[derive(Debug, Serialize)]
pub struct ReviewDbStatus {
    pub db_path: String,
    pub exists: bool,
    pub migration_files: Vec<String>,
    pub applied_versions: Vec<String>,
    pub pending_versions: Vec<String>,
    pub schema_migrations_table_exists: bool,
    pub ready: bool,
}

#[derive(Debug, Serialize)]
pub struct ReviewDbMigrateResult {
    pub db_path: String,
    pub created: bool,
    pub applied_now: Vec<String>,
    pub skipped: Vec<String>,
    pub applied_total: usize,
    pub pending_total: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionSaveResult {
    pub session_id: String,
    pub status: String,
    pub decisions_inserted: usize,
    pub decisions_total: usize,
}

const SCHEMA_MIGRATIONS_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

/// The embedded migrations a review database has recorded so far.
struct MigrationLedger {
    table_exists: bool,
    applied: Vec<String>,
}

impl MigrationLedger {
    fn read(conn: &Connection) -> rusqlite::Result<Self> {
        let table_exists = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
            [],
            |row| row.get::<_, i64>(0),
        )? > 0;
        let applied = if table_exists {
            let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
            let versions = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            versions
        } else {
            Vec::new()
        };
        Ok(Self {
            table_exists,
            applied,
        })
    }

    fn is_applied(&self, version: &str) -> bool {
        self.applied.iter().any(|v| v == version)
    }

    fn pending(&self) -> Vec<String> {
        MIGRATIONS
            .iter()
            .map(|(version, _)| *version)
            .filter(|version| !self.is_applied(version))
            .map(str::to_string)
            .collect()
    }
}

fn migration_files() -> Vec<String> {
    MIGRATIONS.iter().map(|(v, _)| (*v).to_string()).collect()
}

/// Reports which migrations a review database still needs without
/// creating or touching it.
pub fn inspect_status_at_path(db_path: &Path) -> EngineResult<ReviewDbStatus> {
    let ledger = if db_path.exists() {
        Some(MigrationLedger::read(&Connection::open(db_path)?)?)
    } else {
        None
    };
    let (table_exists, applied_versions, pending_versions) = match ledger {
        Some(ledger) => {
            let pending = ledger.pending();
            (ledger.table_exists, ledger.applied, pending)
        }
        None => (false, Vec::new(), migration_files()),
    };
    Ok(ReviewDbStatus {
        db_path: db_path.to_string_lossy().to_string(),
        exists: db_path.exists(),
        migration_files: migration_files(),
        applied_versions,
        ready: db_path.exists() && pending_versions.is_empty(),
        pending_versions,
        schema_migrations_table_exists: table_exists,
    })
}

/// Applies every embedded migration not yet recorded in
/// `schema_migrations`, one transaction per migration.
pub fn apply_embedded_migrations(db_path: &Path) -> EngineResult<ReviewDbMigrateResult> {
    let created = !db_path.exists();
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
    }

    let mut conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA_MIGRATIONS_DDL)?;
    let ledger = MigrationLedger::read(&conn)?;

    let mut applied_now = Vec::new();
    let mut skipped = Vec::new();
    for (version, sql) in MIGRATIONS {
        if ledger.is_applied(version) {
            skipped.push((*version).to_string());
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute("INSERT INTO schema_migrations(version) VALUES (?1)", [*version])?;
        tx.commit()?;
        info!(version = *version, db = %db_path.display(), "applied migration");
        applied_now.push((*version).to_string());
    }

    let pending_total = MigrationLedger::read(&conn)?.pending().len();
    Ok(ReviewDbMigrateResult {
        db_path: db_path.to_string_lossy().to_string(),
        created,
        applied_total: MIGRATIONS.len() - pending_total,
        applied_now,
        skipped,
        pending_total,
    })
}

/// Migrated connection with foreign keys enforced.
pub fn open_review_db(db_path: &Path) -> EngineResult<Connection> {
    apply_embedded_migrations(db_path)?;
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Persists the session row and appends decisions not yet stored. Stored
/// decisions are never rewritten.
pub fn save_session(conn: &mut Connection, session: &ReviewSession) -> EngineResult<SessionSaveResult> {
    let payload = ReviewSession {
        decisions: Vec::new(),
        ..session.clone()
    };
    let payload_json = serde_json::to_string(&payload)?;

    let tx = conn.transaction()?;
    tx.execute(
        r#"
        INSERT INTO review_sessions(id, created_at, status, closed_at, candidate_count, payload_json, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            closed_at = excluded.closed_at,
            candidate_count = excluded.candidate_count,
            payload_json = excluded.payload_json,
            updated_at = datetime('now')
        "#,
        params![
            session.session_id,
            session.created_at,
            session.status.as_str(),
            session.closed_at,
            session.candidates.len() as i64,
            payload_json,
        ],
    )?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            r#"
            INSERT OR IGNORE INTO review_decisions(
                decision_id, session_id, candidate_id, action, corrected_date, notes, decided_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )?;
        for d in &session.decisions {
            inserted += stmt.execute(params![
                d.decision_id,
                d.session_id,
                d.candidate_id,
                d.action.as_str(),
                d.corrected_date.map(|v| v.format("%Y-%m-%d").to_string()),
                d.notes,
                d.decided_at,
            ])?;
        }
    }
    tx.commit()?;
    debug!(session_id = %session.session_id, inserted, "saved review session");

    Ok(SessionSaveResult {
        session_id: session.session_id.clone(),
        status: session.status.as_str().to_string(),
        decisions_inserted: inserted,
        decisions_total: session.decisions.len(),
    })
}

struct DecisionRow {
    decision_id: String,
    session_id: String,
    candidate_id: String,
    action: String,
    corrected_date: Option<String>,
    notes: Option<String>,
    decided_at: String,
}

impl DecisionRow {
    fn into_decision(self) -> EngineResult<ReviewDecision> {
        let action = ReviewAction::parse(&self.action).ok_or(ReviewError::InvalidAction {
            value: self.action.clone(),
        })?;
        let corrected_date = match self.corrected_date.as_deref() {
            Some(raw) => Some(parse_review_date(raw)?),
            None => None,
        };
        Ok(ReviewDecision {
            decision_id: self.decision_id,
            session_id: self.session_id,
            candidate_id: self.candidate_id,
            action,
            corrected_date,
            notes: self.notes,
            decided_at: self.decided_at,
        })
    }
}

/// Decisions of one session in the order they were made.
pub fn load_audit_trail(conn: &Connection, session_id: &str) -> EngineResult<Vec<ReviewDecision>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT decision_id, session_id, candidate_id, action, corrected_date, notes, decided_at
        FROM review_decisions
        WHERE session_id = ?1
        ORDER BY seq ASC
        "#,
    )?;
    let rows = stmt.query_map([session_id], |row| {
        Ok(DecisionRow {
            decision_id: row.get(0)?,
            session_id: row.get(1)?,
            candidate_id: row.get(2)?,
            action: row.get(3)?,
            corrected_date: row.get(4)?,
            notes: row.get(5)?,
            decided_at: row.get(6)?,
        })
    })?;
    let mut decisions = Vec::new();
    for row in rows {
        decisions.push(row?.into_decision()?);
    }
    Ok(decisions)
}

pub fn load_session(conn: &Connection, session_id: &str) -> EngineResult<ReviewSession> {
    let payload_json = conn
        .query_row(
            "SELECT payload_json FROM review_sessions WHERE id = ?1",
            [session_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
    let mut session = serde_json::from_str::<ReviewSession>(&payload_json)?;
    session.decisions = load_audit_trail(conn, session_id)?;
    Ok(session)
}

pub fn save_learning<'a>(
    conn: &mut Connection,
    patterns: impl IntoIterator<Item = &'a PatternStats>,
) -> EngineResult<usize> {
    let tx = conn.transaction()?;
    let mut written = 0;
    {
        let mut stmt = tx.prepare(
            r#"
            INSERT INTO learning_patterns(signature, occurrences, rejections, promoted_rule_id, example, stats_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
            ON CONFLICT(signature) DO UPDATE SET
                occurrences = excluded.occurrences,
                rejections = excluded.rejections,
                promoted_rule_id = excluded.promoted_rule_id,
                example = excluded.example,
                stats_json = excluded.stats_json,
                updated_at = datetime('now')
            "#,
        )?;
        for p in patterns {
            stmt.execute(params![
                p.signature,
                p.occurrences as i64,
                p.rejections as i64,
                p.promoted_rule_id,
                p.example,
                serde_json::to_string(p)?,
            ])?;
            written += 1;
        }
    }
    tx.commit()?;
    Ok(written)
}

pub fn load_learning(conn: &Connection) -> EngineResult<Vec<PatternStats>> {
    let mut stmt =
        conn.prepare("SELECT stats_json FROM learning_patterns ORDER BY signature ASC")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut patterns = Vec::new();
    for row in rows {
        patterns.push(serde_json::from_str::<PatternStats>(&row?)?);
    }
    Ok(patterns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::learning::LearningEngine;
    use crate::model::FragmentInput;
    use crate::pipeline::{validate_batch, NoopObserver};
    use crate::review::{candidates_from_results, DecisionRequest, SessionStatus};
    use crate::rules_store::RuleStore;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn create_temp_test_db() -> PathBuf {
        let unique = format!(
            "keepwise_review_db_test_{}_{}.db",
            std::process::id(),
            Uuid::new_v4()
        );
        std::env::temp_dir().join(unique)
    }

    fn session_for(raws: &[&str]) -> ReviewSession {
        let store = RuleStore::seeded().expect("seed");
        let cfg = EngineConfig::default();
        let inputs = raws.iter().map(|r| FragmentInput::new(*r)).collect::<Vec<_>>();
        let report = validate_batch(&store.snapshot(&cfg), &cfg, &inputs, &NoopObserver);
        ReviewSession::open(candidates_from_results(&report.results, &inputs))
    }

    #[test]
    fn migrations_apply_once() {
        let db_path = create_temp_test_db();
        let status = inspect_status_at_path(&db_path).expect("status");
        assert!(!status.exists);
        assert_eq!(status.pending_versions.len(), MIGRATIONS.len());

        let first = apply_embedded_migrations(&db_path).expect("migrate");
        assert!(first.created);
        assert_eq!(first.applied_now.len(), MIGRATIONS.len());
        let second = apply_embedded_migrations(&db_path).expect("migrate again");
        assert!(second.applied_now.is_empty());
        assert_eq!(second.skipped.len(), MIGRATIONS.len());
        assert!(inspect_status_at_path(&db_path).expect("status").ready);
        let _ = std::fs::remove_file(db_path);
    }

    #[test]
    fn status_of_an_unmigrated_file_lists_every_migration() {
        let db_path = create_temp_test_db();
        Connection::open(&db_path)
            .expect("create db")
            .execute_batch("CREATE TABLE unrelated (id INTEGER);")
            .expect("create table");
        let status = inspect_status_at_path(&db_path).expect("status");
        assert!(status.exists);
        assert!(!status.schema_migrations_table_exists);
        assert!(!status.ready);
        assert_eq!(status.pending_versions, status.migration_files);
        let _ = std::fs::remove_file(db_path);
    }

    #[test]
    fn session_round_trips_with_ordered_audit_trail() {
        let db_path = create_temp_test_db();
        let mut conn = open_review_db(&db_path).expect("open");
        let mut session = session_for(&["Feb 2025", "24 2025"]);
        let first = session.candidates[0].candidate_id.clone();
        let second = session.candidates[1].candidate_id.clone();

        session
            .decide(&first, &DecisionRequest::modify("2025-02-15"))
            .expect("modify");
        let saved = save_session(&mut conn, &session).expect("save");
        assert_eq!(saved.decisions_inserted, 1);

        session
            .decide(&second, &DecisionRequest::new(ReviewAction::Reject))
            .expect("reject");
        let saved = save_session(&mut conn, &session).expect("save again");
        assert_eq!(saved.decisions_inserted, 1);
        assert_eq!(saved.decisions_total, 2);

        let loaded = load_session(&conn, &session.session_id).expect("load");
        assert_eq!(loaded.status, SessionStatus::Closed);
        assert_eq!(loaded.candidates, session.candidates);
        assert_eq!(loaded.decisions, session.decisions);
        assert_eq!(
            loaded.decisions[0].corrected_date,
            NaiveDate::from_ymd_opt(2025, 2, 15)
        );
        let _ = std::fs::remove_file(db_path);
    }

    #[test]
    fn decisions_are_append_only() {
        let db_path = create_temp_test_db();
        let mut conn = open_review_db(&db_path).expect("open");
        let mut session = session_for(&["Feb 2025"]);
        let id = session.candidates[0].candidate_id.clone();
        session
            .decide(&id, &DecisionRequest::new(ReviewAction::Reject))
            .expect("reject");
        save_session(&mut conn, &session).expect("save");

        let update = conn.execute("UPDATE review_decisions SET action = 'approve'", []);
        assert!(update.is_err());
        let delete = conn.execute("DELETE FROM review_decisions", []);
        assert!(delete.is_err());
        assert_eq!(load_audit_trail(&conn, &session.session_id).expect("trail").len(), 1);
        let _ = std::fs::remove_file(db_path);
    }

    #[test]
    fn missing_session_is_reported() {
        let db_path = create_temp_test_db();
        let conn = open_review_db(&db_path).expect("open");
        let err = load_session(&conn, "nope").expect_err("missing");
        assert!(matches!(err, EngineError::SessionNotFound(id) if id == "nope"));
        let _ = std::fs::remove_file(db_path);
    }

    #[test]
    fn learning_state_survives_restart() {
        let db_path = create_temp_test_db();
        let mut conn = open_review_db(&db_path).expect("open");
        let cfg = EngineConfig::default();
        let mut engine = LearningEngine::new(&cfg);
        for (raw, m) in [("Jan 2025", 1), ("Feb 2025", 2), ("Mar 2025", 3)] {
            engine.observe(raw, NaiveDate::from_ymd_opt(2025, m, 1).expect("date"));
        }
        assert_eq!(engine.promote().len(), 1);
        save_learning(&mut conn, engine.patterns()).expect("save");

        let restored = LearningEngine::with_patterns(&cfg, load_learning(&conn).expect("load"));
        let stats = restored.pattern("MON|_|YYYY").expect("pattern");
        assert_eq!(stats.occurrences, 3);
        assert!(stats.is_promoted());
        let _ = std::fs::remove_file(db_path);
    }
}
