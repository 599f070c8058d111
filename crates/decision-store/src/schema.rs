//! All CREATE TABLE statements, idempotent.
//!
//! Decisions and weight versions are append-only; outcomes are mutable only
//! on first resolution. Supersede is a flag flip, never a delete, so the
//! uniqueness of (instrument, as_of) is scoped to non-superseded rows.

pub const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS decisions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        instrument TEXT NOT NULL,
        as_of TEXT NOT NULL,
        composite_score REAL NOT NULL,
        confidence REAL NOT NULL,
        action TEXT NOT NULL,
        weight_version INTEGER NOT NULL,
        position_size_pct REAL NOT NULL,
        stop_loss_pct REAL NOT NULL,
        inputs_json TEXT NOT NULL,
        reasoning_json TEXT NOT NULL,
        superseded INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_decisions_active
        ON decisions(instrument, as_of) WHERE superseded = 0",
    "CREATE INDEX IF NOT EXISTS idx_decisions_instrument ON decisions(instrument)",
    "CREATE TABLE IF NOT EXISTS outcomes (
        decision_id INTEGER NOT NULL REFERENCES decisions(id),
        horizon TEXT NOT NULL,
        realized_return REAL,
        resolved_at TEXT,
        PRIMARY KEY (decision_id, horizon)
    )",
    "CREATE INDEX IF NOT EXISTS idx_outcomes_pending
        ON outcomes(horizon) WHERE resolved_at IS NULL",
    "CREATE TABLE IF NOT EXISTS weight_versions (
        version INTEGER PRIMARY KEY,
        weights_json TEXT NOT NULL,
        effective_from TEXT NOT NULL,
        reason TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
    )",
];
