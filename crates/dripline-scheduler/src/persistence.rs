//! SQLite-backed persistence for sequences, steps, instances, tasks, and leads.
//!
//! Row access lives on the [`SequenceStore`] extension trait, implemented for
//! `rusqlite::Connection`. The same calls work on a plain connection and on a
//! `Transaction` (which derefs to one), so multi-row writes compose inside
//! [`DripDb::transaction`].

use std::collections::HashMap;
use std::ops::Deref;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use dripline_core::error::{DriplineError, Result};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};

use crate::model::{
    Instance, LeadCapabilities, LeadSnapshot, ParseTagError, PendingTask,
    SequenceDefinition, Step, TaskStatus,
};

/// SQLite database holding all scheduler state.
pub struct DripDb {
    conn: Connection,
}

impl DripDb {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| DriplineError::Database(format!("DB open error: {e}")))?;
        Self::init(conn)
    }

    /// Private in-memory database (tests, dry runs against fixtures).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| DriplineError::Database(format!("DB open error: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| DriplineError::Database(format!("DB pragma error: {e}")))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                name TEXT NOT NULL,
                trigger_type TEXT NOT NULL,      -- 'no_response', 'meeting_selected', 'manual'
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sequences_workspace ON sequences(workspace_id);

            -- step_order stays dense 1..N; renumbering goes through negative orders first
            CREATE TABLE IF NOT EXISTS sequence_steps (
                id TEXT PRIMARY KEY,
                sequence_id TEXT NOT NULL,
                step_order INTEGER NOT NULL,
                day_offset INTEGER NOT NULL DEFAULT 1,
                minute_offset INTEGER NOT NULL DEFAULT 0,
                channel TEXT NOT NULL,
                message TEXT NOT NULL,
                subject TEXT,
                step_condition TEXT NOT NULL DEFAULT 'always',
                condition_value TEXT,
                requires_approval INTEGER NOT NULL DEFAULT 0,
                fallback_step INTEGER,
                UNIQUE (sequence_id, step_order)
            );

            CREATE TABLE IF NOT EXISTS sequence_instances (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                sequence_id TEXT NOT NULL,
                status TEXT NOT NULL,            -- active, paused, completed, cancelled
                current_step INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                last_step_at TEXT,
                next_step_due TEXT,
                paused_reason TEXT,
                UNIQUE (lead_id, sequence_id)
            );
            CREATE INDEX IF NOT EXISTS idx_instances_due ON sequence_instances(status, next_step_due);
            CREATE INDEX IF NOT EXISTS idx_instances_sequence ON sequence_instances(sequence_id);

            CREATE TABLE IF NOT EXISTS sequence_tasks (
                id TEXT PRIMARY KEY,
                instance_id TEXT,
                step_order INTEGER,
                lead_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                status TEXT NOT NULL,            -- pending, queued, sending, sent, failed, dismissed
                message TEXT NOT NULL,
                subject TEXT,
                due_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                sent_at TEXT,
                error TEXT,
                claimed_at TEXT                  -- set when a flush moves it to 'sending'
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_instance ON sequence_tasks(instance_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON sequence_tasks(status);

            -- CRM snapshot, written by the lead sync
            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                has_phone INTEGER NOT NULL DEFAULT 0,
                linkedin_connected INTEGER NOT NULL DEFAULT 0,
                has_replied INTEGER NOT NULL DEFAULT 0,
                email_opened INTEGER NOT NULL DEFAULT 0,
                fields TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS batch_cursors (
                job TEXT PRIMARY KEY,
                cursor TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| DriplineError::Database(format!("Migration: {e}")))?;

        // Databases created before claims were timestamped.
        let has_claimed_at: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('sequence_tasks') WHERE name = 'claimed_at'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| DriplineError::Database(format!("Migration: {e}")))?;
        if has_claimed_at == 0 {
            self.conn
                .execute_batch("ALTER TABLE sequence_tasks ADD COLUMN claimed_at TEXT;")
                .map_err(|e| DriplineError::Database(format!("Migration: {e}")))?;
        }
        Ok(())
    }

    /// Run `f` in a transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let tx = self.conn.transaction().map_err(DriplineError::db)?;
        let out = f(&tx)?;
        tx.commit().map_err(DriplineError::db)?;
        Ok(out)
    }
}

impl Deref for DripDb {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

// ─── Row helpers ──────────────────────────────────────────────

/// Fixed-precision RFC3339 so stored timestamps sort as strings.
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn get_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(idx, &s)
}

fn get_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_ts(idx, &s)).transpose()
}

fn get_tag<T: FromStr<Err = ParseTagError>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    s.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

const SEQUENCE_SELECT: &str =
    "SELECT id, workspace_id, name, trigger_type, active, created_at, updated_at FROM sequences";

fn row_to_sequence(row: &Row) -> rusqlite::Result<SequenceDefinition> {
    Ok(SequenceDefinition {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        trigger: get_tag(row, 3)?,
        active: row.get(4)?,
        created_at: get_ts(row, 5)?,
        updated_at: get_ts(row, 6)?,
    })
}

const STEP_SELECT: &str = "SELECT id, sequence_id, step_order, day_offset, minute_offset, channel, message, subject, step_condition, condition_value, requires_approval, fallback_step FROM sequence_steps";

fn row_to_step(row: &Row) -> rusqlite::Result<Step> {
    Ok(Step {
        id: row.get(0)?,
        sequence_id: row.get(1)?,
        order: row.get(2)?,
        day_offset: row.get(3)?,
        minute_offset: row.get(4)?,
        channel: get_tag(row, 5)?,
        message: row.get(6)?,
        subject: row.get(7)?,
        condition: get_tag(row, 8)?,
        condition_value: row.get(9)?,
        requires_approval: row.get(10)?,
        fallback_step: row.get(11)?,
    })
}

const INSTANCE_SELECT: &str = "SELECT i.id, i.workspace_id, i.lead_id, i.sequence_id, i.status, i.current_step, i.started_at, i.last_step_at, i.next_step_due, i.paused_reason FROM sequence_instances i";

fn row_to_instance(row: &Row) -> rusqlite::Result<Instance> {
    Ok(Instance {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        lead_id: row.get(2)?,
        sequence_id: row.get(3)?,
        status: get_tag(row, 4)?,
        current_step: row.get(5)?,
        started_at: get_ts(row, 6)?,
        last_step_at: get_opt_ts(row, 7)?,
        next_step_due: get_opt_ts(row, 8)?,
        paused_reason: row.get(9)?,
    })
}

const TASK_SELECT: &str = "SELECT id, instance_id, step_order, lead_id, workspace_id, channel, status, message, subject, due_at, created_at, sent_at, error FROM sequence_tasks";

fn row_to_task(row: &Row) -> rusqlite::Result<PendingTask> {
    Ok(PendingTask {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        step_order: row.get(2)?,
        lead_id: row.get(3)?,
        workspace_id: row.get(4)?,
        channel: get_tag(row, 5)?,
        status: get_tag(row, 6)?,
        message: row.get(7)?,
        subject: row.get(8)?,
        due_at: get_ts(row, 9)?,
        created_at: get_ts(row, 10)?,
        sent_at: get_opt_ts(row, 11)?,
        error: row.get(12)?,
    })
}

fn collect<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: fn(&Row) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(DriplineError::db)?;
    let rows = stmt.query_map(params, map).map_err(DriplineError::db)?;
    rows.collect::<rusqlite::Result<Vec<T>>>()
        .map_err(DriplineError::db)
}

fn first<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: fn(&Row) -> rusqlite::Result<T>,
) -> Result<Option<T>> {
    conn.query_row(sql, params, map)
        .optional()
        .map_err(DriplineError::db)
}

// ─── Store API ────────────────────────────────────────────────

/// Row-level access to scheduler tables.
pub trait SequenceStore {
    // Sequences
    fn insert_sequence(&self, def: &SequenceDefinition) -> Result<()>;
    fn update_sequence(&self, def: &SequenceDefinition) -> Result<()>;
    fn get_sequence(&self, id: &str) -> Result<Option<SequenceDefinition>>;
    fn list_sequences(&self, workspace_id: Option<&str>) -> Result<Vec<SequenceDefinition>>;
    fn list_workspaces(&self) -> Result<Vec<String>>;
    fn delete_sequence(&self, id: &str) -> Result<()>;

    // Steps
    fn load_steps(&self, sequence_id: &str) -> Result<Vec<Step>>;
    fn insert_step(&self, step: &Step) -> Result<()>;
    fn write_steps(&self, sequence_id: &str, steps: &[Step]) -> Result<()>;

    // Instances
    fn insert_instance(&self, inst: &Instance) -> Result<()>;
    fn get_instance(&self, id: &str) -> Result<Option<Instance>>;
    fn find_instance(&self, lead_id: &str, sequence_id: &str) -> Result<Option<Instance>>;
    fn update_instance(&self, inst: &Instance) -> Result<usize>;
    fn swap_instance(&self, expected: &Instance, next: &Instance) -> Result<bool>;
    fn delete_instance(&self, id: &str) -> Result<usize>;
    fn list_instances(&self, sequence_id: &str) -> Result<Vec<Instance>>;
    fn list_lead_instances(&self, lead_id: &str) -> Result<Vec<Instance>>;
    fn list_workspace_instances(&self, workspace_id: &str) -> Result<Vec<Instance>>;
    fn count_instances(&self, sequence_id: &str) -> Result<usize>;
    fn due_instances(
        &self,
        now: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Instance>>;

    // Tasks
    fn insert_task(&self, task: &PendingTask) -> Result<()>;
    fn get_task(&self, id: &str) -> Result<Option<PendingTask>>;
    fn update_task(&self, task: &PendingTask) -> Result<usize>;
    fn transition_task(&self, id: &str, from: TaskStatus, to: TaskStatus) -> Result<bool>;
    fn finish_task(&self, id: &str, outcome: std::result::Result<DateTime<Utc>, String>) -> Result<()>;
    fn claim_task(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;
    fn reclaim_stale_sending(&self, claimed_before: DateTime<Utc>) -> Result<usize>;
    fn list_instance_tasks(&self, instance_id: &str) -> Result<Vec<PendingTask>>;
    fn list_workspace_tasks(&self, workspace_id: &str, status: TaskStatus) -> Result<Vec<PendingTask>>;
    fn queued_tasks(&self, limit: usize) -> Result<Vec<PendingTask>>;
    fn detach_instance_tasks(&self, instance_id: &str) -> Result<usize>;

    // Leads
    fn upsert_lead(&self, lead: &LeadSnapshot) -> Result<()>;
    fn get_lead(&self, id: &str) -> Result<Option<LeadSnapshot>>;

    // Cursors
    fn get_cursor(&self, job: &str) -> Result<Option<String>>;
    fn set_cursor(&self, job: &str, cursor: &str) -> Result<()>;
    fn clear_cursor(&self, job: &str) -> Result<()>;
}

impl SequenceStore for Connection {
    // ─── Sequences ───────────────────────────────────────────

    fn insert_sequence(&self, def: &SequenceDefinition) -> Result<()> {
        self.execute(
            "INSERT INTO sequences (id, workspace_id, name, trigger_type, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                def.id,
                def.workspace_id,
                def.name,
                def.trigger.as_str(),
                def.active,
                ts(&def.created_at),
                ts(&def.updated_at),
            ],
        )
        .map_err(|e| DriplineError::Database(format!("Insert sequence: {e}")))?;
        Ok(())
    }

    fn update_sequence(&self, def: &SequenceDefinition) -> Result<()> {
        self.execute(
            "UPDATE sequences SET name = ?1, trigger_type = ?2, active = ?3, updated_at = ?4 WHERE id = ?5",
            params![def.name, def.trigger.as_str(), def.active, ts(&def.updated_at), def.id],
        )
        .map_err(|e| DriplineError::Database(format!("Update sequence: {e}")))?;
        Ok(())
    }

    fn get_sequence(&self, id: &str) -> Result<Option<SequenceDefinition>> {
        first(
            self,
            &format!("{SEQUENCE_SELECT} WHERE id = ?1"),
            [id],
            row_to_sequence,
        )
    }

    fn list_sequences(&self, workspace_id: Option<&str>) -> Result<Vec<SequenceDefinition>> {
        collect(
            self,
            &format!("{SEQUENCE_SELECT} WHERE (?1 IS NULL OR workspace_id = ?1) ORDER BY workspace_id, created_at, id"),
            params![workspace_id],
            row_to_sequence,
        )
    }

    fn list_workspaces(&self) -> Result<Vec<String>> {
        collect(
            self,
            "SELECT DISTINCT workspace_id FROM sequences ORDER BY workspace_id",
            [],
            |row| row.get(0),
        )
    }

    fn delete_sequence(&self, id: &str) -> Result<()> {
        self.execute("DELETE FROM sequence_steps WHERE sequence_id = ?1", [id])
            .map_err(|e| DriplineError::Database(format!("Delete steps: {e}")))?;
        self.execute("DELETE FROM sequences WHERE id = ?1", [id])
            .map_err(|e| DriplineError::Database(format!("Delete sequence: {e}")))?;
        Ok(())
    }

    // ─── Steps ───────────────────────────────────────────────

    fn load_steps(&self, sequence_id: &str) -> Result<Vec<Step>> {
        collect(
            self,
            &format!("{STEP_SELECT} WHERE sequence_id = ?1 ORDER BY step_order"),
            [sequence_id],
            row_to_step,
        )
    }

    fn insert_step(&self, step: &Step) -> Result<()> {
        self.execute(
            "INSERT INTO sequence_steps
             (id, sequence_id, step_order, day_offset, minute_offset, channel, message, subject,
              step_condition, condition_value, requires_approval, fallback_step)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                step.id,
                step.sequence_id,
                step.order,
                step.day_offset,
                step.minute_offset,
                step.channel.as_str(),
                step.message,
                step.subject,
                step.condition.as_str(),
                step.condition_value,
                step.requires_approval,
                step.fallback_step,
            ],
        )
        .map_err(|e| DriplineError::Database(format!("Insert step: {e}")))?;
        Ok(())
    }

    /// Replace a sequence's steps with `steps` (kept ids are updated in place).
    ///
    /// Two phases so `UNIQUE(sequence_id, step_order)` never sees a collision:
    /// every existing row first moves to its negated order, then rows are
    /// written at their final positions.
    fn write_steps(&self, sequence_id: &str, steps: &[Step]) -> Result<()> {
        self.execute(
            "UPDATE sequence_steps SET step_order = -step_order WHERE sequence_id = ?1 AND step_order > 0",
            [sequence_id],
        )
        .map_err(|e| DriplineError::Database(format!("Renumber phase 1: {e}")))?;

        let existing: Vec<String> = collect(
            self,
            "SELECT id FROM sequence_steps WHERE sequence_id = ?1",
            [sequence_id],
            |row| row.get(0),
        )?;
        for id in existing.iter().filter(|id| !steps.iter().any(|s| &s.id == *id)) {
            self.execute("DELETE FROM sequence_steps WHERE id = ?1", [id])
                .map_err(|e| DriplineError::Database(format!("Delete step {id}: {e}")))?;
        }

        for step in steps {
            if existing.contains(&step.id) {
                self.execute(
                    "UPDATE sequence_steps SET step_order = ?1, day_offset = ?2, minute_offset = ?3,
                     channel = ?4, message = ?5, subject = ?6, step_condition = ?7, condition_value = ?8,
                     requires_approval = ?9, fallback_step = ?10
                     WHERE id = ?11 AND sequence_id = ?12",
                    params![
                        step.order,
                        step.day_offset,
                        step.minute_offset,
                        step.channel.as_str(),
                        step.message,
                        step.subject,
                        step.condition.as_str(),
                        step.condition_value,
                        step.requires_approval,
                        step.fallback_step,
                        step.id,
                        sequence_id,
                    ],
                )
                .map_err(|e| DriplineError::Database(format!("Renumber phase 2 ({}): {e}", step.id)))?;
            } else {
                self.insert_step(step)?;
            }
        }
        Ok(())
    }

    // ─── Instances ───────────────────────────────────────────

    fn insert_instance(&self, inst: &Instance) -> Result<()> {
        self.execute(
            "INSERT INTO sequence_instances
             (id, workspace_id, lead_id, sequence_id, status, current_step, started_at,
              last_step_at, next_step_due, paused_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                inst.id,
                inst.workspace_id,
                inst.lead_id,
                inst.sequence_id,
                inst.status.as_str(),
                inst.current_step,
                ts(&inst.started_at),
                inst.last_step_at.as_ref().map(ts),
                inst.next_step_due.as_ref().map(ts),
                inst.paused_reason,
            ],
        )
        .map_err(|e| DriplineError::Database(format!("Insert instance: {e}")))?;
        Ok(())
    }

    fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        first(
            self,
            &format!("{INSTANCE_SELECT} WHERE i.id = ?1"),
            [id],
            row_to_instance,
        )
    }

    fn find_instance(&self, lead_id: &str, sequence_id: &str) -> Result<Option<Instance>> {
        first(
            self,
            &format!("{INSTANCE_SELECT} WHERE i.lead_id = ?1 AND i.sequence_id = ?2"),
            [lead_id, sequence_id],
            row_to_instance,
        )
    }

    fn update_instance(&self, inst: &Instance) -> Result<usize> {
        self.execute(
            "UPDATE sequence_instances SET status = ?1, current_step = ?2, last_step_at = ?3,
             next_step_due = ?4, paused_reason = ?5 WHERE id = ?6",
            params![
                inst.status.as_str(),
                inst.current_step,
                inst.last_step_at.as_ref().map(ts),
                inst.next_step_due.as_ref().map(ts),
                inst.paused_reason,
                inst.id,
            ],
        )
        .map_err(|e| DriplineError::Database(format!("Update instance: {e}")))
    }

    /// Compare-and-set on `(status, current_step, next_step_due)`.
    fn swap_instance(&self, expected: &Instance, next: &Instance) -> Result<bool> {
        let changed = self
            .execute(
                "UPDATE sequence_instances SET status = ?1, current_step = ?2, last_step_at = ?3,
                 next_step_due = ?4, paused_reason = ?5
                 WHERE id = ?6 AND status = ?7 AND current_step = ?8 AND next_step_due IS ?9",
                params![
                    next.status.as_str(),
                    next.current_step,
                    next.last_step_at.as_ref().map(ts),
                    next.next_step_due.as_ref().map(ts),
                    next.paused_reason,
                    expected.id,
                    expected.status.as_str(),
                    expected.current_step,
                    expected.next_step_due.as_ref().map(ts),
                ],
            )
            .map_err(|e| DriplineError::Database(format!("Swap instance: {e}")))?;
        Ok(changed == 1)
    }

    fn delete_instance(&self, id: &str) -> Result<usize> {
        self.execute("DELETE FROM sequence_instances WHERE id = ?1", [id])
            .map_err(|e| DriplineError::Database(format!("Delete instance: {e}")))
    }

    fn list_instances(&self, sequence_id: &str) -> Result<Vec<Instance>> {
        collect(
            self,
            &format!("{INSTANCE_SELECT} WHERE i.sequence_id = ?1 ORDER BY i.id"),
            [sequence_id],
            row_to_instance,
        )
    }

    fn list_lead_instances(&self, lead_id: &str) -> Result<Vec<Instance>> {
        collect(
            self,
            &format!("{INSTANCE_SELECT} WHERE i.lead_id = ?1 ORDER BY i.started_at, i.id"),
            [lead_id],
            row_to_instance,
        )
    }

    fn list_workspace_instances(&self, workspace_id: &str) -> Result<Vec<Instance>> {
        collect(
            self,
            &format!("{INSTANCE_SELECT} WHERE i.workspace_id = ?1 ORDER BY i.id"),
            [workspace_id],
            row_to_instance,
        )
    }

    fn count_instances(&self, sequence_id: &str) -> Result<usize> {
        self.query_row(
            "SELECT COUNT(*) FROM sequence_instances WHERE sequence_id = ?1",
            [sequence_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .map_err(DriplineError::db)
    }

    /// Active instances whose due-date has passed, on active sequences,
    /// in id order after `after_id`.
    fn due_instances(
        &self,
        now: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Instance>> {
        collect(
            self,
            &format!(
                "{INSTANCE_SELECT} JOIN sequences s ON s.id = i.sequence_id
                 WHERE i.status = 'active' AND s.active = 1
                   AND i.next_step_due IS NOT NULL AND i.next_step_due <= ?1
                   AND (?2 IS NULL OR i.id > ?2)
                 ORDER BY i.id LIMIT ?3"
            ),
            params![ts(&now), after_id, limit as i64],
            row_to_instance,
        )
    }

    // ─── Tasks ───────────────────────────────────────────────

    fn insert_task(&self, task: &PendingTask) -> Result<()> {
        self.execute(
            "INSERT INTO sequence_tasks
             (id, instance_id, step_order, lead_id, workspace_id, channel, status, message, subject,
              due_at, created_at, sent_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                task.id,
                task.instance_id,
                task.step_order,
                task.lead_id,
                task.workspace_id,
                task.channel.as_str(),
                task.status.as_str(),
                task.message,
                task.subject,
                ts(&task.due_at),
                ts(&task.created_at),
                task.sent_at.as_ref().map(ts),
                task.error,
            ],
        )
        .map_err(|e| DriplineError::Database(format!("Insert task: {e}")))?;
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<PendingTask>> {
        first(self, &format!("{TASK_SELECT} WHERE id = ?1"), [id], row_to_task)
    }

    fn update_task(&self, task: &PendingTask) -> Result<usize> {
        self.execute(
            "UPDATE sequence_tasks SET instance_id = ?1, step_order = ?2, status = ?3, message = ?4,
             subject = ?5, sent_at = ?6, error = ?7 WHERE id = ?8",
            params![
                task.instance_id,
                task.step_order,
                task.status.as_str(),
                task.message,
                task.subject,
                task.sent_at.as_ref().map(ts),
                task.error,
                task.id,
            ],
        )
        .map_err(|e| DriplineError::Database(format!("Update task: {e}")))
    }

    fn transition_task(&self, id: &str, from: TaskStatus, to: TaskStatus) -> Result<bool> {
        let changed = self
            .execute(
                "UPDATE sequence_tasks SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![to.as_str(), id, from.as_str()],
            )
            .map_err(|e| DriplineError::Database(format!("Transition task: {e}")))?;
        Ok(changed == 1)
    }

    /// Record a dispatch result: `Ok(sent_at)` or `Err(reason)`.
    fn finish_task(&self, id: &str, outcome: std::result::Result<DateTime<Utc>, String>) -> Result<()> {
        let (status, sent_at, error) = match outcome {
            Ok(at) => (TaskStatus::Sent, Some(ts(&at)), None),
            Err(reason) => (TaskStatus::Failed, None, Some(reason)),
        };
        self.execute(
            "UPDATE sequence_tasks SET status = ?1, sent_at = ?2, error = ?3 WHERE id = ?4",
            params![status.as_str(), sent_at, error, id],
        )
        .map_err(|e| DriplineError::Database(format!("Finish task: {e}")))?;
        Ok(())
    }

    /// `queued → sending` for one flush. `false` when another flush won.
    fn claim_task(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .execute(
                "UPDATE sequence_tasks SET status = 'sending', claimed_at = ?1 WHERE id = ?2 AND status = 'queued'",
                params![ts(&now), id],
            )
            .map_err(|e| DriplineError::Database(format!("Claim task: {e}")))?;
        Ok(changed == 1)
    }

    /// Put tasks stuck in `sending` back in the outbox. A claim without a
    /// timestamp predates the column and always counts as stale.
    fn reclaim_stale_sending(&self, claimed_before: DateTime<Utc>) -> Result<usize> {
        self.execute(
            "UPDATE sequence_tasks SET status = 'queued', claimed_at = NULL
             WHERE status = 'sending' AND (claimed_at IS NULL OR claimed_at < ?1)",
            [ts(&claimed_before)],
        )
        .map_err(|e| DriplineError::Database(format!("Reclaim tasks: {e}")))
    }

    fn list_instance_tasks(&self, instance_id: &str) -> Result<Vec<PendingTask>> {
        collect(
            self,
            &format!("{TASK_SELECT} WHERE instance_id = ?1 ORDER BY created_at, id"),
            [instance_id],
            row_to_task,
        )
    }

    fn list_workspace_tasks(&self, workspace_id: &str, status: TaskStatus) -> Result<Vec<PendingTask>> {
        collect(
            self,
            &format!("{TASK_SELECT} WHERE workspace_id = ?1 AND status = ?2 ORDER BY id"),
            [workspace_id, status.as_str()],
            row_to_task,
        )
    }

    fn queued_tasks(&self, limit: usize) -> Result<Vec<PendingTask>> {
        collect(
            self,
            &format!("{TASK_SELECT} WHERE status = 'queued' ORDER BY due_at, id LIMIT ?1"),
            [limit as i64],
            row_to_task,
        )
    }

    fn detach_instance_tasks(&self, instance_id: &str) -> Result<usize> {
        self.execute(
            "UPDATE sequence_tasks SET instance_id = NULL, step_order = NULL WHERE instance_id = ?1",
            [instance_id],
        )
        .map_err(|e| DriplineError::Database(format!("Detach tasks: {e}")))
    }

    // ─── Leads ───────────────────────────────────────────────

    fn upsert_lead(&self, lead: &LeadSnapshot) -> Result<()> {
        let fields = serde_json::to_string(&lead.fields)?;
        self.execute(
            "INSERT OR REPLACE INTO leads
             (id, workspace_id, has_phone, linkedin_connected, has_replied, email_opened, fields, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                lead.lead_id,
                lead.workspace_id,
                lead.capabilities.has_phone,
                lead.capabilities.has_linkedin_connection,
                lead.capabilities.has_replied,
                lead.capabilities.has_opened_email,
                fields,
                ts(&Utc::now()),
            ],
        )
        .map_err(|e| DriplineError::Database(format!("Upsert lead: {e}")))?;
        Ok(())
    }

    fn get_lead(&self, id: &str) -> Result<Option<LeadSnapshot>> {
        let row = first(
            self,
            "SELECT id, workspace_id, has_phone, linkedin_connected, has_replied, email_opened, fields
             FROM leads WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    LeadSnapshot {
                        lead_id: row.get(0)?,
                        workspace_id: row.get(1)?,
                        capabilities: LeadCapabilities {
                            has_phone: row.get(2)?,
                            has_linkedin_connection: row.get(3)?,
                            has_replied: row.get(4)?,
                            has_opened_email: row.get(5)?,
                        },
                        fields: HashMap::new(),
                    },
                    row.get::<_, String>(6)?,
                ))
            },
        )?;
        match row {
            Some((mut lead, fields)) => {
                lead.fields = serde_json::from_str(&fields).unwrap_or_else(|e| {
                    tracing::warn!("⚠️ Lead {id} has unreadable fields: {e}");
                    HashMap::new()
                });
                Ok(Some(lead))
            }
            None => Ok(None),
        }
    }

    // ─── Cursors ─────────────────────────────────────────────

    fn get_cursor(&self, job: &str) -> Result<Option<String>> {
        first(
            self,
            "SELECT cursor FROM batch_cursors WHERE job = ?1",
            [job],
            |row| row.get(0),
        )
    }

    fn set_cursor(&self, job: &str, cursor: &str) -> Result<()> {
        self.execute(
            "INSERT OR REPLACE INTO batch_cursors (job, cursor, updated_at) VALUES (?1, ?2, ?3)",
            params![job, cursor, ts(&Utc::now())],
        )
        .map_err(|e| DriplineError::Database(format!("Set cursor: {e}")))?;
        Ok(())
    }

    fn clear_cursor(&self, job: &str) -> Result<()> {
        self.execute("DELETE FROM batch_cursors WHERE job = ?1", [job])
            .map_err(|e| DriplineError::Database(format!("Clear cursor: {e}")))?;
        Ok(())
    }
}

/// Instance + task writes of one advance, as a single unit.
///
/// Returns `false` (and writes nothing) when the instance moved since it was
/// read, e.g. an overlapping tick got there first.
pub fn commit_advance(
    tx: &Transaction<'_>,
    before: &Instance,
    after: &Instance,
    tasks: &[PendingTask],
) -> Result<bool> {
    if !tx.swap_instance(before, after)? {
        return Ok(false);
    }
    for task in tasks {
        tx.insert_task(task)?;
    }
    Ok(true)
}
