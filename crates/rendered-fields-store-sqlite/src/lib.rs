#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rendered_fields_core::{
    fields_from_json, fields_to_json, format_rfc3339, now_utc, RenderedFields, RenderedSnapshot,
    RunIdentity, RunKey, SnapshotStore, UNMAPPED_INDEX,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use ulid::Ulid;

const SNAPSHOT_MIGRATION_VERSION: i64 = 1;

const SCHEMA_SNAPSHOT_V1: &str = r"
CREATE TABLE IF NOT EXISTS rendered_snapshots (
  snapshot_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  snapshot_id TEXT NOT NULL UNIQUE,
  workflow_id TEXT NOT NULL CHECK (length(workflow_id) > 0),
  task_id TEXT NOT NULL CHECK (length(task_id) > 0),
  run_key TEXT NOT NULL CHECK (length(run_key) > 0),
  map_index INTEGER NOT NULL DEFAULT -1 CHECK (map_index >= -1),
  rendered_fields_json TEXT NOT NULL,
  pod_spec_json TEXT,
  created_at TEXT NOT NULL,
  UNIQUE (workflow_id, task_id, run_key, map_index)
);

CREATE INDEX IF NOT EXISTS idx_rendered_snapshots_group_recency
  ON rendered_snapshots(workflow_id, task_id, created_at DESC, snapshot_seq DESC);
";

const SELECT_SNAPSHOT_COLUMNS: &str = "SELECT
    snapshot_id, workflow_id, task_id, run_key, map_index,
    rendered_fields_json, pod_spec_json, created_at
 FROM rendered_snapshots";

// Run keys are ranked by their newest write; every map index of a run key
// outside the top `keep` is removed in the same statement.
const PRUNE_SNAPSHOTS_SQL: &str = "DELETE FROM rendered_snapshots
 WHERE workflow_id = ?1 AND task_id = ?2
   AND run_key NOT IN (
     SELECT run_key
     FROM rendered_snapshots
     WHERE workflow_id = ?1 AND task_id = ?2
     GROUP BY run_key
     ORDER BY MAX(created_at) DESC, MAX(snapshot_seq) DESC
     LIMIT ?3
   )";

pub struct SqliteSnapshotStore {
    conn: Connection,
}

impl SqliteSnapshotStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Opens `path` and applies the snapshot schema.
    pub fn open_and_migrate(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SNAPSHOT_V1)
            .context("failed to apply rendered snapshot schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SNAPSHOT_MIGRATION_VERSION, now],
            )
            .context("failed to register rendered snapshot schema migration")?;

        Ok(())
    }

    /// Writes a snapshot with an explicit creation time.
    ///
    /// Any previous snapshot for the identity is replaced inside one
    /// immediate transaction, so concurrent writers of the same identity
    /// serialize and the survivor is one complete write.
    pub fn write_at(
        &mut self,
        identity: &RunIdentity,
        rendered_fields: &RenderedFields,
        pod_spec_snapshot: Option<&RenderedFields>,
        created_at: OffsetDateTime,
    ) -> Result<RenderedSnapshot> {
        identity
            .validate()
            .map_err(|err| anyhow!("snapshot identity validation failed: {err}"))?;

        let snapshot_id = Ulid::new();
        let created_at = created_at.to_offset(UtcOffset::UTC);
        let rendered_fields_json = serde_json::to_string(&fields_to_json(rendered_fields))
            .context("failed to serialize rendered_fields")?;
        let pod_spec_json = match pod_spec_snapshot {
            Some(spec) => Some(
                serde_json::to_string(&fields_to_json(spec))
                    .context("failed to serialize pod_spec_snapshot")?,
            ),
            None => None,
        };

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start snapshot transaction")?;

        tx.execute(
            "DELETE FROM rendered_snapshots
             WHERE workflow_id = ?1 AND task_id = ?2 AND run_key = ?3 AND map_index = ?4",
            params![
                identity.workflow_id,
                identity.task_id,
                identity.run_key.as_str(),
                identity.stored_map_index(),
            ],
        )
        .context("failed to clear previous snapshot")?;

        tx.execute(
            "INSERT INTO rendered_snapshots(
                snapshot_id, workflow_id, task_id, run_key, map_index,
                rendered_fields_json, pod_spec_json, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot_id.to_string(),
                identity.workflow_id,
                identity.task_id,
                identity.run_key.as_str(),
                identity.stored_map_index(),
                rendered_fields_json,
                pod_spec_json,
                format_created_at(created_at)?,
            ],
        )
        .context("failed to insert rendered snapshot")?;

        tx.commit().context("failed to commit snapshot transaction")?;

        tracing::debug!(
            identity = %identity,
            %snapshot_id,
            fields = rendered_fields.len(),
            "wrote rendered snapshot"
        );

        Ok(RenderedSnapshot {
            snapshot_id,
            identity: identity.clone(),
            rendered_fields: rendered_fields.clone(),
            pod_spec_snapshot: pod_spec_snapshot.cloned(),
            created_at,
        })
    }

    pub fn get_snapshot(&self, identity: &RunIdentity) -> Result<Option<RenderedSnapshot>> {
        self.conn
            .query_row(
                &format!(
                    "{SELECT_SNAPSHOT_COLUMNS}
                     WHERE workflow_id = ?1 AND task_id = ?2 AND run_key = ?3 AND map_index = ?4"
                ),
                params![
                    identity.workflow_id,
                    identity.task_id,
                    identity.run_key.as_str(),
                    identity.stored_map_index(),
                ],
                parse_snapshot_row,
            )
            .optional()
            .context("failed to load rendered snapshot")
    }

    /// Snapshots of one workflow, optionally narrowed to a task, newest first.
    pub fn list_snapshots(
        &self,
        workflow_id: &str,
        task_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RenderedSnapshot>> {
        let mut query = format!(
            "{SELECT_SNAPSHOT_COLUMNS}
             WHERE workflow_id = ?1 AND (?2 IS NULL OR task_id = ?2)
             ORDER BY created_at DESC, snapshot_seq DESC"
        );

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self
            .conn
            .prepare(&query)
            .context("failed to prepare snapshot listing")?;
        let rows = stmt.query_map(params![workflow_id, task_id], parse_snapshot_row)?;

        collect_rows(rows)
    }

    pub fn count_snapshots(&self, workflow_id: &str, task_id: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM rendered_snapshots WHERE workflow_id = ?1 AND task_id = ?2",
                params![workflow_id, task_id],
                |row| row.get(0),
            )
            .context("failed to count rendered snapshots")?;

        usize::try_from(count).map_err(|_| anyhow!("invalid snapshot count: {count}"))
    }

    fn load_fields_column(
        &self,
        column: &str,
        identity: &RunIdentity,
    ) -> Result<Option<Option<String>>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {column} FROM rendered_snapshots
                     WHERE workflow_id = ?1 AND task_id = ?2 AND run_key = ?3 AND map_index = ?4"
                ),
                params![
                    identity.workflow_id,
                    identity.task_id,
                    identity.run_key.as_str(),
                    identity.stored_map_index(),
                ],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .with_context(|| format!("failed to load {column}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }

    #[cfg(test)]
    fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn write_snapshot(
        &mut self,
        identity: &RunIdentity,
        rendered_fields: &RenderedFields,
        pod_spec_snapshot: Option<&RenderedFields>,
    ) -> Result<RenderedSnapshot> {
        self.write_at(identity, rendered_fields, pod_spec_snapshot, now_utc())
    }

    fn get_rendered_fields(&self, identity: &RunIdentity) -> Result<Option<RenderedFields>> {
        match self.load_fields_column("rendered_fields_json", identity)? {
            Some(Some(raw)) => decode_fields(&raw, "rendered_fields_json").map(Some),
            Some(None) => Err(anyhow!("rendered_fields_json is NULL for {identity}")),
            None => Ok(None),
        }
    }

    fn get_pod_spec_snapshot(&self, identity: &RunIdentity) -> Result<Option<RenderedFields>> {
        match self.load_fields_column("pod_spec_json", identity)? {
            Some(Some(raw)) => decode_fields(&raw, "pod_spec_json").map(Some),
            Some(None) | None => Ok(None),
        }
    }

    fn delete_snapshot(&mut self, identity: &RunIdentity) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM rendered_snapshots
                 WHERE workflow_id = ?1 AND task_id = ?2 AND run_key = ?3 AND map_index = ?4",
                params![
                    identity.workflow_id,
                    identity.task_id,
                    identity.run_key.as_str(),
                    identity.stored_map_index(),
                ],
            )
            .context("failed to delete rendered snapshot")?;

        Ok(deleted > 0)
    }

    fn prune_old_snapshots(&mut self, workflow_id: &str, task_id: &str, keep: i64) -> Result<usize> {
        if keep <= 0 {
            return Ok(0);
        }

        let deleted = self
            .conn
            .execute(PRUNE_SNAPSHOTS_SQL, params![workflow_id, task_id, keep])
            .context("failed to prune rendered snapshots")?;

        if deleted > 0 {
            tracing::info!(workflow_id, task_id, keep, deleted, "pruned rendered snapshots");
        }

        Ok(deleted)
    }
}

fn format_created_at(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .context("failed to format created_at")
}

fn parse_created_at(raw: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(
        raw,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"),
    )
    .ok()
    .map(PrimitiveDateTime::assume_utc)
}

fn decode_fields(raw: &str, column: &str) -> Result<RenderedFields> {
    let value: serde_json::Value =
        serde_json::from_str(raw).with_context(|| format!("failed to parse {column}"))?;
    fields_from_json(value).map_err(|err| anyhow!("invalid {column}: {err}"))
}

fn parse_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RenderedSnapshot> {
    let snapshot_id_raw: String = row.get(0)?;
    let map_index_raw: i64 = row.get(4)?;
    let rendered_fields_raw: String = row.get(5)?;
    let pod_spec_raw: Option<String> = row.get(6)?;
    let created_at_raw: String = row.get(7)?;

    let snapshot_id = Ulid::from_string(&snapshot_id_raw).map_err(|err| {
        invalid_column(0, rusqlite::types::Type::Text, format!("invalid snapshot_id: {err}"))
    })?;

    let map_index = if map_index_raw == UNMAPPED_INDEX {
        None
    } else {
        Some(u32::try_from(map_index_raw).map_err(|_| {
            invalid_column(
                4,
                rusqlite::types::Type::Integer,
                format!("invalid map_index: {map_index_raw}"),
            )
        })?)
    };

    let rendered_fields = decode_fields(&rendered_fields_raw, "rendered_fields_json")
        .map_err(|err| invalid_column(5, rusqlite::types::Type::Text, format!("{err:#}")))?;

    let pod_spec_snapshot = match pod_spec_raw {
        Some(raw) => Some(
            decode_fields(&raw, "pod_spec_json")
                .map_err(|err| invalid_column(6, rusqlite::types::Type::Text, format!("{err:#}")))?,
        ),
        None => None,
    };

    let created_at = parse_created_at(&created_at_raw).ok_or_else(|| {
        invalid_column(
            7,
            rusqlite::types::Type::Text,
            format!("invalid created_at: {created_at_raw}"),
        )
    })?;

    Ok(RenderedSnapshot {
        snapshot_id,
        identity: RunIdentity {
            workflow_id: row.get(1)?,
            task_id: row.get(2)?,
            run_key: RunKey::new(row.get::<_, String>(3)?),
            map_index,
        },
        rendered_fields,
        pod_spec_snapshot,
        created_at,
    })
}

fn invalid_column(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.context("failed to decode rendered snapshot row")?);
    }
    Ok(values)
}
