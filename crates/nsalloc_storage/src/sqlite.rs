#![forbid(unsafe_code)]

//! `SQLite` backend. Each [`AllocationStore::transaction`] opens an IMMEDIATE
//! transaction so concurrent allocator processes serialize their writes on the
//! database file rather than on anything in-process.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nsalloc_contracts::allocation::{
    AllocationRecord, AllocationRecordInput, AllocationStatus, AvailabilityStatus, NamespaceName,
    NamespaceRecord, PrefixClass, Priority, SequenceId,
};
use nsalloc_contracts::request::{Fingerprint, RegistryMode, RequestIdentity, WorkloadKind};
use nsalloc_contracts::Validate;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, warn};

use crate::ledger::{is_allowed_status_transition, AllocationStore, AllocationTx, StorageError};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS namespace (
    name                TEXT PRIMARY KEY,
    availability_status TEXT NOT NULL,
    allocation_lock     INTEGER NOT NULL DEFAULT 0,
    locked_at_ms        INTEGER
);
CREATE TABLE IF NOT EXISTS allocation_record (
    sequence_id            INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint            TEXT NOT NULL UNIQUE,
    workload_kind          TEXT NOT NULL,
    release_tag            TEXT NOT NULL,
    ancillary_release_tag  TEXT NOT NULL,
    csar                   INTEGER NOT NULL,
    service_mesh_injection INTEGER NOT NULL,
    registry_mode          TEXT NOT NULL,
    internal_feature_set   INTEGER NOT NULL,
    occ                    INTEGER NOT NULL,
    pcf                    INTEGER NOT NULL,
    converged              INTEGER NOT NULL,
    pcrf                   INTEGER NOT NULL,
    tls_version            TEXT NOT NULL,
    rollback               INTEGER NOT NULL,
    official_build         INTEGER NOT NULL,
    custom_message         TEXT NOT NULL,
    status                 TEXT NOT NULL,
    namespace              TEXT UNIQUE,
    priority               TEXT NOT NULL,
    owner                  TEXT,
    pipeline_reference     TEXT,
    cpu_estimate           REAL NOT NULL,
    registered_at_ms       INTEGER NOT NULL,
    queue_timestamp_ms     INTEGER
);
CREATE INDEX IF NOT EXISTS idx_allocation_record_status_priority
    ON allocation_record (status, priority);
";

const RECORD_COLUMNS: &str = "sequence_id, fingerprint, workload_kind, release_tag, \
    ancillary_release_tag, csar, service_mesh_injection, registry_mode, internal_feature_set, \
    occ, pcf, converged, pcrf, tls_version, rollback, official_build, custom_message, status, \
    namespace, priority, owner, pipeline_reference, cpu_estimate, registered_at_ms, \
    queue_timestamp_ms";

const NAMESPACE_COLUMNS: &str = "name, availability_status, allocation_lock, locked_at_ms";

#[derive(Debug)]
pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }
}

impl AllocationStore for SqliteLedgerStore {
    fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut dyn AllocationTx) -> Result<T, E>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| E::from(StorageError::from(e)))?;
        let result = {
            let mut view = SqliteTx { conn: &tx };
            f(&mut view)
        };
        match result {
            Ok(v) => {
                tx.commit().map_err(|e| E::from(StorageError::from(e)))?;
                Ok(v)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "sqlite rollback failed");
                } else {
                    debug!("sqlite transaction rolled back");
                }
                Err(e)
            }
        }
    }
}

struct SqliteTx<'c> {
    conn: &'c Connection,
}

/// Sequence ids past `i64::MAX` cannot exist in the table.
fn sql_id(id: SequenceId) -> Result<i64, StorageError> {
    i64::try_from(id.0).map_err(|_| StorageError::NotFound {
        table: "allocation_record",
        key: id.to_string(),
    })
}

fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(table: &'static str, ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StorageError::CorruptRow {
        table,
        detail: format!("timestamp out of range: {ms}"),
    })
}

/// Raw column values as read from `allocation_record`; converted to the typed record afterwards.
struct RecordRow {
    sequence_id: i64,
    fingerprint: String,
    workload_kind: String,
    release_tag: String,
    ancillary_release_tag: String,
    csar: bool,
    service_mesh_injection: bool,
    registry_mode: String,
    internal_feature_set: bool,
    occ: bool,
    pcf: bool,
    converged: bool,
    pcrf: bool,
    tls_version: String,
    rollback: bool,
    official_build: bool,
    custom_message: String,
    status: String,
    namespace: Option<String>,
    priority: String,
    owner: Option<String>,
    pipeline_reference: Option<String>,
    cpu_estimate: f64,
    registered_at_ms: i64,
    queue_timestamp_ms: Option<i64>,
}

impl RecordRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence_id: row.get("sequence_id")?,
            fingerprint: row.get("fingerprint")?,
            workload_kind: row.get("workload_kind")?,
            release_tag: row.get("release_tag")?,
            ancillary_release_tag: row.get("ancillary_release_tag")?,
            csar: row.get("csar")?,
            service_mesh_injection: row.get("service_mesh_injection")?,
            registry_mode: row.get("registry_mode")?,
            internal_feature_set: row.get("internal_feature_set")?,
            occ: row.get("occ")?,
            pcf: row.get("pcf")?,
            converged: row.get("converged")?,
            pcrf: row.get("pcrf")?,
            tls_version: row.get("tls_version")?,
            rollback: row.get("rollback")?,
            official_build: row.get("official_build")?,
            custom_message: row.get("custom_message")?,
            status: row.get("status")?,
            namespace: row.get("namespace")?,
            priority: row.get("priority")?,
            owner: row.get("owner")?,
            pipeline_reference: row.get("pipeline_reference")?,
            cpu_estimate: row.get("cpu_estimate")?,
            registered_at_ms: row.get("registered_at_ms")?,
            queue_timestamp_ms: row.get("queue_timestamp_ms")?,
        })
    }

    fn into_record(self) -> Result<AllocationRecord, StorageError> {
        const TABLE: &str = "allocation_record";
        let identity = RequestIdentity {
            workload_kind: WorkloadKind::parse(&self.workload_kind)?,
            release_tag: self.release_tag,
            ancillary_release_tag: self.ancillary_release_tag,
            csar: self.csar,
            service_mesh_injection: self.service_mesh_injection,
            registry_mode: RegistryMode::parse(&self.registry_mode)?,
            internal_feature_set: self.internal_feature_set,
            occ: self.occ,
            pcf: self.pcf,
            converged: self.converged,
            pcrf: self.pcrf,
            tls_version: self.tls_version,
            rollback: self.rollback,
            official_build: self.official_build,
            custom_message: self.custom_message,
        };
        let fingerprint = Fingerprint::from_hex(self.fingerprint)?;
        if identity.fingerprint() != fingerprint {
            return Err(StorageError::CorruptRow {
                table: TABLE,
                detail: format!("fingerprint mismatch for sequence_id={}", self.sequence_id),
            });
        }
        Ok(AllocationRecord {
            sequence_id: SequenceId(u64::try_from(self.sequence_id).map_err(|_| {
                StorageError::CorruptRow {
                    table: TABLE,
                    detail: format!("negative sequence_id {}", self.sequence_id),
                }
            })?),
            fingerprint,
            identity,
            status: AllocationStatus::parse(&self.status)?,
            namespace: self.namespace.map(NamespaceName::new).transpose()?,
            priority: Priority::parse(&self.priority)?,
            owner: self.owner,
            pipeline_reference: self.pipeline_reference,
            cpu_estimate: self.cpu_estimate,
            registered_at: from_ms(TABLE, self.registered_at_ms)?,
            queue_timestamp: self
                .queue_timestamp_ms
                .map(|ms| from_ms(TABLE, ms))
                .transpose()?,
        })
    }
}

struct NamespaceRow {
    name: String,
    availability_status: String,
    allocation_lock: bool,
    locked_at_ms: Option<i64>,
}

impl NamespaceRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get("name")?,
            availability_status: row.get("availability_status")?,
            allocation_lock: row.get("allocation_lock")?,
            locked_at_ms: row.get("locked_at_ms")?,
        })
    }

    fn into_record(self) -> Result<NamespaceRecord, StorageError> {
        Ok(NamespaceRecord {
            name: NamespaceName::new(self.name)?,
            availability: AvailabilityStatus::parse(&self.availability_status)?,
            allocation_lock: self.allocation_lock,
            locked_at: self
                .locked_at_ms
                .map(|ms| from_ms("namespace", ms))
                .transpose()?,
        })
    }
}

impl SqliteTx<'_> {
    fn query_record(
        &self,
        where_clause: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Option<AllocationRecord>, StorageError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM allocation_record WHERE {where_clause}");
        let row = self
            .conn
            .query_row(&sql, [param], RecordRow::read)
            .optional()?;
        row.map(RecordRow::into_record).transpose()
    }

    fn require_record(&self, id: SequenceId) -> Result<AllocationRecord, StorageError> {
        self.get_record(id)?.ok_or_else(|| StorageError::NotFound {
            table: "allocation_record",
            key: id.to_string(),
        })
    }

    fn require_namespace(&self, name: &NamespaceName) -> Result<NamespaceRecord, StorageError> {
        self.namespace(name)?.ok_or_else(|| StorageError::NotFound {
            table: "namespace",
            key: name.to_string(),
        })
    }

    fn ensure_namespace_free_for(
        &self,
        namespace: &NamespaceName,
        id: Option<SequenceId>,
    ) -> Result<(), StorageError> {
        if let Some(holder) = self.find_by_namespace(namespace)? {
            if Some(holder.sequence_id) != id {
                return Err(StorageError::NamespaceConflict {
                    namespace: namespace.to_string(),
                    reason: "already bound to another record",
                });
            }
        }
        Ok(())
    }

    fn set_namespace_state(
        &self,
        name: &NamespaceName,
        availability: AvailabilityStatus,
        lock: bool,
        locked_at: Option<DateTime<Utc>>,
    ) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "UPDATE namespace SET availability_status = ?1, allocation_lock = ?2, locked_at_ms = ?3
             WHERE name = ?4",
            params![
                availability.as_str(),
                lock,
                locked_at.map(to_ms),
                name.as_str()
            ],
        )?)
    }
}

impl AllocationTx for SqliteTx<'_> {
    fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<AllocationRecord>, StorageError> {
        self.query_record("fingerprint = ?1", &fingerprint.as_str())
    }

    fn find_by_namespace(
        &self,
        namespace: &NamespaceName,
    ) -> Result<Option<AllocationRecord>, StorageError> {
        self.query_record("namespace = ?1", &namespace.as_str())
    }

    fn get_record(&self, id: SequenceId) -> Result<Option<AllocationRecord>, StorageError> {
        self.query_record("sequence_id = ?1", &sql_id(id)?)
    }

    fn records(&self) -> Result<Vec<AllocationRecord>, StorageError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM allocation_record ORDER BY sequence_id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], RecordRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    fn create_record(
        &mut self,
        input: AllocationRecordInput,
    ) -> Result<AllocationRecord, StorageError> {
        input.validate()?;
        let fingerprint = input.fingerprint();
        if self.find_by_fingerprint(&fingerprint)?.is_some() {
            return Err(StorageError::DuplicateKey {
                table: "allocation_record",
                key: fingerprint.to_string(),
            });
        }
        if let Some(ns) = &input.namespace {
            self.ensure_namespace_free_for(ns, None)?;
        }
        let id = &input.identity;
        self.conn.execute(
            "INSERT INTO allocation_record (
                fingerprint, workload_kind, release_tag, ancillary_release_tag, csar,
                service_mesh_injection, registry_mode, internal_feature_set, occ, pcf, converged,
                pcrf, tls_version, rollback, official_build, custom_message, status, namespace,
                priority, owner, pipeline_reference, cpu_estimate, registered_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                       ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            params![
                fingerprint.as_str(),
                id.workload_kind.as_str(),
                id.release_tag,
                id.ancillary_release_tag,
                id.csar,
                id.service_mesh_injection,
                id.registry_mode.as_str(),
                id.internal_feature_set,
                id.occ,
                id.pcf,
                id.converged,
                id.pcrf,
                id.tls_version,
                id.rollback,
                id.official_build,
                id.custom_message,
                input.status.as_str(),
                input.namespace.as_ref().map(NamespaceName::as_str),
                input.priority.as_str(),
                input.owner,
                input.pipeline_reference,
                input.cpu_estimate,
                to_ms(input.now),
            ],
        )?;
        let rowid = self.conn.last_insert_rowid();
        self.query_record("sequence_id = ?1", &rowid)?
            .ok_or_else(|| StorageError::NotFound {
                table: "allocation_record",
                key: rowid.to_string(),
            })
    }

    fn transition(
        &mut self,
        id: SequenceId,
        to: AllocationStatus,
        now: DateTime<Utc>,
    ) -> Result<AllocationRecord, StorageError> {
        let current = self.require_record(id)?;
        if !is_allowed_status_transition(current.status, to) {
            return Err(StorageError::InvalidTransition {
                sequence_id: id,
                from: current.status,
                to,
            });
        }
        let raw_id = sql_id(id)?;
        match to {
            AllocationStatus::Queued => {
                self.conn.execute(
                    "UPDATE allocation_record
                     SET status = ?1, queue_timestamp_ms = COALESCE(queue_timestamp_ms, ?2)
                     WHERE sequence_id = ?3",
                    params![to.as_str(), to_ms(now), raw_id],
                )?;
            }
            AllocationStatus::YetToAssign => {
                self.conn.execute(
                    "UPDATE allocation_record
                     SET status = ?1, namespace = NULL, queue_timestamp_ms = NULL,
                         registered_at_ms = ?2
                     WHERE sequence_id = ?3",
                    params![to.as_str(), to_ms(now), raw_id],
                )?;
            }
            AllocationStatus::Assigned | AllocationStatus::Hardcode => {
                self.conn.execute(
                    "UPDATE allocation_record SET status = ?1 WHERE sequence_id = ?2",
                    params![to.as_str(), raw_id],
                )?;
            }
        }
        self.require_record(id)
    }

    fn bind_namespace(
        &mut self,
        id: SequenceId,
        namespace: &NamespaceName,
        pipeline_reference: Option<&str>,
    ) -> Result<AllocationRecord, StorageError> {
        self.ensure_namespace_free_for(namespace, Some(id))?;
        let current = self.require_record(id)?;
        if !is_allowed_status_transition(current.status, AllocationStatus::Assigned) {
            return Err(StorageError::InvalidTransition {
                sequence_id: id,
                from: current.status,
                to: AllocationStatus::Assigned,
            });
        }
        self.conn.execute(
            "UPDATE allocation_record
             SET namespace = ?1, status = ?2,
                 pipeline_reference = COALESCE(?3, pipeline_reference)
             WHERE sequence_id = ?4",
            params![
                namespace.as_str(),
                AllocationStatus::Assigned.as_str(),
                pipeline_reference,
                sql_id(id)?
            ],
        )?;
        self.require_record(id)
    }

    fn record_pipeline_reference(
        &mut self,
        id: SequenceId,
        pipeline_reference: &str,
    ) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "UPDATE allocation_record SET pipeline_reference = ?1 WHERE sequence_id = ?2",
            params![pipeline_reference, sql_id(id)?],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound {
                table: "allocation_record",
                key: id.to_string(),
            });
        }
        Ok(())
    }

    fn repin(
        &mut self,
        id: SequenceId,
        input: AllocationRecordInput,
    ) -> Result<AllocationRecord, StorageError> {
        input.validate()?;
        self.require_record(id)?;
        let fingerprint = input.fingerprint();
        if let Some(other) = self.find_by_fingerprint(&fingerprint)? {
            if other.sequence_id != id {
                return Err(StorageError::DuplicateKey {
                    table: "allocation_record",
                    key: fingerprint.to_string(),
                });
            }
        }
        if let Some(ns) = &input.namespace {
            self.ensure_namespace_free_for(ns, Some(id))?;
        }
        let ident = &input.identity;
        self.conn.execute(
            "UPDATE allocation_record SET
                fingerprint = ?1, workload_kind = ?2, release_tag = ?3,
                ancillary_release_tag = ?4, csar = ?5, service_mesh_injection = ?6,
                registry_mode = ?7, internal_feature_set = ?8, occ = ?9, pcf = ?10,
                converged = ?11, pcrf = ?12, tls_version = ?13, rollback = ?14,
                official_build = ?15, custom_message = ?16, status = ?17, namespace = ?18,
                priority = ?19, owner = ?20,
                pipeline_reference = COALESCE(?21, pipeline_reference),
                cpu_estimate = ?22, registered_at_ms = ?23, queue_timestamp_ms = NULL
             WHERE sequence_id = ?24",
            params![
                fingerprint.as_str(),
                ident.workload_kind.as_str(),
                ident.release_tag,
                ident.ancillary_release_tag,
                ident.csar,
                ident.service_mesh_injection,
                ident.registry_mode.as_str(),
                ident.internal_feature_set,
                ident.occ,
                ident.pcf,
                ident.converged,
                ident.pcrf,
                ident.tls_version,
                ident.rollback,
                ident.official_build,
                ident.custom_message,
                input.status.as_str(),
                input.namespace.as_ref().map(NamespaceName::as_str),
                input.priority.as_str(),
                input.owner,
                input.pipeline_reference,
                input.cpu_estimate,
                to_ms(input.now),
                sql_id(id)?,
            ],
        )?;
        self.require_record(id)
    }

    fn delete_by_namespace(
        &mut self,
        namespace: &NamespaceName,
    ) -> Result<Option<AllocationRecord>, StorageError> {
        let existing = self.find_by_namespace(namespace)?;
        if existing.is_some() {
            self.conn.execute(
                "DELETE FROM allocation_record WHERE namespace = ?1",
                params![namespace.as_str()],
            )?;
        }
        Ok(existing)
    }

    fn committed_cpu(&self) -> Result<f64, StorageError> {
        let sum: Option<f64> = self.conn.query_row(
            "SELECT SUM(cpu_estimate) FROM allocation_record WHERE status IN (?1, ?2)",
            params![
                AllocationStatus::Assigned.as_str(),
                AllocationStatus::Hardcode.as_str()
            ],
            |row| row.get(0),
        )?;
        Ok(sum.unwrap_or(0.0))
    }

    fn pending_cpu(
        &self,
        priorities: &[Priority],
        since: DateTime<Utc>,
    ) -> Result<f64, StorageError> {
        if priorities.is_empty() {
            return Ok(0.0);
        }
        let placeholders = (0..priorities.len())
            .map(|i| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT SUM(cpu_estimate) FROM allocation_record
             WHERE status IN (?1, ?2) AND registered_at_ms >= ?3 AND priority IN ({placeholders})"
        );
        let mut values: Vec<rusqlite::types::Value> = vec![
            AllocationStatus::YetToAssign.as_str().to_string().into(),
            AllocationStatus::Queued.as_str().to_string().into(),
            to_ms(since).into(),
        ];
        values.extend(priorities.iter().map(|p| p.as_str().to_string().into()));
        let sum: Option<f64> =
            self.conn
                .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(sum.unwrap_or(0.0))
    }

    fn older_queued_peer_exists(
        &self,
        id: SequenceId,
        priority: Priority,
        queued_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM allocation_record
                 WHERE sequence_id != ?1 AND status = ?2 AND priority = ?3
                   AND queue_timestamp_ms IS NOT NULL AND queue_timestamp_ms < ?4
                 LIMIT 1",
                params![
                    sql_id(id)?,
                    AllocationStatus::Queued.as_str(),
                    priority.as_str(),
                    to_ms(queued_at)
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn register_namespace(
        &mut self,
        name: &NamespaceName,
    ) -> Result<NamespaceRecord, StorageError> {
        if self.namespace(name)?.is_some() {
            return Err(StorageError::DuplicateKey {
                table: "namespace",
                key: name.to_string(),
            });
        }
        let row = NamespaceRecord::available(name.clone());
        self.conn.execute(
            "INSERT INTO namespace (name, availability_status, allocation_lock, locked_at_ms)
             VALUES (?1, ?2, 0, NULL)",
            params![name.as_str(), row.availability.as_str()],
        )?;
        Ok(row)
    }

    fn namespace(&self, name: &NamespaceName) -> Result<Option<NamespaceRecord>, StorageError> {
        let sql = format!("SELECT {NAMESPACE_COLUMNS} FROM namespace WHERE name = ?1");
        let row = self
            .conn
            .query_row(&sql, params![name.as_str()], NamespaceRow::read)
            .optional()?;
        row.map(NamespaceRow::into_record).transpose()
    }

    fn namespaces(&self) -> Result<Vec<NamespaceRecord>, StorageError> {
        let sql = format!("SELECT {NAMESPACE_COLUMNS} FROM namespace ORDER BY name");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], NamespaceRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(NamespaceRow::into_record).collect()
    }

    fn find_available(
        &self,
        class: &PrefixClass,
    ) -> Result<Option<NamespaceRecord>, StorageError> {
        // Prefix match done with substr rather than LIKE so '_' in a prefix is literal.
        let sql = format!(
            "SELECT {NAMESPACE_COLUMNS} FROM namespace
             WHERE availability_status = ?1 AND allocation_lock = 0
               AND substr(name, 1, ?2) = ?3
             ORDER BY name LIMIT 1"
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![
                    AvailabilityStatus::Available.as_str(),
                    class.as_str().len() as i64,
                    class.as_str()
                ],
                NamespaceRow::read,
            )
            .optional()?;
        row.map(NamespaceRow::into_record).transpose()
    }

    fn lock_namespace(
        &mut self,
        name: &NamespaceName,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if !self.require_namespace(name)?.is_allocatable() {
            return Err(StorageError::NamespaceConflict {
                namespace: name.to_string(),
                reason: "not available or already locked",
            });
        }
        self.set_namespace_state(name, AvailabilityStatus::LockedForAllocation, true, Some(now))?;
        Ok(())
    }

    fn commit_namespace(&mut self, name: &NamespaceName) -> Result<(), StorageError> {
        if !self.require_namespace(name)?.allocation_lock {
            return Err(StorageError::NamespaceConflict {
                namespace: name.to_string(),
                reason: "commit requires a held allocation lock",
            });
        }
        self.set_namespace_state(name, AvailabilityStatus::InUse, false, None)?;
        Ok(())
    }

    fn mark_in_use(&mut self, name: &NamespaceName) -> Result<bool, StorageError> {
        match self.namespace(name)? {
            None => Ok(false),
            Some(row) if row.allocation_lock => Err(StorageError::NamespaceConflict {
                namespace: name.to_string(),
                reason: "locked for allocation by another request",
            }),
            Some(_) => {
                Ok(self.set_namespace_state(name, AvailabilityStatus::InUse, false, None)? > 0)
            }
        }
    }

    fn release_namespace(&mut self, name: &NamespaceName) -> Result<(), StorageError> {
        if self.set_namespace_state(name, AvailabilityStatus::Available, false, None)? == 0 {
            return Err(StorageError::NotFound {
                table: "namespace",
                key: name.to_string(),
            });
        }
        Ok(())
    }

    fn stale_locks(
        &self,
        locked_before: DateTime<Utc>,
    ) -> Result<Vec<NamespaceRecord>, StorageError> {
        let sql = format!(
            "SELECT {NAMESPACE_COLUMNS} FROM namespace
             WHERE allocation_lock = 1 AND (locked_at_ms IS NULL OR locked_at_ms < ?1)
             ORDER BY name"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![to_ms(locked_before)], NamespaceRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(NamespaceRow::into_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn input(tag: &str, priority: Priority) -> AllocationRecordInput {
        AllocationRecordInput::v1(
            RequestIdentity::v1(WorkloadKind::Bsf, tag, false, false).unwrap(),
            AllocationStatus::YetToAssign,
            None,
            priority,
            Some("alice".to_string()),
            Some("https://ci.example/p/1".to_string()),
            50.0,
            now(),
        )
        .unwrap()
    }

    #[test]
    fn at_sqlite_01_record_columns_round_trip_by_name() {
        let mut store = SqliteLedgerStore::open_in_memory().unwrap();
        let (created, fetched) = store
            .transaction(|tx| {
                let created = tx.create_record(input("24.1.0-ocngf-1", Priority::Low))?;
                let fetched = tx.find_by_fingerprint(&created.fingerprint)?;
                Ok::<_, StorageError>((created, fetched))
            })
            .unwrap();
        assert_eq!(fetched, Some(created.clone()));
        assert_eq!(created.status, AllocationStatus::YetToAssign);
        assert_eq!(created.owner.as_deref(), Some("alice"));
        assert_eq!(created.registered_at, now());
    }

    #[test]
    fn at_sqlite_02_rollback_discards_writes() {
        let mut store = SqliteLedgerStore::open_in_memory().unwrap();
        let out: Result<(), StorageError> = store.transaction(|tx| {
            tx.create_record(input("24.1.0", Priority::Low))?;
            Err(StorageError::LockPoisoned)
        });
        assert!(out.is_err());
        let rows = store
            .transaction(|tx| tx.records())
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn at_sqlite_03_pending_cpu_filters_priority_and_window() {
        let mut store = SqliteLedgerStore::open_in_memory().unwrap();
        let sum = store
            .transaction(|tx| {
                tx.create_record(input("a", Priority::Critical))?;
                tx.create_record(input("b", Priority::High))?;
                tx.create_record(input("c", Priority::Low))?;
                tx.pending_cpu(&[Priority::Critical, Priority::High], now())
            })
            .unwrap();
        assert_eq!(sum, 100.0);
        let later = store
            .transaction(|tx| {
                tx.pending_cpu(&[Priority::Critical], now() + chrono::Duration::seconds(1))
            })
            .unwrap();
        assert_eq!(later, 0.0);
    }

    #[test]
    fn at_sqlite_04_out_of_range_sequence_ids_are_not_found() {
        let mut store = SqliteLedgerStore::open_in_memory().unwrap();
        let huge = SequenceId(u64::MAX);
        let out = store.transaction(|tx| {
            tx.create_record(input("24.1.0", Priority::Low))?;
            tx.record_pipeline_reference(huge, "https://ci.example/p/2")
        });
        assert!(matches!(out, Err(StorageError::NotFound { .. })));
        let peer = store.transaction(|tx| tx.older_queued_peer_exists(huge, Priority::Low, now()));
        assert!(matches!(peer, Err(StorageError::NotFound { .. })));
        assert!(matches!(
            store.transaction(|tx| tx.get_record(huge)),
            Err(StorageError::NotFound { .. })
        ));
    }
}
