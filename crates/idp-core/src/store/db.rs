//! Durable workflow store backed by redb.
//!
//! # Table design
//!
//! ```text
//! workflows: id -> JSON { seq, workflow }
//! logs:      id -> JSON LogBuffer
//! ```
//!
//! `seq` is the table length at insert time and restores insertion order on
//! `list`. Each `update` and `append_log` runs inside a single write
//! transaction; redb serialises write transactions, which gives the
//! read-modify-write atomicity the store contract requires.

use std::path::Path;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{IdpError, Result};
use crate::log::{LogBuffer, LogEntry};
use crate::workflow::Workflow;

use super::{Mutation, WorkflowStore};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const WORKFLOWS: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");
const LOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("logs");

#[derive(Serialize, Deserialize)]
struct Record {
    seq: u64,
    workflow: Workflow,
}

fn store_err(e: impl std::fmt::Display) -> IdpError {
    IdpError::Store(e.to_string())
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

pub struct RedbStore {
    db: Database,
    log_capacity: usize,
}

impl RedbStore {
    /// Open or create the database at `path`, creating both tables.
    pub fn open(path: &Path, log_capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(WORKFLOWS).map_err(store_err)?;
        wt.open_table(LOGS).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self { db, log_capacity })
    }

    fn contains(&self, id: &str) -> Result<bool> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(WORKFLOWS).map_err(store_err)?;
        Ok(table.get(id).map_err(store_err)?.is_some())
    }
}

impl WorkflowStore for RedbStore {
    fn insert(&self, workflow: &Workflow) -> Result<()> {
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(WORKFLOWS).map_err(store_err)?;
            if table.get(workflow.id.as_str()).map_err(store_err)?.is_some() {
                return Err(IdpError::WorkflowExists(workflow.id.clone()));
            }
            let record = Record {
                seq: table.len().map_err(store_err)?,
                workflow: workflow.clone(),
            };
            let value = serde_json::to_vec(&record)?;
            table
                .insert(workflow.id.as_str(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Workflow>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(WORKFLOWS).map_err(store_err)?;
        match table.get(id).map_err(store_err)? {
            Some(v) => {
                let record: Record = serde_json::from_slice(v.value())?;
                Ok(Some(record.workflow))
            }
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<Workflow>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(WORKFLOWS).map_err(store_err)?;
        let mut records = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            let record: Record = serde_json::from_slice(v.value())?;
            records.push(record);
        }
        records.sort_by_key(|r| r.seq);
        Ok(records.into_iter().map(|r| r.workflow).collect())
    }

    fn update(&self, id: &str, mutate: Mutation<'_>) -> Result<Workflow> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let updated = {
            let mut table = wt.open_table(WORKFLOWS).map_err(store_err)?;
            let mut record: Record = match table.get(id).map_err(store_err)? {
                Some(v) => serde_json::from_slice(v.value())?,
                None => return Err(IdpError::WorkflowNotFound(id.to_string())),
            };
            mutate(&mut record.workflow)?;
            let value = serde_json::to_vec(&record)?;
            table.insert(id, value.as_slice()).map_err(store_err)?;
            record.workflow
        };
        wt.commit().map_err(store_err)?;
        Ok(updated)
    }

    fn append_log(&self, id: &str, entry: LogEntry) -> Result<()> {
        if !self.contains(id)? {
            return Err(IdpError::WorkflowNotFound(id.to_string()));
        }
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(LOGS).map_err(store_err)?;
            let mut buffer: LogBuffer = match table.get(id).map_err(store_err)? {
                Some(v) => serde_json::from_slice(v.value())?,
                None => LogBuffer::default(),
            };
            buffer.push(entry, self.log_capacity);
            let value = serde_json::to_vec(&buffer)?;
            table.insert(id, value.as_slice()).map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    fn logs(&self, id: &str) -> Result<Vec<LogEntry>> {
        if !self.contains(id)? {
            return Err(IdpError::WorkflowNotFound(id.to_string()));
        }
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(LOGS).map_err(store_err)?;
        match table.get(id).map_err(store_err)? {
            Some(v) => {
                let buffer: LogBuffer = serde_json::from_slice(v.value())?;
                Ok(buffer.snapshot())
            }
            None => Ok(Vec::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
