use std::{
    collections::{BTreeMap, HashMap},
    sync::{RwLock, RwLockWriteGuard},
};

use async_trait::async_trait;
use serde_json::Value;

use super::{Mutator, Query, Store, Transaction, TxOp};
use crate::errors::{Error, Result};

#[derive(Clone, Default)]
struct Table {
    /// id -> (insertion sequence, row)
    rows: BTreeMap<String, (u64, Value)>,
}

#[derive(Clone, Default)]
struct Tables {
    next_seq: u64,
    tables: HashMap<String, Table>,
}

fn row_id(row: &Value) -> Result<String> {
    row.get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(|id| id.to_string())
        .ok_or_else(|| Error::Validation("row has no id".to_string()))
}

impl Tables {
    fn insert(&mut self, kind: &str, row: Value) -> Result<()> {
        let id = row_id(&row)?;
        let seq = self.next_seq;
        let table = self.tables.entry(kind.to_string()).or_default();
        if table.rows.contains_key(&id) {
            return Err(Error::Conflict(format!("{} {} already exists", kind, id)));
        }
        table.rows.insert(id, (seq, row));
        self.next_seq += 1;
        Ok(())
    }

    fn update(&mut self, kind: &str, id: &str, mutator: Mutator) -> Result<Value> {
        let (_, row) = self
            .tables
            .get_mut(kind)
            .and_then(|t| t.rows.get_mut(id))
            .ok_or_else(|| Error::NotFound(format!("{} {} not found", kind, id)))?;
        let mut next = row.clone();
        mutator(&mut next)?;
        if row_id(&next)? != id {
            return Err(Error::Validation(format!(
                "update of {} {} must not change its id",
                kind, id
            )));
        }
        *row = next.clone();
        Ok(next)
    }

    fn delete(&mut self, kind: &str, id: &str) -> Result<()> {
        self.tables
            .get_mut(kind)
            .and_then(|t| t.rows.remove(id))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("{} {} not found", kind, id)))
    }
}

/// In-process [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of rows in `kind`.
    pub fn count(&self, kind: &str) -> usize {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.tables.get(kind).map(|t| t.rows.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn query(&self, kind: &str, query: &Query) -> Result<Vec<Value>> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<&(u64, Value)> = match guard.tables.get(kind) {
            Some(table) => table
                .rows
                .values()
                .filter(|(_, row)| query.matches(row))
                .collect(),
            None => return Ok(vec![]),
        };
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, row)| row.clone()).collect())
    }

    async fn insert(&self, kind: &str, row: Value) -> Result<()> {
        self.write().insert(kind, row)
    }

    async fn update(&self, kind: &str, id: &str, mutator: Mutator) -> Result<Value> {
        self.write().update(kind, id, mutator)
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<()> {
        self.write().delete(kind, id)
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        let mut guard = self.write();
        let mut staged = guard.clone();
        for op in tx.ops {
            match op {
                TxOp::Insert { kind, row } => staged.insert(kind, row)?,
                TxOp::Update { kind, id, mutator } => {
                    staged.update(kind, &id, mutator)?;
                }
                TxOp::Delete { kind, id } => staged.delete(kind, &id)?,
            }
        }
        *guard = staged;
        Ok(())
    }
}
