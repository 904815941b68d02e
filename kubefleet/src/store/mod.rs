//! Durable row storage as seen by the control plane.
//!
//! Rows are JSON documents filed by table (`Record::KIND`) and addressed by
//! id. [`Store::update`] applies its mutator under the store's write lock,
//! which orders all mutations of a row. [`StoreExt`] adds typed access.

use async_trait::async_trait;
use chrono::Utc;
use kubefleet_apis::Record;
use serde::Serialize;
use serde_json::Value;

use crate::errors::{Error, Result};

mod memory;

pub use memory::MemoryStore;

/// In-place change applied to a stored row.
pub type Mutator = Box<dyn FnOnce(&mut Value) -> Result<()> + Send>;

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
}

impl Predicate {
    fn matches(&self, row: &Value) -> bool {
        let field = |name: &str| row.get(name).unwrap_or(&Value::Null);
        match self {
            Predicate::Eq(name, v) => field(name) == v,
            Predicate::Ne(name, v) => field(name) != v,
            Predicate::In(name, vs) => vs.contains(field(name)),
            Predicate::IsNull(name) => field(name).is_null(),
        }
    }
}

/// Conjunction of field predicates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    predicates: Vec<Predicate>,
}

fn to_value<T: Serialize>(v: T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq<T: Serialize>(mut self, field: &str, value: T) -> Self {
        self.predicates
            .push(Predicate::Eq(field.to_string(), to_value(value)));
        self
    }

    pub fn ne<T: Serialize>(mut self, field: &str, value: T) -> Self {
        self.predicates
            .push(Predicate::Ne(field.to_string(), to_value(value)));
        self
    }

    pub fn any_of<T: Serialize>(mut self, field: &str, values: impl IntoIterator<Item = T>) -> Self {
        self.predicates.push(Predicate::In(
            field.to_string(),
            values.into_iter().map(to_value).collect(),
        ));
        self
    }

    pub fn is_null(mut self, field: &str) -> Self {
        self.predicates.push(Predicate::IsNull(field.to_string()));
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.predicates.iter().all(|p| p.matches(row))
    }
}

pub(crate) enum TxOp {
    Insert { kind: &'static str, row: Value },
    Update { kind: &'static str, id: String, mutator: Mutator },
    Delete { kind: &'static str, id: String },
}

/// A batch of mutations applied atomically by [`Store::commit`].
#[derive(Default)]
pub struct Transaction {
    pub(crate) ops: Vec<TxOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<R: Record>(&mut self, row: &R) -> Result<&mut Self> {
        self.ops.push(TxOp::Insert {
            kind: R::KIND,
            row: serde_json::to_value(row)?,
        });
        Ok(self)
    }

    pub fn update<R, F>(&mut self, id: &str, f: F) -> &mut Self
    where
        R: Record,
        F: FnOnce(&mut R) -> Result<()> + Send + 'static,
    {
        self.ops.push(TxOp::Update {
            kind: R::KIND,
            id: id.to_string(),
            mutator: typed_mutator(f),
        });
        self
    }

    pub fn delete<R: Record>(&mut self, id: &str) -> &mut Self {
        self.ops.push(TxOp::Delete {
            kind: R::KIND,
            id: id.to_string(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

fn typed_mutator<R, F>(f: F) -> Mutator
where
    R: Record,
    F: FnOnce(&mut R) -> Result<()> + Send + 'static,
{
    Box::new(move |value: &mut Value| {
        let mut row: R = serde_json::from_value(value.clone())?;
        f(&mut row)?;
        let mut next = serde_json::to_value(&row)?;
        if let Some(object) = next.as_object_mut() {
            object.insert("updated_at".to_string(), to_value(Utc::now()));
        }
        *value = next;
        Ok(())
    })
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Rows of `kind` matching `query`, in insertion order.
    async fn query(&self, kind: &str, query: &Query) -> Result<Vec<Value>>;

    /// Fails with `Conflict` if a row with the same id exists.
    async fn insert(&self, kind: &str, row: Value) -> Result<()>;

    /// Applies `mutator` to the row and returns the new value.
    async fn update(&self, kind: &str, id: &str, mutator: Mutator) -> Result<Value>;

    async fn delete(&self, kind: &str, id: &str) -> Result<()>;

    /// Applies every operation or none of them.
    async fn commit(&self, tx: Transaction) -> Result<()>;
}

/// Typed access on top of [`Store`].
#[async_trait]
pub trait StoreExt: Store {
    async fn fetch<R: Record>(&self, id: &str) -> Result<R> {
        let rows = self.query(R::KIND, &Query::new().eq("id", id)).await?;
        match rows.into_iter().next() {
            Some(row) => Ok(serde_json::from_value(row)?),
            None => Err(Error::NotFound(format!("{} {} not found", R::KIND, id))),
        }
    }

    async fn find<R: Record>(&self, query: &Query) -> Result<Option<R>> {
        let rows = self.query(R::KIND, query).await?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(serde_json::from_value(row)?)),
            None => Ok(None),
        }
    }

    async fn list<R: Record>(&self, query: &Query) -> Result<Vec<R>> {
        let rows = self.query(R::KIND, query).await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            result.push(serde_json::from_value(row)?);
        }
        Ok(result)
    }

    async fn create<R: Record>(&self, row: &R) -> Result<()> {
        self.insert(R::KIND, serde_json::to_value(row)?).await
    }

    async fn modify<R, F>(&self, id: &str, f: F) -> Result<R>
    where
        R: Record,
        F: FnOnce(&mut R) -> Result<()> + Send + 'static,
    {
        let value = self.update(R::KIND, id, typed_mutator(f)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn remove<R: Record>(&self, id: &str) -> Result<()> {
        self.delete(R::KIND, id).await
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_predicates() {
        let row = json!({"id": "a", "cluster_id": "c1", "kind": "pods", "namespace": null});
        assert!(Query::new().eq("cluster_id", "c1").matches(&row));
        assert!(!Query::new().eq("cluster_id", "c2").matches(&row));
        assert!(Query::new().ne("kind", "nodes").matches(&row));
        assert!(Query::new().any_of("kind", ["pods", "nodes"]).matches(&row));
        assert!(Query::new().is_null("namespace").is_null("missing").matches(&row));
        assert!(Query::new().matches(&row));
    }
}
