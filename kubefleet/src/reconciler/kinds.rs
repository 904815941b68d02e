use std::collections::HashSet;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kubefleet_apis::{ClusterResource, MANAGED_BY_LABEL, ResourceCreateInput, ResourceKind};
use serde_json::Value;

use super::{ClusterResourceManager, RemoteObject};
use crate::{
    MANAGER,
    client::{ClusterApi, kinds::new_object},
    errors::{Error, Result},
    store::{Query, Store, StoreExt},
};

/// Manager for plain kubernetes kinds, identified by `metadata.uid`.
pub struct KindManager {
    kind: ResourceKind,
}

impl KindManager {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl ClusterResourceManager for KindManager {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn list_remote(&self, client: &dyn ClusterApi) -> Result<Vec<RemoteObject>> {
        client
            .list(self.kind, None, None)
            .await?
            .iter()
            .map(|o| RemoteObject::from_object(self.kind, o))
            .collect()
    }

    fn global_id(&self, _cluster_id: &str, remote: &RemoteObject) -> String {
        remote.uid.clone()
    }

    fn new_remote_from_input(&self, input: &ResourceCreateInput) -> Result<DynamicObject> {
        if self.kind.is_namespaced() && input.namespace.is_none() {
            return Err(Error::Validation(format!(
                "{} {} needs a namespace",
                self.kind, input.name
            )));
        }
        let mut object = new_object(self.kind, input.namespace.as_deref(), &input.name)?;
        let mut labels = input.labels.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER.to_string());
        object.metadata.labels = Some(labels);
        match &input.body {
            Value::Null => (),
            Value::Object(fields) => {
                let mut data = serde_json::Map::new();
                for (k, v) in fields {
                    if k == "metadata" || k == "apiVersion" || k == "kind" {
                        continue;
                    }
                    data.insert(k.clone(), v.clone());
                }
                object.data = Value::Object(data);
            }
            _ => {
                return Err(Error::Validation(format!(
                    "body of {} {} must be an object",
                    self.kind, input.name
                )));
            }
        }
        Ok(object)
    }

    async fn create_remote(
        &self,
        client: &dyn ClusterApi,
        object: &DynamicObject,
    ) -> Result<RemoteObject> {
        let created = client.create(self.kind, object).await?;
        RemoteObject::from_object(self.kind, &created)
    }

    async fn delete_remote(&self, client: &dyn ClusterApi, row: &ClusterResource) -> Result<()> {
        client
            .delete(self.kind, row.namespace.as_deref(), &row.base.name)
            .await
    }

    /// A namespace row goes only once no row lives in it, whether the row
    /// references it by id or only by namespace name.
    async fn validate_delete(&self, store: &dyn Store, row: &ClusterResource) -> Result<()> {
        if self.kind != ResourceKind::Namespace {
            return Ok(());
        }
        let by_id: Vec<ClusterResource> = store
            .list(
                &Query::new()
                    .eq("cluster_id", &row.cluster_id)
                    .eq("namespace_id", &row.base.id),
            )
            .await?;
        let by_name: Vec<ClusterResource> = store
            .list(
                &Query::new()
                    .eq("cluster_id", &row.cluster_id)
                    .eq("namespace", &row.base.name),
            )
            .await?;
        let contents: HashSet<String> = by_id
            .into_iter()
            .chain(by_name)
            .map(|r| r.base.id)
            .collect();
        if !contents.is_empty() {
            return Err(Error::Validation(format!(
                "{} still holds {} resources",
                row.ident(),
                contents.len()
            )));
        }
        Ok(())
    }
}
