// Almanac - per schema instance fact store

//! # Almanac
//!
//! Durable name → JSON fact store scoped to one schema instance. Every call
//! goes to storage: reads load the fact list, writes load, upsert and save
//! it back. Nothing is cached between calls, so callers mutating the same
//! instance must hold the engine's per-instance lock.
//!
//! A failed save propagates to the caller unchanged; there is no retry.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::engine::storage::WorkflowStorage;
use crate::models::AlmanacFact;
use crate::Result;

#[derive(Clone)]
pub struct Almanac {
    storage: Arc<dyn WorkflowStorage>,
    schema_instance_id: Uuid,
}

impl Almanac {
    pub fn new(storage: Arc<dyn WorkflowStorage>, schema_instance_id: Uuid) -> Self {
        Self {
            storage,
            schema_instance_id,
        }
    }

    pub fn schema_instance_id(&self) -> Uuid {
        self.schema_instance_id
    }

    /// Current value of `name`, `None` when the fact was never stored
    pub async fn get_fact(&self, name: &str) -> Result<Option<Value>> {
        let facts = self.storage.get_almanac_facts(&self.schema_instance_id).await?;
        Ok(facts.into_iter().find(|fact| fact.name == name).map(|fact| fact.data))
    }

    /// Insert or overwrite `name`
    pub async fn add_fact(&self, name: &str, data: Value) -> Result<bool> {
        let mut facts = self.storage.get_almanac_facts(&self.schema_instance_id).await?;
        match facts.iter_mut().find(|fact| fact.name == name) {
            Some(existing) => existing.data = data,
            None => facts.push(AlmanacFact {
                name: name.to_string(),
                data,
            }),
        }
        self.storage
            .update_almanac_facts(&self.schema_instance_id, facts)
            .await?;
        debug!(schema_instance_id = %self.schema_instance_id, fact = name, "Almanac fact stored");
        Ok(true)
    }

    /// True when `name` is stored with a non-null value
    pub async fn has_fact(&self, name: &str) -> Result<bool> {
        Ok(matches!(self.get_fact(name).await?, Some(value) if !value.is_null()))
    }

    pub async fn facts(&self) -> Result<Vec<AlmanacFact>> {
        self.storage.get_almanac_facts(&self.schema_instance_id).await
    }

    pub async fn fact_count(&self) -> Result<usize> {
        Ok(self.facts().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::{Schema, SchemaInstance};
    use serde_json::json;

    async fn almanac() -> Almanac {
        let storage: Arc<dyn WorkflowStorage> = Arc::new(InMemoryStorage::new());
        let schema = storage.create_schema(Schema::new("tenant", "facts")).await.unwrap();
        let instance = storage
            .create_schema_instance(SchemaInstance::new(&schema, "E-240101-001".into(), vec![]))
            .await
            .unwrap();
        Almanac::new(storage, instance.id)
    }

    #[tokio::test]
    async fn test_add_fact_upserts() {
        let almanac = almanac().await;

        assert!(tokio_test::assert_ok!(almanac.add_fact("x", json!(1)).await));
        let count = almanac.fact_count().await.unwrap();
        tokio_test::assert_ok!(almanac.add_fact("x", json!(2)).await);

        assert_eq!(almanac.get_fact("x").await.unwrap(), Some(json!(2)));
        assert_eq!(almanac.fact_count().await.unwrap(), count);
    }

    #[tokio::test]
    async fn test_missing_and_null_facts() {
        let almanac = almanac().await;
        assert_eq!(almanac.get_fact("missing").await.unwrap(), None);

        almanac.add_fact("empty", Value::Null).await.unwrap();
        assert!(!almanac.has_fact("empty").await.unwrap());

        almanac.add_fact("name", json!("Ada")).await.unwrap();
        assert!(almanac.has_fact("name").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let storage: Arc<dyn WorkflowStorage> = Arc::new(InMemoryStorage::new());
        let almanac = Almanac::new(storage, Uuid::new_v4());
        assert!(matches!(
            almanac.add_fact("x", json!(1)).await,
            Err(crate::FlowgateError::NotFound { .. })
        ));
    }
}
