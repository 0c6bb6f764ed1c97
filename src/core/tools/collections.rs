//! Tools over the external content store. The store itself is only seen
//! through [`DataBackend`]; an in-memory backend ships for local runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use super::{Tool, ToolContext, ToolTableBuilder, error_result, str_arg, success_result};
use crate::core::error::ToolError;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("collection '{0}' not found")]
    CollectionNotFound(String),
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub item_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub id: u64,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemPage {
    pub items: Vec<Item>,
    pub total: usize,
}

#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, DataError>;
    async fn get_schema(&self, collection: &str) -> Result<Value, DataError>;
    async fn list_items(
        &self,
        collection: &str,
        page: usize,
        page_size: usize,
    ) -> Result<ItemPage, DataError>;
    async fn get_item(&self, collection: &str, id: u64) -> Result<Option<Item>, DataError>;
    async fn create_item(&self, collection: &str, data: Value) -> Result<Item, DataError>;
    async fn update_item(
        &self,
        collection: &str,
        id: u64,
        data: Value,
    ) -> Result<Option<Item>, DataError>;
    async fn delete_item(&self, collection: &str, id: u64) -> Result<bool, DataError>;
}

struct Collection {
    schema: Value,
    items: BTreeMap<u64, Item>,
    next_id: u64,
}

#[derive(Default)]
pub struct InMemoryDataBackend {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryDataBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_collection(&self, name: &str, schema: Value) {
        self.collections.write().await.insert(
            name.to_string(),
            Collection {
                schema,
                items: BTreeMap::new(),
                next_id: 1,
            },
        );
    }
}

#[async_trait]
impl DataBackend for InMemoryDataBackend {
    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, DataError> {
        let collections = self.collections.read().await;
        let mut out: Vec<CollectionInfo> = collections
            .iter()
            .map(|(name, c)| CollectionInfo {
                name: name.clone(),
                item_count: c.items.len(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn get_schema(&self, collection: &str) -> Result<Value, DataError> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|c| c.schema.clone())
            .ok_or_else(|| DataError::CollectionNotFound(collection.to_string()))
    }

    async fn list_items(
        &self,
        collection: &str,
        page: usize,
        page_size: usize,
    ) -> Result<ItemPage, DataError> {
        let collections = self.collections.read().await;
        let c = collections
            .get(collection)
            .ok_or_else(|| DataError::CollectionNotFound(collection.to_string()))?;
        let offset = page.saturating_sub(1).saturating_mul(page_size);
        Ok(ItemPage {
            items: c.items.values().skip(offset).take(page_size).cloned().collect(),
            total: c.items.len(),
        })
    }

    async fn get_item(&self, collection: &str, id: u64) -> Result<Option<Item>, DataError> {
        let collections = self.collections.read().await;
        let c = collections
            .get(collection)
            .ok_or_else(|| DataError::CollectionNotFound(collection.to_string()))?;
        Ok(c.items.get(&id).cloned())
    }

    async fn create_item(&self, collection: &str, data: Value) -> Result<Item, DataError> {
        let mut collections = self.collections.write().await;
        let c = collections
            .get_mut(collection)
            .ok_or_else(|| DataError::CollectionNotFound(collection.to_string()))?;
        let now = Utc::now();
        let item = Item {
            id: c.next_id,
            data,
            created_at: now,
            updated_at: now,
        };
        c.next_id += 1;
        c.items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn update_item(
        &self,
        collection: &str,
        id: u64,
        data: Value,
    ) -> Result<Option<Item>, DataError> {
        let mut collections = self.collections.write().await;
        let c = collections
            .get_mut(collection)
            .ok_or_else(|| DataError::CollectionNotFound(collection.to_string()))?;
        Ok(c.items.get_mut(&id).map(|item| {
            item.data = data;
            item.updated_at = Utc::now();
            item.clone()
        }))
    }

    async fn delete_item(&self, collection: &str, id: u64) -> Result<bool, DataError> {
        let mut collections = self.collections.write().await;
        let c = collections
            .get_mut(collection)
            .ok_or_else(|| DataError::CollectionNotFound(collection.to_string()))?;
        Ok(c.items.remove(&id).is_some())
    }
}

pub(super) fn register(builder: ToolTableBuilder, data: Arc<dyn DataBackend>) -> ToolTableBuilder {
    builder
        .register("collections.list", Arc::new(ListCollections(data.clone())))
        .register("collections.get_schema", Arc::new(GetSchema(data.clone())))
        .register("collections.list_items", Arc::new(ListItems(data.clone())))
        .register("collections.get_item", Arc::new(GetItem(data.clone())))
        .register("collections.upsert_item", Arc::new(UpsertItem(data.clone())))
        .register("collections.delete_item", Arc::new(DeleteItem(data)))
}

fn collection_arg(args: &Value) -> Result<&str, String> {
    str_arg(args, "collection_name")
        .ok_or_else(|| "missing required parameter: collection_name".to_string())
}

/// Item ids arrive as numbers or numeric strings. `None` means "absent".
fn item_id_arg(args: &Value) -> Result<Option<u64>, String> {
    match args.get("item_id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| "invalid item_id format".to_string()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| "invalid item_id format".to_string()),
        Some(_) => Err("invalid item_id format".to_string()),
    }
}

fn usize_arg(args: &Value, key: &str, default: usize) -> usize {
    match args.get(key) {
        Some(Value::Number(n)) => n.as_u64().map(|v| v as usize).unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
    .max(1)
}

macro_rules! in_band {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return Ok(error_result(e.to_string())),
        }
    };
}

pub struct ListCollections(Arc<dyn DataBackend>);

#[async_trait]
impl Tool for ListCollections {
    async fn call(&self, _ctx: &ToolContext, _args: Value) -> Result<String, ToolError> {
        let collections = in_band!(self.0.list_collections().await);
        Ok(success_result(json!({ "collections": collections })))
    }
}

pub struct GetSchema(Arc<dyn DataBackend>);

#[async_trait]
impl Tool for GetSchema {
    async fn call(&self, _ctx: &ToolContext, args: Value) -> Result<String, ToolError> {
        let collection = in_band!(collection_arg(&args));
        let schema = in_band!(self.0.get_schema(collection).await);
        Ok(success_result(json!({
            "collection_name": collection,
            "schema": schema
        })))
    }
}

pub struct ListItems(Arc<dyn DataBackend>);

#[async_trait]
impl Tool for ListItems {
    async fn call(&self, _ctx: &ToolContext, args: Value) -> Result<String, ToolError> {
        let collection = in_band!(collection_arg(&args));
        let page = usize_arg(&args, "page", 1);
        let page_size = usize_arg(&args, "page_size", 10);
        let result = in_band!(self.0.list_items(collection, page, page_size).await);
        Ok(success_result(json!({
            "items": result.items,
            "pagination": {
                "page": page,
                "page_size": page_size,
                "total": result.total,
                "page_count": result.total.div_ceil(page_size),
            }
        })))
    }
}

pub struct GetItem(Arc<dyn DataBackend>);

#[async_trait]
impl Tool for GetItem {
    async fn call(&self, _ctx: &ToolContext, args: Value) -> Result<String, ToolError> {
        let collection = in_band!(collection_arg(&args));
        let Some(id) = in_band!(item_id_arg(&args)) else {
            return Ok(error_result("missing required parameter: item_id"));
        };
        match in_band!(self.0.get_item(collection, id).await) {
            Some(item) => Ok(success_result(json!({ "item": item }))),
            None => Ok(error_result(format!(
                "item with ID {} not found in collection '{}'",
                id, collection
            ))),
        }
    }
}

pub struct UpsertItem(Arc<dyn DataBackend>);

#[async_trait]
impl Tool for UpsertItem {
    async fn call(&self, _ctx: &ToolContext, args: Value) -> Result<String, ToolError> {
        let collection = in_band!(collection_arg(&args));
        let data = match args.get("data") {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
                Ok(v @ Value::Object(_)) => v,
                _ => return Ok(error_result("'data' must be a JSON object")),
            },
            _ => {
                return Ok(error_result(
                    "missing required parameters: collection_name and data",
                ));
            }
        };

        // An absent, empty or zero id creates a new item.
        match in_band!(item_id_arg(&args)).filter(|id| *id != 0) {
            Some(id) => match in_band!(self.0.update_item(collection, id, data).await) {
                Some(item) => Ok(success_result(json!({
                    "item_id": item.id,
                    "action": "updated"
                }))),
                None => Ok(error_result(format!(
                    "item with ID {} not found in collection '{}' for update",
                    id, collection
                ))),
            },
            None => {
                let item = in_band!(self.0.create_item(collection, data).await);
                Ok(success_result(json!({
                    "item_id": item.id,
                    "action": "created"
                })))
            }
        }
    }
}

pub struct DeleteItem(Arc<dyn DataBackend>);

#[async_trait]
impl Tool for DeleteItem {
    async fn call(&self, _ctx: &ToolContext, args: Value) -> Result<String, ToolError> {
        let collection = in_band!(collection_arg(&args));
        let Some(id) = in_band!(item_id_arg(&args)) else {
            return Ok(error_result("missing required parameter: item_id"));
        };
        if in_band!(self.0.delete_item(collection, id).await) {
            Ok(success_result(json!({
                "message": format!("Item '{}' was successfully deleted.", id)
            })))
        } else {
            Ok(error_result(format!(
                "failed to delete item: item with ID {} not found",
                id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tools::testing::test_context;

    async fn backend() -> Arc<InMemoryDataBackend> {
        let backend = Arc::new(InMemoryDataBackend::new());
        backend
            .create_collection("posts", json!({"title": {"type": "string"}}))
            .await;
        backend
    }

    fn parse(out: String) -> Value {
        serde_json::from_str(&out).unwrap()
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let data = backend().await;
        let upsert = UpsertItem(data.clone());
        let ctx = test_context();

        let created = parse(
            upsert
                .call(&ctx, json!({"collection_name": "posts", "item_id": "0", "data": {"title": "a"}}))
                .await
                .unwrap(),
        );
        assert_eq!(created["action"], "created");
        assert_eq!(created["item_id"], 1);

        let updated = parse(
            upsert
                .call(&ctx, json!({"collection_name": "posts", "item_id": 1, "data": "{\"title\":\"b\"}"}))
                .await
                .unwrap(),
        );
        assert_eq!(updated["action"], "updated");
        assert_eq!(data.get_item("posts", 1).await.unwrap().unwrap().data["title"], "b");

        let missing = parse(
            upsert
                .call(&ctx, json!({"collection_name": "posts", "item_id": 9, "data": {}}))
                .await
                .unwrap(),
        );
        assert_eq!(missing["status"], "error");
    }

    #[tokio::test]
    async fn list_items_paginates() {
        let data = backend().await;
        for i in 0..12 {
            data.create_item("posts", json!({"n": i})).await.unwrap();
        }
        let out = parse(
            ListItems(data.clone())
                .call(&test_context(), json!({"collection_name": "posts", "page": 2}))
                .await
                .unwrap(),
        );
        assert_eq!(out["items"].as_array().unwrap().len(), 2);
        assert_eq!(
            out["pagination"],
            json!({"page": 2, "page_size": 10, "total": 12, "page_count": 2})
        );
    }

    #[tokio::test]
    async fn huge_page_numbers_are_empty_pages() {
        let data = backend().await;
        data.create_item("posts", json!({"n": 1})).await.unwrap();
        let out = parse(
            ListItems(data.clone())
                .call(
                    &test_context(),
                    json!({"collection_name": "posts", "page": u64::MAX, "page_size": u64::MAX}),
                )
                .await
                .unwrap(),
        );
        assert_eq!(out["status"], "success");
        assert!(out["items"].as_array().unwrap().is_empty());
        assert_eq!(out["pagination"]["total"], 1);
        assert_eq!(out["pagination"]["page_count"], 1);
    }

    #[tokio::test]
    async fn unknown_collection_is_in_band() {
        let data = backend().await;
        let out = parse(
            GetSchema(data.clone())
                .call(&test_context(), json!({"collection_name": "ghosts"}))
                .await
                .unwrap(),
        );
        assert_eq!(out["status"], "error");
        assert_eq!(out["message"], "collection 'ghosts' not found");

        let out = parse(
            DeleteItem(data)
                .call(&test_context(), json!({"collection_name": "posts", "item_id": "abc"}))
                .await
                .unwrap(),
        );
        assert_eq!(out["message"], "invalid item_id format");
    }

    #[tokio::test]
    async fn list_collections_and_delete() {
        let data = backend().await;
        data.create_item("posts", json!({})).await.unwrap();
        let listed = parse(
            ListCollections(data.clone())
                .call(&test_context(), json!({}))
                .await
                .unwrap(),
        );
        assert_eq!(listed["collections"][0]["name"], "posts");
        assert_eq!(listed["collections"][0]["item_count"], 1);

        let deleted = parse(
            DeleteItem(data.clone())
                .call(&test_context(), json!({"collection_name": "posts", "item_id": 1}))
                .await
                .unwrap(),
        );
        assert_eq!(deleted["status"], "success");
        assert!(data.get_item("posts", 1).await.unwrap().is_none());
    }
}
