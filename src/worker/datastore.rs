//! Account counters and published photo records.

use crate::config::DatastoreConfig;
use async_trait::async_trait;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::{json, Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Datastore returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// A record staged for creation in a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct StagedDocument {
    pub collection: String,
    pub document_id: String,
    pub fields: Map<String, Value>,
}

/// Document creations committed together or not at all.
#[derive(Debug, Default)]
pub struct WriteBatch {
    documents: Vec<StagedDocument>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a new document under a generated id and returns that id.
    pub fn create(&mut self, collection: &str, fields: Map<String, Value>) -> String {
        let document_id = auto_id();
        self.documents.push(StagedDocument {
            collection: collection.to_string(),
            document_id: document_id.clone(),
            fields,
        });
        document_id
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> &[StagedDocument] {
        &self.documents
    }
}

/// 20 alphanumeric characters, the shape of generated document ids.
fn auto_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Atomically adds `delta` to a numeric field of an existing document.
    async fn increment(
        &self,
        collection: &str,
        document_id: &str,
        field: &str,
        delta: i64,
    ) -> Result<(), DatastoreError>;

    async fn commit(&self, batch: WriteBatch) -> Result<(), DatastoreError>;
}

/// Encodes plain JSON as a typed document value.
pub fn to_document_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(to_document_value).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({ "mapValue": { "fields": to_document_fields(map) } }),
    }
}

pub fn to_document_fields(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), to_document_value(v)))
        .collect()
}

/// Firestore over its REST `documents:commit` endpoint.
pub struct FirestoreStore {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    access_token: String,
}

impl FirestoreStore {
    pub fn new(config: &DatastoreConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            project_id: config.project_id.clone(),
            access_token: config.access_token.clone(),
        }
    }

    fn document_name(&self, collection: &str, document_id: &str) -> String {
        format!(
            "projects/{}/databases/(default)/documents/{collection}/{document_id}",
            self.project_id
        )
    }

    fn increment_body(&self, collection: &str, document_id: &str, field: &str, delta: i64) -> Value {
        json!({
            "writes": [{
                "transform": {
                    "document": self.document_name(collection, document_id),
                    "fieldTransforms": [{
                        "fieldPath": field,
                        "increment": { "integerValue": delta.to_string() }
                    }]
                },
                "currentDocument": { "exists": true }
            }]
        })
    }

    fn commit_body(&self, batch: &WriteBatch) -> Value {
        let writes: Vec<Value> = batch
            .documents()
            .iter()
            .map(|doc| {
                json!({
                    "update": {
                        "name": self.document_name(&doc.collection, &doc.document_id),
                        "fields": to_document_fields(&doc.fields)
                    },
                    "currentDocument": { "exists": false }
                })
            })
            .collect();
        json!({ "writes": writes })
    }

    async fn post_commit(&self, body: &Value) -> Result<(), DatastoreError> {
        let url = format!(
            "{}/projects/{}/databases/(default)/documents:commit",
            self.base_url, self.project_id
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DatastoreError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    async fn increment(
        &self,
        collection: &str,
        document_id: &str,
        field: &str,
        delta: i64,
    ) -> Result<(), DatastoreError> {
        self.post_commit(&self.increment_body(collection, document_id, field, delta))
            .await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), DatastoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.post_commit(&self.commit_body(&batch)).await?;
        log::info!("Committed {} record(s)", batch.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> FirestoreStore {
        FirestoreStore::new(&DatastoreConfig {
            project_id: "demo".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_document_value_encoding() {
        let value = json!({"n": 3, "f": 1.5, "s": "x", "b": true, "z": null, "a": [1]});
        let Value::Object(map) = value else {
            panic!("expected object");
        };
        let fields = to_document_fields(&map);
        assert_eq!(fields["n"], json!({"integerValue": "3"}));
        assert_eq!(fields["f"], json!({"doubleValue": 1.5}));
        assert_eq!(fields["s"], json!({"stringValue": "x"}));
        assert_eq!(fields["b"], json!({"booleanValue": true}));
        assert_eq!(fields["z"], json!({"nullValue": null}));
        assert_eq!(fields["a"], json!({"arrayValue": {"values": [{"integerValue": "1"}]}}));
    }

    #[test]
    fn test_increment_body_targets_existing_document() {
        let body = store().increment_body("users", "u1", "unprocessedCount", -1);
        let write = &body["writes"][0];
        assert_eq!(
            write["transform"]["document"],
            "projects/demo/databases/(default)/documents/users/u1"
        );
        assert_eq!(write["transform"]["fieldTransforms"][0]["increment"]["integerValue"], "-1");
        assert_eq!(write["currentDocument"]["exists"], true);
    }

    #[test]
    fn test_batch_creates_with_generated_ids() {
        let mut batch = WriteBatch::new();
        let mut fields = Map::new();
        fields.insert("uid".to_string(), json!("u1"));
        let first = batch.create("trixpix", fields.clone());
        let second = batch.create("trixpix", fields);

        assert_eq!(first.len(), 20);
        assert_ne!(first, second);

        let body = store().commit_body(&batch);
        assert_eq!(body["writes"].as_array().map(Vec::len), Some(2));
        assert_eq!(body["writes"][1]["currentDocument"]["exists"], false);
        assert_eq!(body["writes"][0]["update"]["fields"]["uid"]["stringValue"], "u1");
    }
}
