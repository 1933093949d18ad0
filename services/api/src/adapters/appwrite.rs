//! services/api/src/adapters/appwrite.rs
//!
//! `PersistenceService` backed by an Appwrite database over its REST API.
//!
//! Subscribers live in the `user-house` collection (`houseNo`, `username`,
//! `userId`) and ratings are appended to `leaderboard_ratings` (`username`,
//! `houseNo`, `date`, `rating`, `userId`). Call events are only written when an
//! events collection is configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;
use waste_ivr_core::domain::{CallEvent, CallEventKind, Rating, RatingRecord, SubscriberRecord};
use waste_ivr_core::ports::{Lookup, PersistenceService, PortError, PortResult};

use crate::config::AppwriteConfig;

/// Appwrite caps a page at 5000; the admin listings never need more than this.
const LIST_LIMIT: u32 = 500;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

pub struct AppwriteAdapter {
    client: Client,
    config: AppwriteConfig,
}

impl AppwriteAdapter {
    /// Builds the HTTP client. Every request is bounded by `timeout`.
    pub fn new(config: AppwriteConfig, timeout: std::time::Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, config })
    }

    fn collection_url(&self, collection_id: &str) -> String {
        format!(
            "{}/databases/{}/collections/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.database_id,
            collection_id
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("X-Appwrite-Project", &self.config.project_id)
            .header("X-Appwrite-Key", &self.config.api_key)
    }

    async fn list_documents<T: DeserializeOwned>(
        &self,
        collection_id: &str,
        queries: &[String],
    ) -> PortResult<Vec<T>> {
        let url = format!("{}/documents", self.collection_url(collection_id));
        let params: Vec<(&str, &str)> = queries.iter().map(|q| ("queries[]", q.as_str())).collect();
        let response = self
            .authorized(self.client.get(&url).query(&params))
            .send()
            .await
            .map_err(map_transport_error)?;
        let list: DocumentList<T> = read_json(response).await?;
        Ok(list.documents)
    }

    async fn create_document<T: DeserializeOwned>(&self, collection_id: &str, data: Value) -> PortResult<T> {
        let url = format!("{}/documents", self.collection_url(collection_id));
        let response = self
            .authorized(self.client.post(&url))
            .json(&json!({ "documentId": "unique()", "data": data }))
            .send()
            .await
            .map_err(map_transport_error)?;
        read_json(response).await
    }

    async fn check_collection(&self, collection_id: &str) -> PortResult<()> {
        let response = self
            .authorized(self.client.get(self.collection_url(collection_id)))
            .send()
            .await
            .map_err(map_transport_error)?;
        let _: Value = read_json(response).await?;
        debug!(collection = collection_id, "Appwrite collection exists");
        Ok(())
    }
}

//=========================================================================================
// Wire Format
//=========================================================================================

#[derive(Deserialize)]
struct DocumentList<T> {
    documents: Vec<T>,
}

#[derive(Deserialize)]
struct UserHouseDocument {
    #[serde(rename = "$id")]
    id: String,
    #[serde(rename = "houseNo")]
    house_no: String,
    username: String,
    #[serde(rename = "userId", default)]
    user_id: Option<String>,
}
impl UserHouseDocument {
    fn to_domain(self) -> SubscriberRecord {
        SubscriberRecord {
            id: self.id,
            identifier: self.house_no,
            display_name: self.username,
            user_id: self.user_id,
        }
    }
}

#[derive(Deserialize)]
struct LeaderboardDocument {
    #[serde(rename = "$id")]
    id: String,
    #[serde(rename = "$createdAt")]
    created_at: DateTime<Utc>,
    #[serde(rename = "houseNo")]
    house_no: String,
    username: String,
    rating: i64,
    #[serde(rename = "userId", default)]
    user_id: Option<String>,
}
impl LeaderboardDocument {
    fn to_domain(self) -> PortResult<RatingRecord> {
        let rating = Rating::try_from(self.rating)
            .map_err(|e| PortError::Unexpected(format!("Document {}: {}", self.id, e)))?;
        Ok(RatingRecord {
            id: self.id,
            subscriber_id: self.user_id.clone().unwrap_or_default(),
            subscriber_name: self.username,
            identifier: self.house_no,
            user_id: self.user_id,
            call_id: None,
            rating,
            recorded_at: self.created_at,
        })
    }
}

#[derive(Deserialize)]
struct CallEventDocument {
    #[serde(rename = "eventId")]
    event_id: String,
    #[serde(rename = "callSid")]
    call_sid: String,
    #[serde(rename = "type")]
    kind: String,
    /// JSON-encoded string map.
    payload: String,
    timestamp: DateTime<Utc>,
}
impl CallEventDocument {
    fn to_domain(self) -> PortResult<CallEvent> {
        let unexpected = |e: String| PortError::Unexpected(format!("Call event {}: {}", self.event_id, e));
        let payload: BTreeMap<String, String> =
            serde_json::from_str(&self.payload).map_err(|e| unexpected(e.to_string()))?;
        Ok(CallEvent {
            id: Uuid::parse_str(&self.event_id).map_err(|e| unexpected(e.to_string()))?,
            call_id: self.call_sid.clone(),
            kind: self
                .kind
                .parse::<CallEventKind>()
                .map_err(|e| unexpected(e.to_string()))?,
            payload,
            recorded_at: self.timestamp,
        })
    }
}

/// Encodes one entry of Appwrite's `queries[]` parameter.
fn query(method: &str, attribute: Option<&str>, values: Value) -> String {
    let mut q = json!({ "method": method, "values": values });
    if let Some(attribute) = attribute {
        q["attribute"] = json!(attribute);
    }
    q.to_string()
}

fn map_transport_error(e: reqwest::Error) -> PortError {
    if e.is_timeout() || e.is_connect() {
        PortError::Unavailable(e.to_string())
    } else {
        PortError::Unexpected(e.to_string())
    }
}

fn map_status(status: StatusCode, body: &str) -> PortError {
    let detail = format!("Appwrite responded {}: {}", status, body);
    if status == StatusCode::NOT_FOUND {
        PortError::NotFound(detail)
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        PortError::Unavailable(detail)
    } else {
        PortError::Unexpected(detail)
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> PortResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(map_status(status, &body));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| PortError::Unexpected(format!("Malformed Appwrite response: {}", e)))
}

//=========================================================================================
// `PersistenceService` Trait Implementation
//=========================================================================================

#[async_trait]
impl PersistenceService for AppwriteAdapter {
    async fn find_subscriber_by_identifier(&self, identifier: &str) -> Lookup<SubscriberRecord> {
        let queries = [
            query("equal", Some("houseNo"), json!([identifier])),
            query("limit", None, json!([1])),
        ];
        let result = self
            .list_documents::<UserHouseDocument>(&self.config.user_house_collection_id, &queries)
            .await;
        Lookup::from(result.map(|docs| docs.into_iter().next().map(UserHouseDocument::to_domain)))
    }

    async fn record_rating(
        &self,
        subscriber: &SubscriberRecord,
        rating: Rating,
        call_id: Option<&str>,
    ) -> PortResult<RatingRecord> {
        let data = json!({
            "username": subscriber.display_name,
            "houseNo": subscriber.identifier,
            "date": Utc::now().format("%Y-%m-%d").to_string(),
            "rating": rating.value(),
            "userId": subscriber.user_id,
        });
        let document: LeaderboardDocument = self
            .create_document(&self.config.leaderboard_ratings_collection_id, data)
            .await?;
        info!(document_id = %document.id, identifier = %subscriber.identifier, "Rating saved to leaderboard");

        let mut record = document.to_domain()?;
        record.subscriber_id = subscriber.id.clone();
        record.call_id = call_id.map(str::to_string);
        Ok(record)
    }

    async fn append_call_event(&self, event: CallEvent) -> PortResult<()> {
        let Some(collection_id) = &self.config.call_events_collection_id else {
            return Ok(());
        };
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        let data = json!({
            "eventId": event.id.to_string(),
            "callSid": event.call_id,
            "type": event.kind.as_str(),
            "payload": payload,
            "timestamp": event.recorded_at.to_rfc3339(),
        });
        let _: Value = self.create_document(collection_id, data).await?;
        Ok(())
    }

    async fn list_ratings(&self) -> PortResult<Vec<RatingRecord>> {
        let queries = [
            query("orderDesc", Some("$createdAt"), json!([])),
            query("limit", None, json!([LIST_LIMIT])),
        ];
        let documents = self
            .list_documents::<LeaderboardDocument>(&self.config.leaderboard_ratings_collection_id, &queries)
            .await?;
        documents.into_iter().map(LeaderboardDocument::to_domain).collect()
    }

    async fn list_subscribers(&self) -> PortResult<Vec<SubscriberRecord>> {
        let queries = [
            query("orderDesc", Some("$createdAt"), json!([])),
            query("limit", None, json!([LIST_LIMIT])),
        ];
        let documents = self
            .list_documents::<UserHouseDocument>(&self.config.user_house_collection_id, &queries)
            .await?;
        Ok(documents.into_iter().map(UserHouseDocument::to_domain).collect())
    }

    async fn list_call_events(&self, call_id: &str) -> PortResult<Vec<CallEvent>> {
        let Some(collection_id) = &self.config.call_events_collection_id else {
            return Ok(Vec::new());
        };
        let queries = [
            query("equal", Some("callSid"), json!([call_id])),
            query("orderAsc", Some("timestamp"), json!([])),
            query("limit", None, json!([LIST_LIMIT])),
        ];
        let documents = self
            .list_documents::<CallEventDocument>(collection_id, &queries)
            .await?;
        documents.into_iter().map(CallEventDocument::to_domain).collect()
    }

    async fn check_health(&self) -> PortResult<()> {
        self.check_collection(&self.config.user_house_collection_id).await?;
        self.check_collection(&self.config.leaderboard_ratings_collection_id)
            .await?;
        if let Some(collection_id) = &self.config.call_events_collection_id {
            self.check_collection(collection_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queries_use_the_json_syntax() {
        let q: Value = serde_json::from_str(&query("equal", Some("houseNo"), json!(["1002"]))).unwrap();
        assert_eq!(
            q,
            json!({ "method": "equal", "attribute": "houseNo", "values": ["1002"] })
        );
        let q: Value = serde_json::from_str(&query("limit", None, json!([1]))).unwrap();
        assert!(q.get("attribute").is_none());
    }

    #[test]
    fn user_house_documents_become_subscribers() {
        let doc: UserHouseDocument = serde_json::from_value(json!({
            "$id": "doc-1",
            "$createdAt": "2024-05-01T10:00:00.000+00:00",
            "houseNo": "1002",
            "username": "Asha",
            "userId": "u-1"
        }))
        .unwrap();
        let subscriber = doc.to_domain();
        assert_eq!(subscriber.id, "doc-1");
        assert_eq!(subscriber.identifier, "1002");
        assert_eq!(subscriber.display_name, "Asha");
    }

    #[test]
    fn leaderboard_documents_become_ratings() {
        let doc: LeaderboardDocument = serde_json::from_value(json!({
            "$id": "r-1",
            "$createdAt": "2024-05-01T10:00:00.000+00:00",
            "houseNo": "1002",
            "username": "Asha",
            "date": "2024-05-01",
            "rating": 4,
            "userId": "u-1"
        }))
        .unwrap();
        let record = doc.to_domain().unwrap();
        assert_eq!(record.rating.label(), "very good");
        assert_eq!(record.subscriber_id, "u-1");
        assert_eq!(record.identifier, "1002");
    }

    #[test]
    fn http_statuses_map_to_port_errors() {
        assert!(matches!(
            map_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            PortError::Unavailable(_)
        ));
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, ""),
            PortError::NotFound(_)
        ));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, "bad key"),
            PortError::Unexpected(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_reported_as_unavailable() {
        let adapter = AppwriteAdapter::new(
            AppwriteConfig {
                endpoint: "http://127.0.0.1:9/v1".to_string(),
                project_id: "ivr".to_string(),
                api_key: "key".to_string(),
                database_id: "ivr_database".to_string(),
                user_house_collection_id: "user-house".to_string(),
                leaderboard_ratings_collection_id: "leaderboard_ratings".to_string(),
                call_events_collection_id: None,
            },
            std::time::Duration::from_millis(500),
        )
        .unwrap();

        assert!(matches!(
            adapter.find_subscriber_by_identifier("1002").await,
            Lookup::Unavailable(_)
        ));
        // Without an events collection, events are dropped silently.
        assert!(adapter
            .append_call_event(CallEvent::new("CA1", CallEventKind::CallStarted, BTreeMap::new()))
            .await
            .is_ok());
    }
}
