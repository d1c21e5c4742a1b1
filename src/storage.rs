use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::config::StorageConfig;
use crate::error::{AuditError, Result};
use crate::filter::{FieldOrder, TimeOp};

const BACKEND_TIMEOUT: Duration = Duration::from_secs(15);
const ATTRIBUTE_PAGE_SIZE: u32 = 1024;

/// An audit event as stored by the search backend: envelope attributes
/// plus the nested CADF payload. Read-only from the service's perspective;
/// enrichment only ever fills `*_name` fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    pub publisher_id: String,
    pub event_type: String,
    pub payload: CadfPayload,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadfPayload {
    pub observer: Observer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_info: Option<String>,
    #[serde(rename = "typeURI")]
    pub type_uri: String,
    pub initiator: Initiator,
    #[serde(rename = "eventTime")]
    pub event_time: String,
    pub action: String,
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub id: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub target: Target,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Observer {
    #[serde(rename = "typeURI")]
    pub type_uri: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Initiator {
    #[serde(rename = "typeURI")]
    pub type_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub host: Host,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Host {
    pub agent: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Target {
    #[serde(rename = "typeURI")]
    pub type_uri: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Backend-facing filter: the user filter with names already replaced by
/// ids. `offset + limit` is guaranteed to fit the backend's max limit by
/// the time this struct exists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    pub source: String,
    pub resource_type: String,
    pub resource_id: String,
    pub user_id: String,
    pub event_type: String,
    pub time: BTreeMap<TimeOp, String>,
    pub offset: u32,
    pub limit: u32,
    pub sort: Vec<FieldOrder>,
}

const SORTABLE_FIELDS: &[(&str, &str)] = &[
    ("time", "payload.eventTime"),
    ("event_type", "event_type"),
    ("resource_type", "payload.target.typeURI"),
    // There is no stored source field; the leading event_type segment is
    // the source, so ordering by event_type orders by source.
    ("source", "event_type"),
];

const QUERYABLE_ATTRIBUTES: &[(&str, &str)] = &[
    ("source", "event_type"),
    ("event_type", "event_type"),
    ("resource_type", "payload.target.typeURI"),
    ("resource_id", "payload.target.id"),
    ("user_id", "payload.initiator.user_id"),
    ("action", "payload.action"),
    ("outcome", "payload.outcome"),
];

/// Backend field for a whitelisted sort key, `None` for anything else.
pub fn sortable_field(name: &str) -> Option<&'static str> {
    SORTABLE_FIELDS
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, field)| *field)
}

pub fn queryable_attribute(name: &str) -> Option<&'static str> {
    QUERYABLE_ATTRIBUTES
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, field)| *field)
}

/// The capability set the query service needs from an event store. Two
/// variants: the search-backend client and the fixture-backed mock.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Matching events plus the total match count before paging.
    async fn get_events(&self, query: &EventQuery, tenant_id: &str) -> Result<(Vec<Event>, u32)>;

    async fn get_event(&self, event_id: &str, tenant_id: &str) -> Result<Event>;

    /// Distinct values of a queryable attribute, for autocomplete.
    async fn get_attributes(&self, attribute: &str, tenant_id: &str) -> Result<Vec<String>>;

    /// Largest `offset + limit` the backend accepts.
    fn max_limit(&self) -> u32;
}

/// Search-backend client. Every query is scoped to the tenant: an event is
/// visible when its initiator project or its target project matches.
pub struct ElasticStore {
    http: reqwest::Client,
    base_url: String,
    index: String,
    max_limit: u32,
}

impl ElasticStore {
    pub fn new(config: StorageConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(BACKEND_TIMEOUT)
            .build()
            .map_err(|err| AuditError::Config(format!("cannot build storage client: {err}")))?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            index: config.index,
            max_limit: config.max_limit,
        })
    }

    fn search_url(&self) -> String {
        format!("{}/{}/_search", self.base_url, self.index)
    }

    async fn search(&self, body: &Value) -> Result<Value> {
        let response = self
            .http
            .post(self.search_url())
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuditError::Storage(format!(
                "search backend returned {status}"
            )));
        }
        response.json().await.map_err(transport_error)
    }

    fn query_body(&self, query: &EventQuery, tenant_id: &str) -> Result<Value> {
        let mut filters = Vec::new();

        if !query.source.is_empty() {
            filters.push(json!({
                "prefix": {"event_type": format!("{}.", query.source)}
            }));
        }
        if !query.event_type.is_empty() {
            filters.push(json!({"term": {"event_type": query.event_type}}));
        }
        if !query.resource_type.is_empty() {
            filters.push(json!({"term": {"payload.target.typeURI": query.resource_type}}));
        }
        if !query.resource_id.is_empty() {
            filters.push(json!({"term": {"payload.target.id": query.resource_id}}));
        }
        if !query.user_id.is_empty() {
            filters.push(json!({"term": {"payload.initiator.user_id": query.user_id}}));
        }

        let mut range = serde_json::Map::new();
        for (op, instant) in &query.time {
            match op {
                TimeOp::Eq => {
                    filters.push(json!({"term": {"payload.eventTime": instant}}));
                }
                other => {
                    range.insert(other.as_str().to_string(), Value::String(instant.clone()));
                }
            }
        }
        if !range.is_empty() {
            filters.push(json!({"range": {"payload.eventTime": Value::Object(range)}}));
        }

        filters.push(tenant_clause(tenant_id));

        let mut sort_clauses = Vec::new();
        for order in &query.sort {
            let field = sortable_field(&order.field).ok_or_else(|| {
                AuditError::BadRequest(format!("cannot sort by field {}", order.field))
            })?;
            sort_clauses.push(json!({field: {"order": order.direction.as_str()}}));
        }

        Ok(json!({
            "from": query.offset,
            "size": query.limit,
            "query": {"bool": {"filter": filters}},
            "sort": sort_clauses,
            "track_total_hits": true,
        }))
    }
}

/// Events are visible to a tenant when it appears as the initiator project
/// or as the target project.
fn tenant_clause(tenant_id: &str) -> Value {
    json!({
        "bool": {
            "minimum_should_match": 1,
            "should": [
                {"term": {"payload.initiator.project_id": tenant_id}},
                {"term": {"payload.target.project_id": tenant_id}},
            ]
        }
    })
}

fn require_tenant(tenant_id: &str) -> Result<()> {
    if tenant_id.is_empty() {
        return Err(AuditError::Storage(
            "tenant scope is required for backend queries".into(),
        ));
    }
    Ok(())
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: SearchHits,
}

#[derive(Default, Deserialize)]
struct SearchHits {
    #[serde(default)]
    total: TotalHits,
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Default, Deserialize)]
struct TotalHits {
    value: u32,
}

#[derive(Deserialize)]
struct SearchHit {
    #[serde(rename = "_source")]
    source: Event,
}

#[async_trait]
impl Storage for ElasticStore {
    async fn get_events(&self, query: &EventQuery, tenant_id: &str) -> Result<(Vec<Event>, u32)> {
        require_tenant(tenant_id)?;
        let body = self.query_body(query, tenant_id)?;
        let raw = self.search(&body).await?;
        let parsed: SearchResponse =
            serde_json::from_value(raw).map_err(|err| AuditError::Storage(err.to_string()))?;
        let events = parsed.hits.hits.into_iter().map(|hit| hit.source).collect();
        Ok((events, parsed.hits.total.value))
    }

    async fn get_event(&self, event_id: &str, tenant_id: &str) -> Result<Event> {
        require_tenant(tenant_id)?;
        let body = json!({
            "size": 1,
            "query": {
                "bool": {
                    "filter": [
                        {
                            "bool": {
                                "minimum_should_match": 1,
                                "should": [
                                    {"term": {"message_id": event_id}},
                                    {"term": {"payload.id": event_id}},
                                ]
                            }
                        },
                        tenant_clause(tenant_id),
                    ]
                }
            }
        });
        let raw = self.search(&body).await?;
        let parsed: SearchResponse =
            serde_json::from_value(raw).map_err(|err| AuditError::Storage(err.to_string()))?;
        parsed
            .hits
            .hits
            .into_iter()
            .next()
            .map(|hit| hit.source)
            .ok_or(AuditError::NotFound)
    }

    async fn get_attributes(&self, attribute: &str, tenant_id: &str) -> Result<Vec<String>> {
        require_tenant(tenant_id)?;
        let field = queryable_attribute(attribute).ok_or_else(|| {
            AuditError::BadRequest(format!("attribute {attribute} is not queryable"))
        })?;
        let body = json!({
            "size": 0,
            "query": {"bool": {"filter": [tenant_clause(tenant_id)]}},
            "aggs": {
                "distinct_values": {
                    "terms": {"field": field, "size": ATTRIBUTE_PAGE_SIZE}
                }
            }
        });
        let raw = self.search(&body).await?;
        let buckets = raw
            .pointer("/aggregations/distinct_values/buckets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut values: Vec<String> = buckets
            .iter()
            .filter_map(|bucket| bucket.get("key").and_then(Value::as_str))
            .map(|key| {
                if attribute == "source" {
                    leading_segment(key).to_string()
                } else {
                    key.to_string()
                }
            })
            .collect();
        if attribute == "source" {
            values.sort();
            values.dedup();
        }
        Ok(values)
    }

    fn max_limit(&self) -> u32 {
        self.max_limit
    }
}

pub(crate) fn leading_segment(event_type: &str) -> &str {
    event_type.split('.').next().unwrap_or_default()
}

fn transport_error(err: reqwest::Error) -> AuditError {
    if err.is_timeout() {
        AuditError::Cancelled
    } else {
        AuditError::Storage(err.to_string())
    }
}

/// Fixture-backed store for tests and local development: a deterministic
/// three-event page with a total of 24, ignoring every filter and tenant
/// parameter. The only storage variant that accepts an empty tenant.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockStore;

pub const MOCK_MAX_LIMIT: u32 = 100;

#[derive(Deserialize)]
struct EventPage {
    total: u32,
    events: Vec<Event>,
}

impl MockStore {
    pub fn new() -> Self {
        Self
    }

    fn page() -> Result<EventPage> {
        serde_json::from_str(MOCK_EVENTS).map_err(AuditError::from)
    }
}

#[async_trait]
impl Storage for MockStore {
    async fn get_events(&self, _query: &EventQuery, _tenant_id: &str) -> Result<(Vec<Event>, u32)> {
        let page = Self::page()?;
        Ok((page.events, page.total))
    }

    async fn get_event(&self, event_id: &str, _tenant_id: &str) -> Result<Event> {
        let event: Event = serde_json::from_str(MOCK_EVENT)?;
        if event_id != event.payload.id && event_id != event.message_id {
            warn!(event_id, "mock store serves a fixed event regardless of id");
        }
        Ok(event)
    }

    async fn get_attributes(&self, attribute: &str, _tenant_id: &str) -> Result<Vec<String>> {
        let page = Self::page()?;
        let mut values: Vec<String> = page
            .events
            .iter()
            .filter_map(|event| match attribute {
                "source" => Some(leading_segment(&event.event_type).to_string()),
                "event_type" => Some(event.event_type.clone()),
                "resource_type" => Some(event.payload.target.type_uri.clone()),
                "resource_id" => Some(event.payload.target.id.clone()),
                _ => None,
            })
            .collect();
        values.sort();
        values.dedup();
        Ok(values)
    }

    fn max_limit(&self) -> u32 {
        MOCK_MAX_LIMIT
    }
}

const MOCK_EVENT: &str = r#"
{
    "publisher_id": "identity.keystone-2031324599-gujvn",
    "event_type": "identity.project.deleted",
    "payload": {
        "observer": {
            "typeURI": "service/security",
            "id": "493f1d6d-af50-5a4b-813b-488ecdfb1010"
        },
        "resource_info": "b3b70c8271a845709f9a03030e705da7",
        "typeURI": "http://schemas.dmtf.org/cloud/audit/1.0/event",
        "initiator": {
            "typeURI": "service/security/account/user",
            "project_id": "6a030751147a45c0863c3b5bde32c744",
            "user_id": "eb5cd8f904b06e8b2a6eb86c8b04c08e6efb89b92da77905cc8c475f30b0b812",
            "host": {
                "agent": "python-keystoneclient",
                "address": "100.65.0.11"
            },
            "id": "4a70d16f08b05d038c1e5ee7a5ee554e"
        },
        "eventTime": "2017-05-02T12:02:46.726056+0000",
        "action": "deleted.project",
        "eventType": "activity",
        "id": "d5eed458-6666-58ec-ad06-8d3cf6bafca1",
        "outcome": "success",
        "target": {
            "typeURI": "data/security/project",
            "id": "b3b70c8271a845709f9a03030e705da7"
        }
    },
    "message_id": "5a32c2f3-2996-4f46-819c-6197cf06037e",
    "priority": "info",
    "timestamp": "2017-05-02 12:02:46.726619"
}
"#;

const MOCK_EVENTS: &str = r#"
{
    "total": 24,
    "events": [{
            "publisher_id": "identity.keystone-2031324599-gujvn",
            "event_type": "identity.project.deleted",
            "payload": {
                "observer": {
                    "typeURI": "service/security",
                    "id": "493f1d6d-af50-5a4b-813b-488ecdfb1010"
                },
                "resource_info": "b3b70c8271a845709f9a03030e705da7",
                "typeURI": "http://schemas.dmtf.org/cloud/audit/1.0/event",
                "initiator": {
                    "typeURI": "service/security/account/user",
                    "project_id": "ae63ddf2076d4342a56eb049e37a7621",
                    "user_id": "eb5cd8f904b06e8b2a6eb86c8b04c08e6efb89b92da77905cc8c475f30b0b812",
                    "host": {
                        "agent": "python-keystoneclient",
                        "address": "100.65.0.11"
                    },
                    "id": "4a70d16f08b05d038c1e5ee7a5ee554e"
                },
                "eventTime": "2017-05-02T12:02:46.726056+0000",
                "action": "deleted.project",
                "eventType": "activity",
                "id": "d5eed458-6666-58ec-ad06-8d3cf6bafca1",
                "outcome": "success",
                "target": {
                    "typeURI": "data/security/project",
                    "id": "b3b70c8271a845709f9a03030e705da7"
                }
            },
            "message_id": "5a32c2f3-2996-4f46-819c-6197cf06037e",
            "priority": "info",
            "timestamp": "2017-05-02 12:02:46.726619"
        }, {
            "publisher_id": "identity.keystone-2031324599-gujvn",
            "event_type": "identity.project.deleted",
            "payload": {
                "observer": {
                    "typeURI": "service/security",
                    "id": "a66f7b00-b52d-51a1-b370-4e129bd534e2"
                },
                "resource_info": "b3b70c8271a845709f9a03030e705da7",
                "typeURI": "http://schemas.dmtf.org/cloud/audit/1.0/event",
                "initiator": {
                    "typeURI": "service/security/account/user",
                    "project_id": "ae63ddf2076d4342a56eb049e37a7621",
                    "user_id": "eb5cd8f904b06e8b2a6eb86c8b04c08e6efb89b92da77905cc8c475f30b0b812",
                    "host": {
                        "agent": "python-keystoneclient",
                        "address": "100.64.0.4"
                    },
                    "id": "4a70d16f08b05d038c1e5ee7a5ee554e"
                },
                "eventTime": "2017-05-02T11:45:49.982112+0000",
                "action": "deleted.project",
                "eventType": "activity",
                "id": "095056c9-4cbb-5200-af70-0977dbcf5000",
                "outcome": "success",
                "target": {
                    "typeURI": "data/security/project",
                    "id": "b3b70c8271a845709f9a03030e705da7"
                }
            },
            "message_id": "c3c61a95-54f9-44d0-9986-9571258646cd",
            "priority": "info",
            "timestamp": "2017-05-02 11:45:49.982909"
        }, {
            "publisher_id": "identity.keystone-2031324599-gujvn",
            "event_type": "identity.project.deleted",
            "payload": {
                "observer": {
                    "typeURI": "service/security",
                    "id": "15276db2-9b34-528c-b72a-7eca6995bf58"
                },
                "resource_info": "b3b70c8271a845709f9a03030e705da7",
                "typeURI": "http://schemas.dmtf.org/cloud/audit/1.0/event",
                "initiator": {
                    "typeURI": "service/security/account/user",
                    "project_id": "ae63ddf2076d4342a56eb049e37a7621",
                    "user_id": "eb5cd8f904b06e8b2a6eb86c8b04c08e6efb89b92da77905cc8c475f30b0b812",
                    "host": {
                        "agent": "python-keystoneclient",
                        "address": "100.64.0.4"
                    },
                    "id": "4a70d16f08b05d038c1e5ee7a5ee554e"
                },
                "eventTime": "2017-05-02T11:45:44.755215+0000",
                "action": "deleted.project",
                "eventType": "activity",
                "id": "dbd72ad7-61b4-5dab-b9ed-26068a187c7a",
                "outcome": "success",
                "target": {
                    "typeURI": "data/security/project",
                    "id": "b3b70c8271a845709f9a03030e705da7"
                }
            },
            "message_id": "0cd52307-f09f-453f-bf1b-027b2f907e94",
            "priority": "info",
            "timestamp": "2017-05-02 11:45:44.756160"
        }
    ]
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::SortDirection;

    fn elastic_store() -> ElasticStore {
        ElasticStore::new(StorageConfig {
            url: "http://localhost:9200".into(),
            index: "audit-events".into(),
            max_limit: 10_000,
        })
        .expect("client builds")
    }

    #[tokio::test]
    async fn mock_returns_the_fixed_page() {
        let store = MockStore::new();
        let (events, total) = store.get_events(&EventQuery::default(), "").await.unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(total, 24);
        assert_eq!(store.max_limit(), 100);

        let mut ids: Vec<&str> = events.iter().map(|event| event.message_id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3, "message ids must be pairwise distinct");
    }

    #[tokio::test]
    async fn mock_event_detail_parses_the_cadf_payload() {
        let store = MockStore::new();
        let event = store
            .get_event("d5eed458-6666-58ec-ad06-8d3cf6bafca1", "")
            .await
            .unwrap();

        assert_eq!(event.payload.id, "d5eed458-6666-58ec-ad06-8d3cf6bafca1");
        assert_eq!(event.payload.event_type, "activity");
        assert_eq!(event.payload.target.type_uri, "data/security/project");
        assert_eq!(event.payload.initiator.host.agent, "python-keystoneclient");
        assert!(event.payload.target.name.is_none());
    }

    #[tokio::test]
    async fn mock_attributes_are_distinct() {
        let store = MockStore::new();
        assert_eq!(
            store.get_attributes("source", "").await.unwrap(),
            vec!["identity".to_string()]
        );
        assert_eq!(
            store.get_attributes("resource_type", "").await.unwrap(),
            vec!["data/security/project".to_string()]
        );
    }

    #[test]
    fn events_serialize_without_empty_optional_fields() {
        let event: Event = serde_json::from_str(MOCK_EVENT).unwrap();
        let rendered = serde_json::to_value(&event).unwrap();

        assert!(rendered["payload"]["initiator"].get("domain_id").is_none());
        assert!(rendered["payload"]["target"].get("name").is_none());
        assert_eq!(rendered["payload"]["target"]["typeURI"], "data/security/project");
        assert_eq!(rendered["payload"]["eventTime"], "2017-05-02T12:02:46.726056+0000");
    }

    #[test]
    fn query_body_translates_filters_and_sort() {
        let store = elastic_store();
        let mut time = BTreeMap::new();
        time.insert(TimeOp::Gte, "2017-01-01T00:00:00Z".to_string());
        time.insert(TimeOp::Lt, "2018-01-01T00:00:00Z".to_string());

        let query = EventQuery {
            source: "identity".into(),
            event_type: String::new(),
            resource_type: "data/security/project".into(),
            resource_id: String::new(),
            user_id: "u-123".into(),
            time,
            offset: 20,
            limit: 10,
            sort: vec![
                FieldOrder {
                    field: "time".into(),
                    direction: SortDirection::Desc,
                },
                FieldOrder {
                    field: "event_type".into(),
                    direction: SortDirection::Asc,
                },
            ],
        };

        let body = store.query_body(&query, "tenant-1").unwrap();
        assert_eq!(body["from"], 20);
        assert_eq!(body["size"], 10);

        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert!(filters.contains(&json!({"prefix": {"event_type": "identity."}})));
        assert!(filters.contains(&json!({"term": {"payload.target.typeURI": "data/security/project"}})));
        assert!(filters.contains(&json!({"term": {"payload.initiator.user_id": "u-123"}})));
        assert!(filters.contains(&json!({
            "range": {"payload.eventTime": {
                "gte": "2017-01-01T00:00:00Z",
                "lt": "2018-01-01T00:00:00Z"
            }}
        })));
        assert!(filters.contains(&tenant_clause("tenant-1")));

        let sort = body["sort"].as_array().unwrap();
        assert_eq!(sort.len(), 2);
        assert_eq!(sort[0], json!({"payload.eventTime": {"order": "desc"}}));
        assert_eq!(sort[1], json!({"event_type": {"order": "asc"}}));
    }

    #[test]
    fn unknown_sort_fields_are_rejected() {
        let store = elastic_store();
        let query = EventQuery {
            sort: vec![FieldOrder {
                field: "priority".into(),
                direction: SortDirection::Asc,
            }],
            ..EventQuery::default()
        };
        assert!(matches!(
            store.query_body(&query, "tenant-1"),
            Err(AuditError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn elastic_requires_a_tenant_scope() {
        let store = elastic_store();
        let result = store.get_events(&EventQuery::default(), "").await;
        assert!(matches!(result, Err(AuditError::Storage(_))));
    }

    #[test]
    fn attribute_whitelist() {
        assert_eq!(queryable_attribute("source"), Some("event_type"));
        assert_eq!(queryable_attribute("outcome"), Some("payload.outcome"));
        assert_eq!(queryable_attribute("priority"), None);
        assert_eq!(sortable_field("time"), Some("payload.eventTime"));
        assert_eq!(sortable_field("message_id"), None);
    }
}
