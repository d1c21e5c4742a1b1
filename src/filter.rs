use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;
use tracing::warn;

use crate::error::{AuditError, Result};
use crate::identity::Identity;
use crate::storage::{EventQuery, sortable_field};

pub const DEFAULT_LIMIT: u32 = 10;

/// User-facing event filter as supplied through query parameters: names
/// instead of ids, free-form time predicates, paging and multi-field
/// ordering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub source: String,
    pub resource_type: String,
    pub resource_name: String,
    pub user_name: String,
    pub event_type: String,
    pub time: BTreeMap<TimeOp, String>,
    pub offset: u32,
    pub limit: u32,
    pub sort: Vec<FieldOrder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl TimeOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Eq => "eq",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "eq" => Some(Self::Eq),
            _ => None,
        }
    }
}

impl fmt::Display for TimeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldOrder {
    pub field: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

impl FieldOrder {
    /// Parses a single `field` or `field:direction` sort element.
    fn parse(input: &str) -> Result<Self> {
        let (field, direction) = match input.split_once(':') {
            Some((field, direction)) => {
                let direction = match direction {
                    "asc" => SortDirection::Asc,
                    "desc" => SortDirection::Desc,
                    other => {
                        return Err(AuditError::BadRequest(format!(
                            "invalid sort direction '{other}', expected asc or desc"
                        )));
                    }
                };
                (field, direction)
            }
            None => (input, SortDirection::Asc),
        };
        if field.is_empty() {
            return Err(AuditError::BadRequest("empty sort field".into()));
        }
        Ok(Self {
            field: field.to_string(),
            direction,
        })
    }
}

impl EventFilter {
    /// Builds a filter from decoded query-string pairs. `time` may repeat
    /// with different operators; `sort` is a comma-separated list of
    /// `field:direction` entries. Unknown keys are ignored.
    pub fn from_query_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut filter = EventFilter::default();
        for (key, value) in pairs {
            match key.as_str() {
                "source" => filter.source = value,
                "resource_type" => filter.resource_type = value,
                "resource_name" => filter.resource_name = value,
                "user_name" => filter.user_name = value,
                "event_type" => filter.event_type = value,
                "time" => {
                    let (op, instant) = value.split_once(':').ok_or_else(|| {
                        AuditError::BadRequest(format!(
                            "time filter '{value}' must have the form operator:instant"
                        ))
                    })?;
                    let op = TimeOp::parse(op).ok_or_else(|| {
                        AuditError::BadRequest(format!(
                            "unknown time operator '{op}', expected lt, lte, gt, gte or eq"
                        ))
                    })?;
                    if !is_valid_instant(instant) {
                        return Err(AuditError::BadRequest(format!(
                            "cannot parse time instant '{instant}'"
                        )));
                    }
                    if filter.time.insert(op, instant.to_string()).is_some() {
                        return Err(AuditError::BadRequest(format!(
                            "duplicate time operator '{op}'"
                        )));
                    }
                }
                "offset" => {
                    filter.offset = value.parse().map_err(|_| {
                        AuditError::BadRequest(format!("invalid offset '{value}'"))
                    })?;
                }
                "limit" => {
                    filter.limit = value.parse().map_err(|_| {
                        AuditError::BadRequest(format!("invalid limit '{value}'"))
                    })?;
                }
                "sort" => {
                    for element in value.split(',').filter(|element| !element.is_empty()) {
                        filter.sort.push(FieldOrder::parse(element)?);
                    }
                }
                _ => {}
            }
        }
        Ok(filter)
    }
}

/// The resource kinds whose names can be translated back to ids through
/// the identity provider.
#[derive(Debug, Clone, Copy)]
enum ResourceKind {
    User,
}

const RESOURCE_ID_RESOLVERS: &[(&str, ResourceKind)] =
    &[("service/security/account/user", ResourceKind::User)];

/// Translates the user filter into a backend query: paging defaults and
/// bounds, the sort whitelist, and name→id resolution. All validation
/// happens before the first identity call.
pub async fn translate(
    filter: &EventFilter,
    identity: &dyn Identity,
    max_limit: u32,
) -> Result<EventQuery> {
    let limit = if filter.limit == 0 {
        DEFAULT_LIMIT
    } else {
        filter.limit
    };

    let page_end = filter.offset.checked_add(limit);
    if page_end.is_none_or(|end| end > max_limit) {
        return Err(AuditError::BadRequest(format!(
            "offset {} plus limit {} exceeds the maximum of {}",
            filter.offset, limit, max_limit
        )));
    }

    for order in &filter.sort {
        if sortable_field(&order.field).is_none() {
            return Err(AuditError::BadRequest(format!(
                "cannot sort by field {}",
                order.field
            )));
        }
    }

    let resource_kind = if filter.resource_name.is_empty() {
        None
    } else {
        if filter.resource_type.is_empty() {
            return Err(AuditError::BadRequest(
                "a resource_name filter requires a resource_type".into(),
            ));
        }
        let kind = RESOURCE_ID_RESOLVERS
            .iter()
            .find(|(type_uri, _)| *type_uri == filter.resource_type)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| {
                AuditError::BadRequest(format!(
                    "resource_name cannot be resolved for resource_type {}",
                    filter.resource_type
                ))
            })?;
        Some(kind)
    };

    let mut query = EventQuery {
        source: filter.source.clone(),
        resource_type: filter.resource_type.clone(),
        resource_id: String::new(),
        user_id: String::new(),
        event_type: filter.event_type.clone(),
        time: filter.time.clone(),
        offset: filter.offset,
        limit,
        sort: filter.sort.clone(),
    };

    if !filter.user_name.is_empty() {
        query.user_id = match identity.user_id(&filter.user_name).await {
            Ok(id) => id,
            Err(err) => {
                // Known wart kept from the original behavior: filter on the
                // raw name instead of failing the request.
                warn!(
                    user_name = %filter.user_name,
                    error = %err,
                    "could not resolve user name, filtering on the raw value"
                );
                filter.user_name.clone()
            }
        };
    }

    if let Some(kind) = resource_kind {
        let resolved = match kind {
            ResourceKind::User => identity.user_id(&filter.resource_name).await,
        };
        query.resource_id = match resolved {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    resource_name = %filter.resource_name,
                    error = %err,
                    "could not resolve resource name, filtering on the raw value"
                );
                filter.resource_name.clone()
            }
        };
    }

    Ok(query)
}

fn is_valid_instant(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z").is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MockIdentity;

    fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn parses_query_pairs_with_repeated_time_predicates() {
        let filter = EventFilter::from_query_pairs(pairs(&[
            ("source", "identity"),
            ("time", "gte:2017-01-01T00:00:00Z"),
            ("time", "lt:2018-01-01T00:00:00Z"),
            ("offset", "20"),
            ("limit", "50"),
            ("sort", "time:desc,event_type:asc"),
        ]))
        .unwrap();

        assert_eq!(filter.source, "identity");
        assert_eq!(filter.offset, 20);
        assert_eq!(filter.limit, 50);
        assert_eq!(filter.time.len(), 2);
        assert_eq!(
            filter.time.get(&TimeOp::Gte).map(String::as_str),
            Some("2017-01-01T00:00:00Z")
        );
        assert_eq!(filter.sort.len(), 2);
        assert_eq!(filter.sort[0].field, "time");
        assert_eq!(filter.sort[0].direction, SortDirection::Desc);
    }

    #[test]
    fn accepts_offset_timestamps_without_colon() {
        let filter = EventFilter::from_query_pairs(pairs(&[(
            "time",
            "lte:2017-05-02T12:02:46.726056+0000",
        )]))
        .unwrap();
        assert_eq!(filter.time.len(), 1);
    }

    #[test]
    fn rejects_malformed_time_predicates() {
        for value in [
            "2017-01-01T00:00:00Z",
            "between:2017-01-01T00:00:00Z",
            "gte:yesterday",
        ] {
            let result = EventFilter::from_query_pairs(pairs(&[("time", value)]));
            assert!(result.is_err(), "'{value}' should be rejected");
        }

        let result = EventFilter::from_query_pairs(pairs(&[
            ("time", "gte:2017-01-01T00:00:00Z"),
            ("time", "gte:2018-01-01T00:00:00Z"),
        ]));
        assert!(result.is_err(), "duplicate operators should be rejected");
    }

    #[test]
    fn rejects_unknown_sort_directions() {
        assert!(EventFilter::from_query_pairs(pairs(&[("sort", "time:upwards")])).is_err());
        assert!(EventFilter::from_query_pairs(pairs(&[("sort", "time:desc")])).is_ok());
        let bare = EventFilter::from_query_pairs(pairs(&[("sort", "time")])).unwrap();
        assert_eq!(bare.sort[0].direction, SortDirection::Asc);
    }

    #[tokio::test]
    async fn zero_limit_defaults_to_ten() {
        let identity = MockIdentity::new();
        let query = translate(&EventFilter::default(), &identity, 100)
            .await
            .unwrap();
        assert_eq!(query.limit, DEFAULT_LIMIT);
        assert_eq!(query.offset, 0);
    }

    #[tokio::test]
    async fn paging_bounds_are_enforced_before_any_backend_call() {
        let identity = MockIdentity::new();

        let at_limit = EventFilter {
            limit: 100,
            ..EventFilter::default()
        };
        assert!(translate(&at_limit, &identity, 100).await.is_ok());

        let over = EventFilter {
            offset: 1,
            limit: 100,
            ..EventFilter::default()
        };
        assert!(translate(&over, &identity, 100).await.is_err());

        let filter = EventFilter {
            offset: 80,
            limit: 50,
            ..EventFilter::default()
        };
        let err = translate(&filter, &identity, 100).await.unwrap_err();
        match err {
            AuditError::BadRequest(message) => {
                assert_eq!(message, "offset 80 plus limit 50 exceeds the maximum of 100");
            }
            other => panic!("expected bad request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sort_spec_is_copied_in_order() {
        let identity = MockIdentity::new();
        let filter = EventFilter {
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
            ..EventFilter::default()
        };
        let query = translate(&filter, &identity, 100).await.unwrap();
        assert_eq!(query.sort, filter.sort);

        let bad = EventFilter {
            sort: vec![FieldOrder {
                field: "priority".into(),
                direction: SortDirection::Asc,
            }],
            ..EventFilter::default()
        };
        assert!(translate(&bad, &identity, 100).await.is_err());
    }

    #[tokio::test]
    async fn verbatim_fields_survive_translation() {
        let identity = MockIdentity::new();
        let mut time = BTreeMap::new();
        time.insert(TimeOp::Gte, "2017-01-01T00:00:00Z".to_string());
        let filter = EventFilter {
            source: "identity".into(),
            resource_type: "data/security/project".into(),
            event_type: "identity.project.deleted".into(),
            time: time.clone(),
            offset: 5,
            limit: 25,
            ..EventFilter::default()
        };

        let query = translate(&filter, &identity, 100).await.unwrap();
        assert_eq!(query.source, filter.source);
        assert_eq!(query.resource_type, filter.resource_type);
        assert_eq!(query.event_type, filter.event_type);
        assert_eq!(query.time, time);
        assert_eq!(query.offset, 5);
        assert_eq!(query.limit, 25);
    }

    #[tokio::test]
    async fn user_names_resolve_to_ids() {
        let identity = MockIdentity::new();
        let filter = EventFilter {
            user_name: "svc-provisioning".into(),
            ..EventFilter::default()
        };
        let query = translate(&filter, &identity, 100).await.unwrap();
        assert_eq!(query.user_id, MockIdentity::USER_ID);
    }

    #[tokio::test]
    async fn unresolvable_user_names_pass_through_raw() {
        let identity = MockIdentity::new();
        let filter = EventFilter {
            user_name: "ghost".into(),
            ..EventFilter::default()
        };
        let query = translate(&filter, &identity, 100).await.unwrap();
        assert_eq!(query.user_id, "ghost");
    }

    #[tokio::test]
    async fn resource_name_requires_resource_type() {
        let identity = MockIdentity::new();
        let filter = EventFilter {
            resource_name: "svc-provisioning".into(),
            ..EventFilter::default()
        };
        let err = translate(&filter, &identity, 100).await.unwrap_err();
        assert!(matches!(err, AuditError::BadRequest(_)));
        assert_eq!(
            identity.lookup_calls(),
            0,
            "validation must precede identity calls"
        );
    }

    #[tokio::test]
    async fn user_resource_names_resolve_through_the_user_lookup() {
        let identity = MockIdentity::new();
        let filter = EventFilter {
            resource_type: "service/security/account/user".into(),
            resource_name: "svc-provisioning".into(),
            ..EventFilter::default()
        };
        let query = translate(&filter, &identity, 100).await.unwrap();
        assert_eq!(query.resource_id, MockIdentity::USER_ID);

        let unresolvable = EventFilter {
            resource_type: "data/security/project".into(),
            resource_name: "customer-project".into(),
            ..EventFilter::default()
        };
        assert!(translate(&unresolvable, &identity, 100).await.is_err());
    }
}
