use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::filter::{self, EventFilter};
use crate::identity::Identity;
use crate::storage::{Event, Initiator, Storage, leading_segment};

/// Compact projection of an event for list responses. `event_id` is the
/// stable message id of the backing record; the initiator block carries
/// ids always and names only after enrichment.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListEvent {
    pub source: String,
    pub event_id: String,
    pub event_type: String,
    pub event_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    pub resource_id: String,
    pub resource_type: String,
    pub initiator: Initiator,
}

impl ListEvent {
    fn project(event: &Event) -> Self {
        Self {
            source: leading_segment(&event.event_type).to_string(),
            event_id: event.message_id.clone(),
            event_type: event.event_type.clone(),
            event_time: event.payload.event_time.clone(),
            resource_name: event.payload.target.name.clone(),
            resource_id: event.payload.target.id.clone(),
            resource_type: event.payload.target.type_uri.clone(),
            initiator: event.payload.initiator.clone(),
        }
    }
}

/// Lists events matching the user filter within the tenant scope,
/// optionally enriching ids with display names.
pub async fn get_events(
    filter: &EventFilter,
    tenant_id: &str,
    identity: &dyn Identity,
    storage: &dyn Storage,
    enrich: bool,
) -> Result<(Vec<ListEvent>, u32)> {
    let query = filter::translate(filter, identity, storage.max_limit()).await?;
    debug!(tenant_id, "listing audit events");
    let (records, total) = storage.get_events(&query, tenant_id).await?;

    let mut events = Vec::with_capacity(records.len());
    for record in records {
        let mut event = ListEvent::project(&record);
        if enrich {
            let names = names_for_ids(identity, &IdRefs::for_list(&record)).await;
            apply_initiator_names(&mut event.initiator, &names);
            if names.target.is_some() {
                event.resource_name = names.target.clone();
            }
        }
        events.push(event);
    }
    Ok((events, total))
}

/// Fetches the full CADF detail for one event, with the complete name set
/// resolved when enrichment is enabled.
pub async fn get_event(
    event_id: &str,
    tenant_id: &str,
    identity: &dyn Identity,
    storage: &dyn Storage,
    enrich: bool,
) -> Result<Event> {
    let mut event = storage.get_event(event_id, tenant_id).await?;
    if enrich {
        let names = names_for_ids(identity, &IdRefs::for_detail(&event)).await;
        apply_initiator_names(&mut event.payload.initiator, &names);
        if names.target.is_some() {
            event.payload.target.name = names.target;
        }
        if names.payload_project.is_some() {
            event.payload.project_name = names.payload_project;
        }
        if names.payload_user.is_some() {
            event.payload.user_name = names.payload_user;
        }
        if names.payload_group.is_some() {
            event.payload.group_name = names.payload_group;
        }
        if names.payload_role.is_some() {
            event.payload.role_name = names.payload_role;
        }
    }
    Ok(event)
}

/// Distinct values of a queryable attribute within the tenant scope.
pub async fn get_attributes(
    attribute: &str,
    tenant_id: &str,
    storage: &dyn Storage,
) -> Result<Vec<String>> {
    storage.get_attributes(attribute, tenant_id).await
}

fn apply_initiator_names(initiator: &mut Initiator, names: &NameMap) {
    if names.domain.is_some() {
        initiator.domain_name = names.domain.clone();
    }
    if names.project.is_some() {
        initiator.project_name = names.project.clone();
    }
    if names.user.is_some() {
        initiator.user_name = names.user.clone();
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NameKind {
    Domain,
    Project,
    User,
    Group,
    Role,
}

/// Per-kind name resolution for target ids, keyed by the target's typeURI.
/// A `None` kind means the id is known to have no resolvable name.
const TARGET_NAME_KINDS: &[(&str, Option<NameKind>)] = &[
    ("data/security/project", Some(NameKind::Project)),
    // The identity provider keys these by an opaque uuid distinct from the
    // user id, so there is nothing to look up.
    ("service/security/account/user", None),
];

/// The ids of one event that may need a display name.
#[derive(Debug, Default)]
struct IdRefs {
    init_domain: Option<String>,
    init_project: Option<String>,
    init_user: String,
    target_id: String,
    target_type: String,
    payload_project: Option<String>,
    payload_user: Option<String>,
    payload_group: Option<String>,
    payload_role: Option<String>,
}

impl IdRefs {
    fn for_list(event: &Event) -> Self {
        Self {
            init_domain: event.payload.initiator.domain_id.clone(),
            init_project: event.payload.initiator.project_id.clone(),
            init_user: event.payload.initiator.user_id.clone(),
            target_id: event.payload.target.id.clone(),
            target_type: event.payload.target.type_uri.clone(),
            ..Self::default()
        }
    }

    fn for_detail(event: &Event) -> Self {
        Self {
            payload_project: event.payload.project.clone(),
            payload_user: event.payload.user.clone(),
            payload_group: event.payload.group.clone(),
            payload_role: event.payload.role.clone(),
            ..Self::for_list(event)
        }
    }
}

#[derive(Debug, Default)]
struct NameMap {
    domain: Option<String>,
    project: Option<String>,
    user: Option<String>,
    target: Option<String>,
    payload_project: Option<String>,
    payload_user: Option<String>,
    payload_group: Option<String>,
    payload_role: Option<String>,
}

/// Resolves every id in the set independently; a failed lookup leaves the
/// slot empty and never fails the request.
async fn names_for_ids(identity: &dyn Identity, ids: &IdRefs) -> NameMap {
    let mut names = NameMap::default();

    if let Some(id) = ids.init_domain.as_deref() {
        names.domain = resolve(identity, NameKind::Domain, id).await;
    }
    if let Some(id) = ids.init_project.as_deref() {
        names.project = resolve(identity, NameKind::Project, id).await;
    }
    if !ids.init_user.is_empty() {
        names.user = resolve(identity, NameKind::User, &ids.init_user).await;
    }
    if let Some(id) = ids.payload_project.as_deref() {
        names.payload_project = resolve(identity, NameKind::Project, id).await;
    }
    if let Some(id) = ids.payload_user.as_deref() {
        names.payload_user = resolve(identity, NameKind::User, id).await;
    }
    if let Some(id) = ids.payload_group.as_deref() {
        names.payload_group = resolve(identity, NameKind::Group, id).await;
    }
    if let Some(id) = ids.payload_role.as_deref() {
        names.payload_role = resolve(identity, NameKind::Role, id).await;
    }

    names.target = resolve_target(identity, &ids.target_type, &ids.target_id).await;
    names
}

async fn resolve_target(identity: &dyn Identity, target_type: &str, id: &str) -> Option<String> {
    match TARGET_NAME_KINDS
        .iter()
        .find(|(type_uri, _)| *type_uri == target_type)
    {
        Some((_, Some(kind))) => resolve(identity, *kind, id).await,
        Some((_, None)) => {
            debug!(target_type, "target kind has no name resolution");
            None
        }
        None => {
            debug!(target_type, "unhandled target type, cannot look up name");
            None
        }
    }
}

async fn resolve(identity: &dyn Identity, kind: NameKind, id: &str) -> Option<String> {
    if id.is_empty() {
        return None;
    }
    let result = match kind {
        NameKind::Domain => identity.domain_name(id).await,
        NameKind::Project => identity.project_name(id).await,
        NameKind::User => identity.user_name(id).await,
        NameKind::Group => identity.group_name(id).await,
        NameKind::Role => identity.role_name(id).await,
    };
    match result {
        Ok(name) if !name.is_empty() => Some(name),
        Ok(_) => None,
        Err(err) => {
            warn!(kind = ?kind, id, error = %err, "name lookup failed during enrichment");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MockIdentity;
    use crate::storage::MockStore;

    #[tokio::test]
    async fn lists_the_mock_page_with_distinct_event_ids() {
        let identity = MockIdentity::new();
        let storage = MockStore::new();

        let (events, total) =
            get_events(&EventFilter::default(), "", &identity, &storage, false)
                .await
                .unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(total, 24);

        let mut ids: Vec<&str> = events.iter().map(|event| event.event_id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn projection_preserves_ids_and_derives_source() {
        let identity = MockIdentity::new();
        let storage = MockStore::new();

        let (events, _) = get_events(&EventFilter::default(), "", &identity, &storage, false)
            .await
            .unwrap();
        let (records, _) = storage
            .get_events(&crate::storage::EventQuery::default(), "")
            .await
            .unwrap();

        for (event, record) in events.iter().zip(records.iter()) {
            assert_eq!(event.event_id, record.message_id);
            assert_eq!(event.source, leading_segment(&record.event_type));
            assert_eq!(event.resource_id, record.payload.target.id);
            assert_eq!(event.resource_type, record.payload.target.type_uri);
            assert_eq!(event.event_time, record.payload.event_time);
        }
    }

    #[tokio::test]
    async fn enrichment_off_never_touches_the_identity_client() {
        let identity = MockIdentity::new();
        let storage = MockStore::new();

        let (events, _) = get_events(&EventFilter::default(), "", &identity, &storage, false)
            .await
            .unwrap();

        assert_eq!(identity.lookup_calls(), 0);
        assert_eq!(identity.validation_calls(), 0);
        for event in events {
            assert!(event.resource_name.is_none());
            assert!(event.initiator.user_name.is_none());
        }
    }

    #[tokio::test]
    async fn enrichment_fills_initiator_and_resource_names() {
        let identity = MockIdentity::new();
        let storage = MockStore::new();

        let (events, _) = get_events(&EventFilter::default(), "", &identity, &storage, true)
            .await
            .unwrap();

        for event in events {
            assert_eq!(
                event.initiator.user_name.as_deref(),
                Some("svc-provisioning")
            );
            assert_eq!(event.resource_name.as_deref(), Some("decommissioned-project"));
        }
    }

    #[tokio::test]
    async fn event_detail_resolves_the_project_target() {
        let identity = MockIdentity::new();
        let storage = MockStore::new();

        let event = get_event(
            "d5eed458-6666-58ec-ad06-8d3cf6bafca1",
            "",
            &identity,
            &storage,
            true,
        )
        .await
        .unwrap();

        assert_eq!(event.payload.id, "d5eed458-6666-58ec-ad06-8d3cf6bafca1");
        assert!(!event.payload.event_type.is_empty());
        assert!(!event.payload.event_time.is_empty());
        assert_eq!(
            event.payload.target.name.as_deref(),
            Some("decommissioned-project")
        );
        assert_eq!(
            event.payload.initiator.project_name.as_deref(),
            Some("other-project")
        );
    }

    #[tokio::test]
    async fn event_detail_is_idempotent() {
        let identity = MockIdentity::new();
        let storage = MockStore::new();

        let first = get_event("5a32c2f3-2996-4f46-819c-6197cf06037e", "", &identity, &storage, true)
            .await
            .unwrap();
        let second = get_event("5a32c2f3-2996-4f46-819c-6197cf06037e", "", &identity, &storage, true)
            .await
            .unwrap();

        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn lookup_failures_leave_names_empty() {
        // An empty directory: every lookup fails.
        let identity = MockIdentity::default();
        let storage = MockStore::new();

        let (events, total) = get_events(&EventFilter::default(), "", &identity, &storage, true)
            .await
            .unwrap();

        assert_eq!(total, 24);
        for event in events {
            assert!(event.initiator.user_name.is_none());
            assert!(event.resource_name.is_none());
        }
    }

    #[tokio::test]
    async fn user_targets_are_left_unresolved() {
        let identity = MockIdentity::new();
        let name = resolve_target(
            &identity,
            "service/security/account/user",
            "4a70d16f08b05d038c1e5ee7a5ee554e",
        )
        .await;
        assert!(name.is_none());
        assert_eq!(identity.lookup_calls(), 0);

        let unhandled = resolve_target(&identity, "compute/server", "srv-1").await;
        assert!(unhandled.is_none());
        assert_eq!(identity.lookup_calls(), 0);
    }

    #[tokio::test]
    async fn attribute_listing_delegates_to_storage() {
        let storage = MockStore::new();
        let values = get_attributes("event_type", "", &storage).await.unwrap();
        assert_eq!(values, vec!["identity.project.deleted".to_string()]);
    }
}
