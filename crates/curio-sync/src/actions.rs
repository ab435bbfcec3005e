//! Domain actions built on the optimistic mutation runner.

use std::sync::Arc;

use reqwest::Method;
use serde_json::{Map, Value, json};

use crate::client::{ApiPath, Transport, segment_text};
use crate::dispatch::routes_for;
use crate::event::EntityKind;
use crate::mutation::{Mutation, MutationRunner, MutationTicket};
use crate::patch::{merge_entity, remove_entity};

/// Job status written optimistically by [`Actions::cancel_job`].
pub const STATUS_CANCELLED: &str = "cancelled";
/// Job status written optimistically by [`Actions::retry_job`].
pub const STATUS_QUEUED: &str = "queued";

/// User-triggered writes with optimistic cache updates.
#[derive(Clone)]
pub struct Actions {
    runner: MutationRunner,
    transport: Arc<dyn Transport>,
}

impl Actions {
    pub fn new(runner: MutationRunner, transport: Arc<dyn Transport>) -> Self {
        Self { runner, transport }
    }

    fn send(
        &self,
        mutation: Mutation,
        method: Method,
        path: ApiPath,
        body: Option<Value>,
    ) -> MutationTicket<Value> {
        let transport = Arc::clone(&self.transport);
        self.runner.run(mutation, async move {
            transport.request(method, &path, body).await
        })
    }

    /// Cancel a job: drop it from queue listings and mark its detail cancelled.
    pub fn cancel_job(&self, id: impl Into<Value>) -> MutationTicket<Value> {
        let id = id.into();
        let routes = routes_for(EntityKind::Job);
        let fields = status_fields(STATUS_CANCELLED);

        let list_id = id.clone();
        let detail_id = id.clone();
        let mutation = Mutation::named("cancel_job")
            .update(routes.lists(), move |_, data| remove_entity(data, &list_id))
            .update(routes.detail_of(&id), move |_, data| {
                merge_entity(data, &detail_id, &fields)
            })
            .settle(routes.stats());

        let path = ApiPath::new(["jobs".to_string(), segment_text(&id), "cancel".to_string()]);
        self.send(mutation, Method::POST, path, None)
    }

    /// Re-queue a failed or cancelled job.
    pub fn retry_job(&self, id: impl Into<Value>) -> MutationTicket<Value> {
        let id = id.into();
        let routes = routes_for(EntityKind::Job);
        let fields = status_fields(STATUS_QUEUED);

        let mutation = merge_everywhere(Mutation::named("retry_job"), EntityKind::Job, &id, fields)
            .settle(routes.stats());

        let path = ApiPath::new(["jobs".to_string(), segment_text(&id), "retry".to_string()]);
        self.send(mutation, Method::POST, path, None)
    }

    /// Edit fields of a catalog item.
    pub fn update_item(&self, id: impl Into<Value>, fields: Map<String, Value>) -> MutationTicket<Value> {
        let id = id.into();
        let routes = routes_for(EntityKind::Item);
        let body = Value::Object(fields.clone());

        let mutation = merge_everywhere(Mutation::named("update_item"), EntityKind::Item, &id, fields)
            .settle(routes.stats());

        let path = ApiPath::new(["items".to_string(), segment_text(&id)]);
        self.send(mutation, Method::PATCH, path, Some(body))
    }

    /// Delete a catalog item.
    pub fn delete_item(&self, id: impl Into<Value>) -> MutationTicket<Value> {
        let id = id.into();
        let routes = routes_for(EntityKind::Item);

        let list_id = id.clone();
        let mutation = Mutation::named("delete_item")
            .update(routes.lists(), move |_, data| remove_entity(data, &list_id))
            .settle(routes.detail_of(&id))
            .settle(routes.stats());

        let path = ApiPath::new(["items".to_string(), segment_text(&id)]);
        self.send(mutation, Method::DELETE, path, None)
    }
}

fn status_fields(status: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("status".to_string(), json!(status));
    fields
}

/// Merge `fields` into entity `id` in the family's listings and detail.
fn merge_everywhere(
    mutation: Mutation,
    entity: EntityKind,
    id: &Value,
    fields: Map<String, Value>,
) -> Mutation {
    let routes = routes_for(entity);
    let (list_id, list_fields) = (id.clone(), fields.clone());
    let (detail_id, detail_fields) = (id.clone(), fields);
    mutation
        .update(routes.lists(), move |_, data| {
            merge_entity(data, &list_id, &list_fields)
        })
        .update(routes.detail_of(id), move |_, data| {
            merge_entity(data, &detail_id, &detail_fields)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryCache;
    use crate::error::{ApiError, SyncError};
    use crate::query_key;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Records requests and answers from a fixed result.
    struct RecordingTransport {
        calls: Mutex<Vec<(Method, ApiPath, Option<Value>)>>,
        response: Result<Value, ApiError>,
    }

    impl RecordingTransport {
        fn new(response: Result<Value, ApiError>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                response,
            })
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn request(
            &self,
            method: Method,
            path: &ApiPath,
            body: Option<Value>,
        ) -> Result<Value, ApiError> {
            self.calls.lock().unwrap().push((method, path.clone(), body));
            self.response.clone()
        }
    }

    fn seeded_cache() -> Arc<QueryCache> {
        let cache = QueryCache::new();
        cache.set(
            query_key!["queue", {"status": "active"}],
            json!({"items": [{"id": "J1", "status": "running"}, {"id": "J2", "status": "running"}], "total": 2}),
        );
        cache.set(query_key!["job", "J2"], json!({"id": "J2", "status": "running"}));
        cache.set(query_key!["queue-stats"], json!({"running": 2}));
        cache.set(
            query_key!["items"],
            json!([{"id": 7, "title": "Kestrel"}, {"id": 8, "title": "Heron"}]),
        );
        cache
    }

    #[tokio::test]
    async fn test_cancel_job_success() {
        let cache = seeded_cache();
        let transport = RecordingTransport::new(Ok(json!({"ok": true})));
        let actions = Actions::new(MutationRunner::new(Arc::clone(&cache)), transport.clone());

        actions.cancel_job("J2").await.unwrap();

        let listing = cache.get(&query_key!["queue", {"status": "active"}]).unwrap();
        assert_eq!(
            listing.data,
            json!({"items": [{"id": "J1", "status": "running"}], "total": 1})
        );
        assert!(listing.is_stale);
        assert_eq!(
            cache.data(&query_key!["job", "J2"]),
            Some(json!({"id": "J2", "status": "cancelled"}))
        );
        assert!(cache.get(&query_key!["queue-stats"]).unwrap().is_stale);

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, Method::POST);
        assert_eq!(calls[0].1, ApiPath::new(["jobs", "J2", "cancel"]));
    }

    #[tokio::test]
    async fn test_cancel_job_failure_restores() {
        let cache = seeded_cache();
        let before = cache.get(&query_key!["queue", {"status": "active"}]).unwrap();
        let transport = RecordingTransport::new(Err(ApiError::from_status(409, None)));
        let actions = Actions::new(MutationRunner::new(Arc::clone(&cache)), transport);

        let err = actions.cancel_job("J2").await.unwrap_err();
        assert!(matches!(err, SyncError::Api(_)));
        assert_eq!(cache.get(&query_key!["queue", {"status": "active"}]).unwrap(), before);
        assert_eq!(
            cache.data(&query_key!["job", "J2"]),
            Some(json!({"id": "J2", "status": "running"}))
        );
    }

    #[tokio::test]
    async fn test_retry_job_marks_queued() {
        let cache = seeded_cache();
        let transport = RecordingTransport::new(Ok(Value::Null));
        let actions = Actions::new(MutationRunner::new(Arc::clone(&cache)), transport);

        actions.retry_job("J1").await.unwrap();
        let listing = cache.data(&query_key!["queue", {"status": "active"}]).unwrap();
        assert_eq!(listing["items"][0]["status"], json!("queued"));
    }

    #[tokio::test]
    async fn test_update_item_sends_fields() {
        let cache = seeded_cache();
        let transport = RecordingTransport::new(Ok(Value::Null));
        let actions = Actions::new(MutationRunner::new(Arc::clone(&cache)), transport.clone());

        let fields = json!({"title": "Nightjar"}).as_object().cloned().unwrap();
        actions.update_item(7, fields).await.unwrap();

        assert_eq!(
            cache.data(&query_key!["items"]),
            Some(json!([{"id": 7, "title": "Nightjar"}, {"id": 8, "title": "Heron"}]))
        );
        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls[0].0, Method::PATCH);
        assert_eq!(calls[0].1, ApiPath::new(["items", "7"]));
        assert_eq!(calls[0].2, Some(json!({"title": "Nightjar"})));
    }

    #[tokio::test]
    async fn test_delete_item() {
        let cache = seeded_cache();
        let transport = RecordingTransport::new(Ok(Value::Null));
        let actions = Actions::new(MutationRunner::new(Arc::clone(&cache)), transport);

        actions.delete_item(8).await.unwrap();
        assert_eq!(
            cache.data(&query_key!["items"]),
            Some(json!([{"id": 7, "title": "Kestrel"}]))
        );
    }
}
