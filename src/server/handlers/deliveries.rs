use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::Value;
use webhook_store::{DeliveryAttemptRecord, DeliveryId};

use crate::domain::events::CrmEvent;
use crate::outbound::webhook::{TriggerResult, WebhookError};
use crate::server::AppState;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

/// `POST /subscriptions/{id}/events`
pub async fn trigger_event(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<TriggerResult>, WebhookError> {
    let event: CrmEvent = request.event_type.parse()?;
    let subscription = state
        .engine
        .subscriptions()
        .get_by_id(&subscription_id)
        .await?
        .ok_or(WebhookError::SubscriptionNotFound(subscription_id))?;

    let result = state
        .engine
        .trigger(&subscription, event.as_str(), &request.data)
        .await?;
    Ok(Json(result))
}

/// `GET /subscriptions/{id}/deliveries?limit=N`, newest first.
pub async fn list_deliveries(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DeliveryAttemptRecord>>, WebhookError> {
    let records = state
        .engine
        .deliveries()
        .list_by_subscription(&subscription_id, query.limit())
        .await?;
    Ok(Json(records))
}

/// `GET /deliveries/{id}`
pub async fn get_delivery(
    State(state): State<AppState>,
    Path(delivery_id): Path<String>,
) -> Result<Json<DeliveryAttemptRecord>, WebhookError> {
    let delivery_id = DeliveryId::from(delivery_id);
    let record = state
        .engine
        .deliveries()
        .find_by_id(&delivery_id)
        .await?
        .ok_or(WebhookError::DeliveryNotFound(delivery_id))?;
    Ok(Json(record))
}

/// `POST /deliveries/{id}/retry`
pub async fn retry_delivery(
    State(state): State<AppState>,
    Path(delivery_id): Path<String>,
) -> Result<Json<TriggerResult>, WebhookError> {
    let result = state
        .engine
        .retry_now(&DeliveryId::from(delivery_id))
        .await?;
    Ok(Json(result))
}
