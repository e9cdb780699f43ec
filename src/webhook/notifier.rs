use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::error::WebhookError;
use super::model::{
    DeliveryStatus, NewDelivery, WebhookDelivery, WebhookSubscription,
};
use super::sender::{WebhookPayload, WebhookSender};
use super::store::WebhookStore;
use crate::core::AnyEvent;
use crate::dispatcher::{EventHandler, HandlerContext, HandlerError};
use crate::registry::SerializedEvent;
use crate::store::Store;

/// Internal event names exposed to webhook subscribers, and the external type
/// each is published as. Events not listed are never sent out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookEventMap {
    mapping: HashMap<String, String>,
}

impl WebhookEventMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, internal: impl Into<String>, external: impl Into<String>) -> Self {
        self.mapping.insert(internal.into(), external.into());
        self
    }

    pub fn external_type(&self, internal: &str) -> Option<&str> {
        self.mapping.get(internal).map(String::as_str)
    }

    pub fn internal_names(&self) -> impl Iterator<Item = &str> {
        self.mapping.keys().map(String::as_str)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NotifyReport {
    pub subscriptions: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Fans an event out to every active subscription for its external type.
pub struct WebhookNotifier {
    store: Arc<dyn WebhookStore>,
    sender: WebhookSender,
    events: WebhookEventMap,
}

impl WebhookNotifier {
    pub fn new(store: Arc<dyn WebhookStore>, sender: WebhookSender, events: WebhookEventMap) -> Self {
        Self {
            store,
            sender,
            events,
        }
    }

    pub fn events(&self) -> &WebhookEventMap {
        &self.events
    }

    /// Creates a PENDING delivery row per matching subscription, then sends
    /// them all concurrently.
    ///
    /// Errors only when subscriptions cannot be read or delivery rows cannot
    /// be created; individual delivery failures end up on their rows. Rows
    /// created before such an error are marked FAILED and nothing is sent.
    pub async fn notify(&self, event: &SerializedEvent) -> Result<NotifyReport, WebhookError> {
        let Some(event_type) = self.events.external_type(&event.event_name) else {
            debug!(event_name = %event.event_name, "event not exposed to webhooks");
            return Ok(NotifyReport::default());
        };

        let subscriptions = self.store.active_subscriptions_for(event_type).await?;
        if subscriptions.is_empty() {
            debug!(event_type, "no active webhook subscriptions");
            return Ok(NotifyReport::default());
        }

        let payload = serde_json::to_value(WebhookPayload::from_event(event_type, event))?;
        let mut pending = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let created = self
                .store
                .create_delivery(NewDelivery {
                    subscription_id: subscription.id,
                    event_type: event_type.to_string(),
                    payload: payload.clone(),
                })
                .await;
            match created {
                Ok(delivery) => pending.push((subscription, delivery)),
                Err(err) => {
                    self.abandon(pending, &err).await;
                    return Err(err);
                }
            }
        }

        let outcomes = join_all(
            pending
                .iter()
                .map(|(subscription, delivery)| self.sender.deliver(subscription, delivery.clone())),
        )
        .await;

        let report = NotifyReport {
            subscriptions: outcomes.len(),
            delivered: outcomes
                .iter()
                .filter(|delivery| delivery.status == DeliveryStatus::Success)
                .count(),
            failed: outcomes
                .iter()
                .filter(|delivery| delivery.status == DeliveryStatus::Failed)
                .count(),
        };
        info!(
            event_type,
            aggregate_id = %event.aggregate_id,
            subscriptions = report.subscriptions,
            delivered = report.delivered,
            failed = report.failed,
            "webhooks dispatched"
        );
        Ok(report)
    }
}

impl WebhookNotifier {
    /// Fails rows created before the fan-out was cut short. The event is
    /// notified again on retry, with fresh rows.
    async fn abandon(
        &self,
        pending: Vec<(WebhookSubscription, WebhookDelivery)>,
        cause: &WebhookError,
    ) {
        for (_, mut delivery) in pending {
            delivery.fail(format!("fan-out aborted: {cause}"), None);
            if let Err(err) = self.store.update_delivery(&delivery).await {
                warn!(
                    delivery_id = delivery.id,
                    error = %err,
                    "could not mark abandoned webhook delivery as failed"
                );
            }
        }
    }
}

#[async_trait]
impl<S: Store> EventHandler<S> for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook-notifier"
    }

    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_, S>,
        _event: &dyn AnyEvent,
    ) -> Result<(), HandlerError> {
        let event = ctx.record().to_serialized();
        self.notify(&event)
            .await
            .map(|_| ())
            .map_err(|err| HandlerError::retryable(err.to_string()))
    }
}
