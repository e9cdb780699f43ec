use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::error::WebhookError;
use super::model::{NewDelivery, NewSubscription, WebhookDelivery, WebhookSubscription};

/// Persistence for subscriptions and the delivery audit trail.
#[async_trait]
pub trait WebhookStore: Send + Sync + 'static {
    async fn create_subscription(
        &self,
        subscription: NewSubscription,
    ) -> Result<WebhookSubscription, WebhookError>;

    /// Removes the subscription; its delivery rows stay. Returns whether it
    /// existed.
    async fn delete_subscription(&self, id: Uuid) -> Result<bool, WebhookError>;

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), WebhookError>;

    async fn set_event_filter(
        &self,
        id: Uuid,
        event_filter: BTreeSet<String>,
    ) -> Result<(), WebhookError>;

    async fn subscription(&self, id: Uuid) -> Result<Option<WebhookSubscription>, WebhookError>;

    /// Active subscriptions whose filter contains `event_type`, oldest first.
    async fn active_subscriptions_for(
        &self,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>, WebhookError>;

    async fn create_delivery(&self, delivery: NewDelivery) -> Result<WebhookDelivery, WebhookError>;

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), WebhookError>;

    async fn delivery(&self, id: i64) -> Result<Option<WebhookDelivery>, WebhookError>;

    async fn deliveries_for(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<WebhookDelivery>, WebhookError>;
}

#[derive(Default)]
struct WebhookState {
    subscriptions: HashMap<Uuid, WebhookSubscription>,
    deliveries: BTreeMap<i64, WebhookDelivery>,
    next_delivery_id: i64,
}

#[derive(Clone, Default)]
pub struct InMemoryWebhookStore {
    state: Arc<RwLock<WebhookState>>,
}

impl InMemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn modify<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut WebhookSubscription) -> R,
    ) -> Result<R, WebhookError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| WebhookError::LockPoisoned("subscription write"))?;
        let subscription = state
            .subscriptions
            .get_mut(&id)
            .ok_or(WebhookError::SubscriptionNotFound(id))?;
        Ok(f(subscription))
    }
}

#[async_trait]
impl WebhookStore for InMemoryWebhookStore {
    async fn create_subscription(
        &self,
        subscription: NewSubscription,
    ) -> Result<WebhookSubscription, WebhookError> {
        subscription.validate()?;
        let created = subscription.into_subscription(Uuid::new_v4(), Utc::now());
        let mut state = self
            .state
            .write()
            .map_err(|_| WebhookError::LockPoisoned("subscription write"))?;
        state.subscriptions.insert(created.id, created.clone());
        Ok(created)
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<bool, WebhookError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| WebhookError::LockPoisoned("subscription write"))?;
        Ok(state.subscriptions.remove(&id).is_some())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), WebhookError> {
        self.modify(id, |subscription| subscription.is_active = active)
    }

    async fn set_event_filter(
        &self,
        id: Uuid,
        event_filter: BTreeSet<String>,
    ) -> Result<(), WebhookError> {
        self.modify(id, |subscription| subscription.event_filter = event_filter)
    }

    async fn subscription(&self, id: Uuid) -> Result<Option<WebhookSubscription>, WebhookError> {
        let state = self
            .state
            .read()
            .map_err(|_| WebhookError::LockPoisoned("subscription read"))?;
        Ok(state.subscriptions.get(&id).cloned())
    }

    async fn active_subscriptions_for(
        &self,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>, WebhookError> {
        let state = self
            .state
            .read()
            .map_err(|_| WebhookError::LockPoisoned("subscription read"))?;
        let mut matching: Vec<WebhookSubscription> = state
            .subscriptions
            .values()
            .filter(|subscription| subscription.accepts(event_type))
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(matching)
    }

    async fn create_delivery(&self, delivery: NewDelivery) -> Result<WebhookDelivery, WebhookError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| WebhookError::LockPoisoned("delivery write"))?;
        state.next_delivery_id += 1;
        let created = WebhookDelivery::pending(state.next_delivery_id, delivery, Utc::now());
        state.deliveries.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), WebhookError> {
        delivery.check()?;
        let mut state = self
            .state
            .write()
            .map_err(|_| WebhookError::LockPoisoned("delivery write"))?;
        let stored = state
            .deliveries
            .get_mut(&delivery.id)
            .ok_or(WebhookError::DeliveryNotFound(delivery.id))?;
        *stored = delivery.clone();
        Ok(())
    }

    async fn delivery(&self, id: i64) -> Result<Option<WebhookDelivery>, WebhookError> {
        let state = self
            .state
            .read()
            .map_err(|_| WebhookError::LockPoisoned("delivery read"))?;
        Ok(state.deliveries.get(&id).cloned())
    }

    async fn deliveries_for(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        let state = self
            .state
            .read()
            .map_err(|_| WebhookError::LockPoisoned("delivery read"))?;
        Ok(state
            .deliveries
            .values()
            .filter(|delivery| delivery.subscription_id == subscription_id)
            .cloned()
            .collect())
    }
}
