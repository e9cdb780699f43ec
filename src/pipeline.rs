//! Wiring of the webhook path into the outbox dispatcher.

use std::sync::Arc;

use tracing::info;

use crate::broker::BrokerRelay;
use crate::config::{ConfigError, WebhookChannel};
use crate::dispatcher::HandlerRegistryBuilder;
use crate::registry::EventRegistry;
use crate::store::Store;
use crate::webhook::WebhookNotifier;

/// Binds exactly one webhook channel into `handlers`.
///
/// With [`WebhookChannel::Outbox`] the notifier handles every event named in
/// its event map. With [`WebhookChannel::Broker`] the relay forwards every
/// registered event, and a [`BrokerConsumer`](crate::broker::BrokerConsumer)
/// elsewhere owns notification; the notifier is not bound here, so no event
/// reaches a subscription through both paths.
pub fn bind_webhook_channel<S: Store>(
    mut handlers: HandlerRegistryBuilder<S>,
    registry: &EventRegistry,
    channel: WebhookChannel,
    notifier: Arc<WebhookNotifier>,
    relay: Option<Arc<BrokerRelay>>,
) -> Result<HandlerRegistryBuilder<S>, ConfigError> {
    match channel {
        WebhookChannel::Outbox => {
            let mut names: Vec<&str> = notifier.events().internal_names().collect();
            names.sort_unstable();
            for name in names {
                handlers = handlers.on_name(registry, name, notifier.clone());
            }
        }
        WebhookChannel::Broker => {
            let relay = relay.ok_or_else(|| ConfigError::Invalid {
                var: "WEBHOOK_CHANNEL",
                value: channel.to_string(),
                reason: "no broker relay configured".to_string(),
            })?;
            for shape in registry.shapes() {
                handlers = handlers.on_type(shape.type_id(), relay.clone());
            }
        }
    }
    info!(channel = %channel, "webhook channel bound");
    Ok(handlers)
}
