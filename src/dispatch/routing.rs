//! Event-to-channel routing.

use std::collections::HashMap;

use crate::dispatch::channels::ChannelType;
use crate::dispatch::envelope::EventType;

/// Maps each event type to the channels its notifications go through.
///
/// Routing is static per deployment; it is consulted once at submission
/// when delivery tasks are derived, never re-evaluated for retries.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<EventType, Vec<ChannelType>>,
}

impl Default for RoutingTable {
    /// Every event goes to live push and the durable inbox. Threshold
    /// crossings additionally go out over the webhook so external farm
    /// management systems can react.
    fn default() -> Self {
        let base = vec![ChannelType::WebSocketPush, ChannelType::DurableRecord];
        let mut routes = HashMap::new();
        for event_type in [
            EventType::EventCreated,
            EventType::EventUpdated,
            EventType::RecommendationAdded,
            EventType::MessageReceived,
        ] {
            routes.insert(event_type, base.clone());
        }
        routes.insert(
            EventType::ThresholdExceeded,
            vec![
                ChannelType::WebSocketPush,
                ChannelType::DurableRecord,
                ChannelType::OutboundWebhook,
            ],
        );
        Self { routes }
    }
}

impl RoutingTable {
    /// Build a table from explicit routes. Event types without an entry
    /// route nowhere.
    pub fn new(routes: HashMap<EventType, Vec<ChannelType>>) -> Self {
        Self { routes }
    }

    /// Channels for an event type, in routing order.
    pub fn channels_for(&self, event_type: EventType) -> &[ChannelType] {
        self.routes
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
