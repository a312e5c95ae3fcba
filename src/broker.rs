use std::sync::Arc;
use std::sync::RwLock;
use std::sync::PoisonError;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::flow::Flow;
use crate::pattern::Role;
use crate::registry::{ComponentId, Endpoint, Registry};

/// Standing interest of a component in exchanges it did not explicitly
/// address. Used as a last-resort destination when endpoint resolution
/// comes up empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub component: ComponentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl Subscription {
    /// Every constraint present on the subscription must match the exchange.
    fn matches(&self, exchange: &Exchange) -> bool {
        if let Some(service) = &self.service {
            if exchange.service().as_deref() != Some(service.as_str()) {
                return false;
            }
        }
        if let Some(interface) = &self.interface {
            if exchange.interface().as_deref() != Some(interface.as_str()) {
                return false;
            }
        }
        if let Some(operation) = &self.operation {
            if exchange.operation().as_deref() != Some(operation.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Routes exchanges between delivery channels: resolves the destination of
/// outgoing requests and picks the flow that carries each exchange.
pub struct Broker {
    registry: Arc<Registry>,
    flows: Vec<Arc<dyn Flow>>,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl Broker {
    pub(crate) fn new(registry: Arc<Registry>, flows: Vec<Arc<dyn Flow>>) -> Broker {
        Broker { registry, flows, subscriptions: RwLock::new(Vec::new()) }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn subscribe(&self, subscription: Subscription) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription);
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s != subscription);
    }

    /// Route the given handle to its target component. Called with the
    /// mirror of the exchange the sender holds.
    pub fn send_exchange(&self, exchange: &Exchange) -> Result<()> {
        if exchange.role() == Role::Provider && exchange.destination_id().is_none() {
            if let Some(endpoint) = self.resolve_address(exchange) {
                trace!(exchange = %exchange.id(), endpoint = %endpoint.name, component = %endpoint.component, "resolved");
                exchange.set_endpoint(endpoint.name.clone());
                exchange.set_destination_id(endpoint.component.clone());
            } else if let Some(component) = self.match_subscription(exchange) {
                trace!(exchange = %exchange.id(), component = %component, "routed to subscriber");
                exchange.set_destination_id(component);
            }
        }
        // Replies always have a way home; requests need a destination.
        if exchange.destination_id().is_some() || exchange.role() == Role::Consumer {
            let flow = self
                .flows
                .iter()
                .find(|flow| flow.can_handle(exchange))
                .ok_or_else(|| Error::NoFlow(exchange.id()))?;
            trace!(exchange = %exchange.id(), flow = flow.name(), "dispatching");
            flow.send(exchange.clone())
        } else {
            Err(Error::NoRoute {
                id: exchange.id(),
                service: exchange.service(),
                interface: exchange.interface(),
            })
        }
    }

    /// Resolution order: explicit service+endpoint pair, then any endpoint
    /// of the service, then any endpoint of the interface.
    fn resolve_address(&self, exchange: &Exchange) -> Option<Endpoint> {
        if let (Some(service), Some(name)) = (exchange.service(), exchange.endpoint()) {
            if let Some(endpoint) = self.registry.endpoint(&service, &name) {
                return Some(endpoint);
            }
            warn!(service, endpoint = name, "addressed endpoint is not registered");
        }
        if let Some(service) = exchange.service() {
            let mut endpoints = self.registry.endpoints_for_service(&service);
            endpoints.sort_by(|a, b| a.name.cmp(&b.name));
            if let Some(endpoint) = endpoints.into_iter().next() {
                return Some(endpoint);
            }
            warn!(service, "service specified for routing, but no endpoint is registered");
        }
        if let Some(interface) = exchange.interface() {
            let mut endpoints = self.registry.endpoints_for_interface(&interface);
            endpoints.sort_by(|a, b| (a.service.clone(), a.name.clone()).cmp(&(b.service.clone(), b.name.clone())));
            if let Some(endpoint) = endpoints.into_iter().next() {
                return Some(endpoint);
            }
            warn!(interface, "interface specified for routing, but no endpoint implements it");
        }
        None
    }

    fn match_subscription(&self, exchange: &Exchange) -> Option<ComponentId> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| s.matches(exchange))
            .map(|s| s.component.clone())
    }

    pub(crate) fn shutdown(&self) {
        for flow in &self.flows {
            flow.shutdown();
        }
    }
}
