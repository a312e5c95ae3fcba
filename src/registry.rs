use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::channel::DeliveryChannel;
use crate::error::{Error, Result};

/// Stable name of a component attached to the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(String);

impl ComponentId {
    pub fn new(name: impl Into<String>) -> Self {
        ComponentId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentId {
    fn from(value: &str) -> Self {
        ComponentId(value.to_string())
    }
}

/// An activated service endpoint, addressable by service+name or interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub component: ComponentId,
    pub service: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

/// Live directory of components and their endpoints.
#[derive(Debug, Default)]
pub struct Registry {
    channels: DashMap<ComponentId, Arc<DeliveryChannel>>,
    // keyed by (service, endpoint name)
    endpoints: DashMap<(String, String), Endpoint>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_channel(&self, id: ComponentId, channel: Arc<DeliveryChannel>) {
        self.channels.insert(id, channel);
    }

    pub fn remove_channel(&self, id: &ComponentId) -> Option<Arc<DeliveryChannel>> {
        self.channels.remove(id).map(|(_, channel)| channel)
    }

    pub fn channel(&self, id: &ComponentId) -> Result<Arc<DeliveryChannel>> {
        self.channels
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NoComponent(id.to_string()))
    }

    /// Every registered channel, in unspecified order.
    pub fn channels(&self) -> Vec<Arc<DeliveryChannel>> {
        self.channels.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn activate_endpoint(&self, endpoint: Endpoint) -> Result<()> {
        let key = (endpoint.service.clone(), endpoint.name.clone());
        use dashmap::mapref::entry::Entry;
        match self.endpoints.entry(key) {
            Entry::Occupied(_) => Err(Error::EndpointExists {
                service: endpoint.service,
                endpoint: endpoint.name,
            }),
            Entry::Vacant(slot) => {
                slot.insert(endpoint);
                Ok(())
            }
        }
    }

    pub fn deactivate_endpoint(&self, service: &str, name: &str) -> Option<Endpoint> {
        self.endpoints
            .remove(&(service.to_string(), name.to_string()))
            .map(|(_, endpoint)| endpoint)
    }

    pub fn endpoint(&self, service: &str, name: &str) -> Option<Endpoint> {
        self.endpoints
            .get(&(service.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// All endpoints exposing the given service, in unspecified order.
    pub fn endpoints_for_service(&self, service: &str) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .filter(|entry| entry.value().service == service)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn endpoints_for_interface(&self, interface: &str) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .filter(|entry| entry.value().interface.as_deref() == Some(interface))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn endpoints_for_component(&self, id: &ComponentId) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .filter(|entry| &entry.value().component == id)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(component: &str, service: &str, name: &str) -> Endpoint {
        Endpoint {
            component: ComponentId::from(component),
            service: service.to_string(),
            name: name.to_string(),
            interface: Some(format!("{service}-api")),
        }
    }

    #[test]
    fn endpoint_activation_is_exclusive() {
        let registry = Registry::new();
        registry.activate_endpoint(endpoint("a", "orders", "main")).unwrap();

        let err = registry.activate_endpoint(endpoint("b", "orders", "main")).unwrap_err();
        assert!(matches!(err, Error::EndpointExists { .. }));

        // Same service under a different endpoint name is fine.
        registry.activate_endpoint(endpoint("b", "orders", "backup")).unwrap();
        assert_eq!(registry.endpoints_for_service("orders").len(), 2);
    }

    #[test]
    fn deactivate_frees_the_name() {
        let registry = Registry::new();
        registry.activate_endpoint(endpoint("a", "orders", "main")).unwrap();
        assert!(registry.deactivate_endpoint("orders", "main").is_some());
        assert!(registry.deactivate_endpoint("orders", "main").is_none());
        registry.activate_endpoint(endpoint("b", "orders", "main")).unwrap();
    }

    #[test]
    fn lookup_by_interface_and_component() {
        let registry = Registry::new();
        registry.activate_endpoint(endpoint("a", "orders", "main")).unwrap();
        registry.activate_endpoint(endpoint("a", "billing", "main")).unwrap();

        assert_eq!(registry.endpoints_for_interface("orders-api").len(), 1);
        assert_eq!(registry.endpoints_for_component(&ComponentId::from("a")).len(), 2);
        assert!(registry.endpoints_for_interface("nothing").is_empty());
    }

    #[test]
    fn missing_component_is_an_error() {
        let registry = Registry::new();
        let err = registry.channel(&ComponentId::from("ghost")).unwrap_err();
        assert!(matches!(err, Error::NoComponent(name) if name == "ghost"));
    }
}
