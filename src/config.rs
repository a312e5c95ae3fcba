use serde::{Deserialize, Serialize};

/// Outbound rate limiting for one component. Every `interval`-th send pauses
/// the sending thread for `timeout_ms` before the exchange leaves the
/// channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throttling {
    pub interval: u32,
    pub timeout_ms: u64,
}

/// Endpoint to activate when a component joins the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub service: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

fn default_queue_capacity() -> usize {
    1024
}

/// Everything the bus needs to know to attach one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationSpec {
    pub component: String,
    /// Capacity of the inbound exchange queue; senders block when full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttling: Option<Throttling>,
    /// Component-level persistence default for exchanges it originates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    /// Default addressing stamped on exchanges created for this component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<EndpointSpec>,
}

impl ActivationSpec {
    pub fn new(component: impl Into<String>) -> Self {
        ActivationSpec {
            component: component.into(),
            queue_capacity: default_queue_capacity(),
            throttling: None,
            persistent: None,
            destination_service: None,
            destination_interface: None,
            destination_operation: None,
            destination_endpoint: None,
            endpoints: Vec::new(),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_throttling(mut self, interval: u32, timeout_ms: u64) -> Self {
        self.throttling = Some(Throttling { interval, timeout_ms });
        self
    }

    pub fn with_destination_service(mut self, service: impl Into<String>) -> Self {
        self.destination_service = Some(service.into());
        self
    }

    pub fn with_endpoint(mut self, service: impl Into<String>, name: impl Into<String>) -> Self {
        self.endpoints.push(EndpointSpec {
            service: service.into(),
            name: name.into(),
            interface: None,
        });
        self
    }
}

fn default_true() -> bool {
    true
}

/// Bus-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Automatically enlist sends made from a thread with an ambient
    /// transaction.
    #[serde(default)]
    pub auto_enlist: bool,
    /// Bus-wide persistence default, used when neither the exchange nor the
    /// component spec says otherwise.
    #[serde(default)]
    pub persistent: bool,
    /// Deliver straight to the target's handler on the sending thread when
    /// the target registered one, skipping its queue.
    #[serde(default = "default_true")]
    pub optimized_delivery: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig { auto_enlist: false, persistent: false, optimized_delivery: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_from_minimal_json() {
        let spec: ActivationSpec = serde_json::from_str(r#"{"component": "echo"}"#).unwrap();
        assert_eq!(spec.component, "echo");
        assert_eq!(spec.queue_capacity, 1024);
        assert!(spec.throttling.is_none());
        assert!(spec.endpoints.is_empty());
    }

    #[test]
    fn bus_config_defaults() {
        let config = BusConfig::default();
        assert!(!config.auto_enlist);
        assert!(!config.persistent);
        assert!(config.optimized_delivery);

        let parsed: BusConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn builder_covers_throttling_and_endpoints() {
        let spec = ActivationSpec::new("router")
            .with_queue_capacity(8)
            .with_throttling(5, 100)
            .with_destination_service("orders")
            .with_endpoint("router-svc", "main");
        assert_eq!(spec.queue_capacity, 8);
        assert_eq!(spec.throttling, Some(Throttling { interval: 5, timeout_ms: 100 }));
        assert_eq!(spec.destination_service.as_deref(), Some("orders"));
        assert_eq!(spec.endpoints.len(), 1);
    }
}
