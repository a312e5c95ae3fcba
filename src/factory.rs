use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::ActivationSpec;
use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::pattern::Pattern;
use crate::registry::ComponentId;

/// Creates exchanges on behalf of one component, pre-stamped with the
/// addressing defaults from its activation spec. Obtained from
/// [`crate::channel::DeliveryChannel::exchange_factory`]; stops producing
/// once the channel closes.
#[derive(Clone)]
pub struct ExchangeFactory {
    component: ComponentId,
    service: Option<String>,
    interface: Option<String>,
    operation: Option<String>,
    endpoint: Option<String>,
    closed: Arc<AtomicBool>,
}

impl ExchangeFactory {
    pub(crate) fn new(component: ComponentId, spec: &ActivationSpec, closed: Arc<AtomicBool>) -> Self {
        ExchangeFactory {
            component,
            service: spec.destination_service.clone(),
            interface: spec.destination_interface.clone(),
            operation: spec.destination_operation.clone(),
            endpoint: spec.destination_endpoint.clone(),
            closed,
        }
    }

    /// Override the destination service for exchanges from this factory.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// A fresh consumer-side exchange of the given pattern.
    pub fn create(&self, pattern: Pattern) -> Result<Exchange> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed(self.component.to_string()));
        }
        let exchange = Exchange::new(pattern);
        if let Some(service) = &self.service {
            exchange.set_service(service.clone());
        }
        if let Some(interface) = &self.interface {
            exchange.set_interface(interface.clone());
        }
        if let Some(operation) = &self.operation {
            exchange.set_operation(operation.clone());
        }
        if let Some(endpoint) = &self.endpoint {
            exchange.set_endpoint(endpoint.clone());
        }
        Ok(exchange)
    }

    pub fn in_only(&self) -> Result<Exchange> {
        self.create(Pattern::InOnly)
    }

    pub fn robust_in_only(&self) -> Result<Exchange> {
        self.create(Pattern::RobustInOnly)
    }

    pub fn in_out(&self) -> Result<Exchange> {
        self.create(Pattern::InOut)
    }

    pub fn in_optional_out(&self) -> Result<Exchange> {
        self.create(Pattern::InOptionalOut)
    }
}
