use std::sync::Arc;

use tracing::{debug, info};

use crate::broker::{Broker, Subscription};
use crate::channel::{DeliveryChannel, ExchangeHandler};
use crate::config::{ActivationSpec, BusConfig};
use crate::error::{Error, Result};
use crate::flow::{Flow, SedaFlow, StraightThroughFlow};
use crate::observer::{ExchangeObserver, Observers};
use crate::registry::{ComponentId, Endpoint, Registry};
use crate::tx::{NoopTransactionManager, TransactionManager};

/// The embeddable bus: owns the registry, the broker and its flows, and
/// hands out a [`DeliveryChannel`] per attached component.
pub struct Bus {
    config: BusConfig,
    tx: Arc<dyn TransactionManager>,
    observers: Observers,
    registry: Arc<Registry>,
    broker: Arc<Broker>,
}

impl Bus {
    /// A bus with the default flow stack (staged delivery, falling back to
    /// straight-through for exchanges staging cannot carry) and no
    /// transaction support.
    pub fn new(config: BusConfig) -> Bus {
        Bus::with_transaction_manager(config, Arc::new(NoopTransactionManager))
    }

    pub fn with_transaction_manager(config: BusConfig, tx: Arc<dyn TransactionManager>) -> Bus {
        Bus::with_flow_factory(config, tx, |registry, tx| {
            vec![
                Arc::new(SedaFlow::new(registry.clone(), tx.clone())) as Arc<dyn Flow>,
                Arc::new(StraightThroughFlow::new(registry.clone())) as Arc<dyn Flow>,
            ]
        })
    }

    /// Full control over the flow stack; flows are tried in order for each
    /// exchange.
    pub fn with_flow_factory(
        config: BusConfig,
        tx: Arc<dyn TransactionManager>,
        flows: impl FnOnce(&Arc<Registry>, &Arc<dyn TransactionManager>) -> Vec<Arc<dyn Flow>>,
    ) -> Bus {
        let registry = Arc::new(Registry::new());
        let flows = flows(&registry, &tx);
        let broker = Arc::new(Broker::new(registry.clone(), flows));
        Bus { config, tx, observers: Observers::new(), registry, broker }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn add_observer(&self, observer: Arc<dyn ExchangeObserver>) {
        self.observers.add(observer);
    }

    pub fn subscribe(&self, subscription: Subscription) {
        self.broker.subscribe(subscription);
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.broker.unsubscribe(subscription);
    }

    /// Attach a component: create its delivery channel and activate the
    /// endpoints listed in the spec. The component pulls its exchanges
    /// through [`DeliveryChannel::accept`].
    pub fn activate_component(&self, spec: ActivationSpec) -> Result<Arc<DeliveryChannel>> {
        self.do_activate(spec, None)
    }

    /// Attach a component with a push handler; inbound exchanges are handed
    /// to it on the sender's thread when optimized delivery is enabled.
    pub fn activate_component_with_handler(
        &self,
        spec: ActivationSpec,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<Arc<DeliveryChannel>> {
        self.do_activate(spec, Some(handler))
    }

    fn do_activate(
        &self,
        spec: ActivationSpec,
        handler: Option<Arc<dyn ExchangeHandler>>,
    ) -> Result<Arc<DeliveryChannel>> {
        let id = ComponentId::new(spec.component.clone());
        if self.registry.channel(&id).is_ok() {
            return Err(Error::ComponentExists(id.to_string()));
        }
        info!(component = %id, "activating component");
        let endpoints = spec.endpoints.clone();
        let channel = DeliveryChannel::new(
            spec,
            self.config.clone(),
            Arc::downgrade(&self.broker),
            self.registry.clone(),
            self.tx.clone(),
            self.observers.clone(),
        );
        if let Some(handler) = handler {
            channel.set_handler(handler);
        }
        let mut activated: Vec<(String, String)> = Vec::new();
        for endpoint in endpoints {
            let result = self.registry.activate_endpoint(Endpoint {
                component: id.clone(),
                service: endpoint.service.clone(),
                name: endpoint.name.clone(),
                interface: endpoint.interface.clone(),
            });
            if let Err(e) = result {
                // Roll back the endpoints activated so far.
                for (service, name) in activated {
                    self.registry.deactivate_endpoint(&service, &name);
                }
                return Err(e);
            }
            activated.push((endpoint.service, endpoint.name));
        }
        self.registry.register_channel(id, channel.clone());
        Ok(channel)
    }

    /// Detach a component: close its channel and drop it from the registry.
    pub fn deactivate_component(&self, id: &ComponentId) -> Result<()> {
        let channel = self
            .registry
            .remove_channel(id)
            .ok_or_else(|| Error::NoComponent(id.to_string()))?;
        debug!(component = %id, "deactivating component");
        channel.close();
        Ok(())
    }

    pub fn channel(&self, id: &ComponentId) -> Result<Arc<DeliveryChannel>> {
        self.registry.channel(id)
    }

    /// Close every channel and stop the flows. The bus cannot be restarted.
    pub fn shutdown(&self) {
        info!("shutting down bus");
        for channel in self.registry.channels() {
            channel.close();
        }
        self.broker.shutdown();
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;
    use crate::packet::Message;
    use crate::pattern::{ExchangeStatus, Pattern, Slot};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn duplicate_component_names_are_rejected() {
        let bus = Bus::new(BusConfig::default());
        bus.activate_component(ActivationSpec::new("echo")).unwrap();
        let err = bus.activate_component(ActivationSpec::new("echo")).unwrap_err();
        assert!(matches!(err, Error::ComponentExists(_)));
    }

    #[test]
    fn endpoint_clash_rolls_back_activation() {
        let bus = Bus::new(BusConfig::default());
        bus.activate_component(ActivationSpec::new("first").with_endpoint("svc", "main"))
            .unwrap();

        let spec = ActivationSpec::new("second")
            .with_endpoint("other", "main")
            .with_endpoint("svc", "main");
        let err = bus.activate_component(spec).unwrap_err();
        assert!(matches!(err, Error::EndpointExists { .. }));
        // The endpoint activated before the clash was rolled back, and the
        // component was not registered.
        assert!(bus.registry().endpoint("other", "main").is_none());
        assert!(bus.channel(&ComponentId::from("second")).is_err());
    }

    #[test]
    fn deactivate_closes_the_channel() {
        let bus = Bus::new(BusConfig::default());
        let channel = bus.activate_component(ActivationSpec::new("echo")).unwrap();
        bus.deactivate_component(&ComponentId::from("echo")).unwrap();
        assert!(channel.is_closed());
        assert!(bus.channel(&ComponentId::from("echo")).is_err());
        assert!(matches!(
            bus.deactivate_component(&ComponentId::from("echo")),
            Err(Error::NoComponent(_))
        ));
    }

    #[test]
    fn in_only_reaches_the_provider_queue() {
        let bus = Bus::new(BusConfig::default());
        let provider = bus
            .activate_component(ActivationSpec::new("provider").with_endpoint("orders", "main"))
            .unwrap();
        let consumer = bus.activate_component(ActivationSpec::new("consumer")).unwrap();

        let exchange = consumer.exchange_factory().with_service("orders").in_only().unwrap();
        exchange.set_message(Slot::In, Message::new(json!("order-1"))).unwrap();
        consumer.send(&exchange).unwrap();

        let got = provider.accept_timeout(Some(Duration::from_secs(2))).unwrap().unwrap();
        assert_eq!(got.message(Slot::In).unwrap().content, json!("order-1"));
        assert_eq!(got.source_id(), Some(ComponentId::from("consumer")));
    }

    struct Recording {
        seen: Mutex<Vec<Exchange>>,
    }

    impl ExchangeHandler for Recording {
        fn handle(&self, exchange: Exchange) -> crate::Result<()> {
            self.seen.lock().unwrap().push(exchange);
            Ok(())
        }
    }

    #[test]
    fn push_handler_receives_on_the_sending_thread() {
        let bus = Bus::new(BusConfig::default());
        let handler = Arc::new(Recording { seen: Mutex::new(Vec::new()) });
        bus.activate_component_with_handler(
            ActivationSpec::new("provider").with_endpoint("orders", "main"),
            handler.clone(),
        )
        .unwrap();
        let consumer = bus.activate_component(ActivationSpec::new("consumer")).unwrap();

        let exchange = consumer.exchange_factory().with_service("orders").in_only().unwrap();
        exchange.set_message(Slot::In, Message::new(json!("pushed"))).unwrap();
        consumer.send(&exchange).unwrap();

        // Delivery happens on a staged worker thread, so allow a moment.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if !handler.seen.lock().unwrap().is_empty() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "push delivery never happened");
            std::thread::sleep(Duration::from_millis(5));
        }
        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen[0].message(Slot::In).unwrap().content, json!("pushed"));
        assert_eq!(seen[0].status(), ExchangeStatus::Active);
    }

    #[test]
    fn unroutable_send_surfaces_no_route() {
        let bus = Bus::new(BusConfig::default());
        let consumer = bus.activate_component(ActivationSpec::new("consumer")).unwrap();
        let exchange = consumer.exchange_factory().with_service("nowhere").in_only().unwrap();
        exchange.set_message(Slot::In, Message::new(json!(1))).unwrap();
        assert!(matches!(consumer.send(&exchange), Err(Error::NoRoute { .. })));
    }

    #[test]
    fn shutdown_closes_all_channels() {
        let bus = Bus::new(BusConfig::default());
        let a = bus.activate_component(ActivationSpec::new("a")).unwrap();
        let b = bus.activate_component(ActivationSpec::new("b")).unwrap();
        bus.shutdown();
        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
