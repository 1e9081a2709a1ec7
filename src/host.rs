//! The host engine the DHT stacks are set up on.

use crate::common::Shared;
use crate::config::Config;
use crate::registry::Registry;
use crate::transport::udp::{real, Bind};
use crate::udp_tracker::UdpTrackerClient;

/// Identifier of a command scheduled on the host run loop.
pub type Cuid = u64;

#[derive(Debug)]
/// State shared between the DHT stacks and the rest of the host application.
pub struct Host {
    config: Config,
    binder: Box<dyn Bind>,
    dht: Registry,
    /// The UDP port every host service uses, `0` until negotiated.
    udp_port: u16,
    udp_tracker_client: Option<Shared<UdpTrackerClient>>,
    next_cuid: Cuid,
}

impl Host {
    /// Create a host binding real UDP sockets.
    pub fn new(config: Config) -> Self {
        Self::with_binder(config, Box::new(real::Binder))
    }

    pub fn with_binder(config: Config, binder: Box<dyn Bind>) -> Self {
        Host {
            config,
            binder,
            dht: Registry::new(),
            udp_port: 0,
            udp_tracker_client: None,
            next_cuid: 1,
        }
    }

    // === Getters ===

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn binder(&self) -> &dyn Bind {
        self.binder.as_ref()
    }

    pub fn dht(&self) -> &Registry {
        &self.dht
    }

    pub(crate) fn dht_mut(&mut self) -> &mut Registry {
        &mut self.dht
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn udp_tracker_client(&self) -> Option<&Shared<UdpTrackerClient>> {
        self.udp_tracker_client.as_ref()
    }

    // === Setters ===

    pub fn set_udp_port(&mut self, port: u16) {
        self.udp_port = port;
    }

    pub fn set_udp_tracker_client(&mut self, client: Option<Shared<UdpTrackerClient>>) {
        self.udp_tracker_client = client;
    }

    // === Public Methods ===

    pub fn new_cuid(&mut self) -> Cuid {
        let cuid = self.next_cuid;
        self.next_cuid += 1;
        cuid
    }
}
