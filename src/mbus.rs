//! Registration feed: JSON frames from the platform message bus.
//!
//! The transport itself is an external collaborator; it hands frames to a
//! [`ChannelBus`] and flags its connection state. The consumer task
//! deserializes each frame and feeds the registry, preserving per-uri
//! ordering by processing frames serially.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::registry::RouteRegistry;
use crate::route::{Endpoint, EndpointOpts, Protocol, RouteUri};

/// Bus subjects carrying registration traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusSubject {
    Register,
    Unregister,
}

impl BusSubject {
    pub fn name(&self) -> &'static str {
        match self {
            BusSubject::Register => "router.register",
            BusSubject::Unregister => "router.unregister",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusFrame {
    pub subject: BusSubject,
    pub payload: Vec<u8>,
}

/// The interface the consumer requires of a transport binding.
#[async_trait]
pub trait RegistrationBus: Send {
    /// Next frame, or `None` when the transport has shut down for good.
    async fn recv(&mut self) -> Option<BusFrame>;

    /// Whether the transport currently holds a live connection. Drives
    /// prune suspension so a broken feed does not empty the route table.
    fn is_connected(&self) -> bool;
}

/// Producer half handed to the transport binding.
#[derive(Clone)]
pub struct BusHandle {
    sender: mpsc::Sender<BusFrame>,
    connected: Arc<AtomicBool>,
}

impl BusHandle {
    pub async fn publish(&self, subject: BusSubject, payload: Vec<u8>) {
        let _ = self.sender.send(BusFrame { subject, payload }).await;
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }
}

/// In-process bus over a bounded channel.
pub struct ChannelBus {
    receiver: mpsc::Receiver<BusFrame>,
    connected: Arc<AtomicBool>,
}

impl ChannelBus {
    pub fn new(capacity: usize) -> (BusHandle, ChannelBus) {
        let (sender, receiver) = mpsc::channel(capacity);
        let connected = Arc::new(AtomicBool::new(true));
        (
            BusHandle {
                sender,
                connected: Arc::clone(&connected),
            },
            ChannelBus {
                receiver,
                connected,
            },
        )
    }
}

#[async_trait]
impl RegistrationBus for ChannelBus {
    async fn recv(&mut self) -> Option<BusFrame> {
        self.receiver.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// A `router.register` / `router.unregister` frame body.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryMessage {
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tls_port: u16,
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub private_instance_id: String,
    #[serde(default)]
    pub private_instance_index: String,
    #[serde(default)]
    pub process_id: String,
    #[serde(default)]
    pub route_service_url: String,
    #[serde(default)]
    pub server_cert_domain_san: String,
    #[serde(default)]
    pub isolation_segment: String,
    #[serde(default)]
    pub stale_threshold_in_seconds: u64,
    #[serde(default)]
    pub protocol: String,
}

impl RegistryMessage {
    /// Builds the endpoint this frame describes. A zero threshold means
    /// "registry default"; the registry clamps it on admission.
    pub fn make_endpoint(&self) -> Endpoint {
        Endpoint::new(EndpointOpts {
            host: self.host.clone(),
            port: self.port,
            tls_port: self.tls_port,
            server_cert_domain_san: self.server_cert_domain_san.clone(),
            app_id: self.app_id.clone(),
            private_instance_id: self.private_instance_id.clone(),
            private_instance_index: self.private_instance_index.clone(),
            process_id: self.process_id.clone(),
            isolation_segment: self.isolation_segment.clone(),
            route_service_url: self.route_service_url.clone(),
            protocol: Protocol::parse(&self.protocol),
            stale_threshold: Duration::from_secs(self.stale_threshold_in_seconds),
        })
    }
}

/// Serial consumer of the registration feed.
pub struct RegistrationConsumer<B> {
    bus: B,
    registry: Arc<RouteRegistry>,
    suspend_pruning_if_unavailable: bool,
}

impl<B: RegistrationBus> RegistrationConsumer<B> {
    pub fn new(
        bus: B,
        registry: Arc<RouteRegistry>,
        suspend_pruning_if_unavailable: bool,
    ) -> RegistrationConsumer<B> {
        RegistrationConsumer {
            bus,
            registry,
            suspend_pruning_if_unavailable,
        }
    }

    pub async fn run(mut self) {
        loop {
            match self.bus.recv().await {
                Some(frame) => {
                    if self.suspend_pruning_if_unavailable {
                        self.registry
                            .set_pruning_suspended(!self.bus.is_connected());
                    }
                    self.process(frame);
                }
                None => {
                    if self.suspend_pruning_if_unavailable {
                        self.registry.set_pruning_suspended(true);
                    }
                    debug!(target: "mbus", "registration bus closed");
                    return;
                }
            }
        }
    }

    /// Applies one frame. Malformed payloads are logged and dropped; the
    /// table stays eventually consistent with the feed.
    pub fn process(&self, frame: BusFrame) {
        let message: RegistryMessage = match serde_json::from_slice(&frame.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    target: "mbus",
                    subject = frame.subject.name(),
                    payload_length = frame.payload.len(),
                    error = %e,
                    "discarding unparsable registration frame"
                );
                return;
            }
        };
        debug!(
            target: "mbus",
            subject = frame.subject.name(),
            host = %message.host,
            uris = message.uris.len(),
            "received message"
        );

        for uri in &message.uris {
            let uri = RouteUri::new(uri.as_str());
            match frame.subject {
                BusSubject::Register => {
                    self.registry.register(&uri, message.make_endpoint());
                }
                BusSubject::Unregister => {
                    self.registry.unregister(&uri, &message.make_endpoint());
                }
            }
        }
    }
}
