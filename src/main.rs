//! Pingora-based reverse proxy fronting a dynamic fleet of platform
//! backends.
//!
//! The proxy receives registration frames from the platform message bus
//! and updates its routing table without restart; a periodic pruner
//! removes endpoints whose registrations have gone stale.

mod access_log;
mod config;
mod drain;
mod errors;
mod health;
mod mbus;
mod metrics;
mod proxy;
mod registry;
mod route;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Cli, Config};
use crate::drain::DrainController;
use crate::mbus::{ChannelBus, RegistrationConsumer};
use crate::proxy::RouterProxy;
use crate::registry::{RegistryOpts, RouteRegistry};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    if cli.json {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter)
            .init();
    }

    let file = config::load_file_config(cli.config.as_ref())?;
    let cfg = Arc::new(Config::resolve(file, cli.listen.as_deref())?);
    tracing::info!(listen = %cfg.listen, "fleetgate starting");

    // Shared components
    let registry = Arc::new(RouteRegistry::new(RegistryOpts {
        prune_stale_droplets_interval: cfg.prune_stale_droplets_interval,
        droplet_stale_threshold: cfg.droplet_stale_threshold,
        max_conns_per_backend: cfg.max_conns_per_backend,
        load_balancing_algorithm: cfg.load_balance,
        sharding_mode: cfg.routing_table_sharding_mode,
        isolation_segments: cfg.isolation_segments.clone(),
        empty_pool_timeout: cfg.empty_pool_timeout,
        empty_pool_response_code_503: cfg.empty_pool_response_code_503,
    }));
    let drain = DrainController::new();

    // The producer half is the seam the deployment's bus binding feeds;
    // it must stay alive for the life of the process or the consumer
    // treats the feed as disconnected.
    let (bus_handle, bus) = ChannelBus::new(1024);

    // Registration consumer, prune cycle and the side servers run on
    // their own runtime in a background thread.
    {
        let registry = Arc::clone(&registry);
        let drain = Arc::clone(&drain);
        let cfg = Arc::clone(&cfg);
        std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            rt.block_on(async move {
                let consumer = RegistrationConsumer::new(
                    bus,
                    Arc::clone(&registry),
                    cfg.suspend_pruning_if_bus_unavailable,
                );
                tokio::spawn(consumer.run());

                let _prune_task = registry.start_pruning_cycle();

                if let Some(addr) = cfg.metrics_listen {
                    tokio::spawn(async move {
                        if let Err(e) = metrics::serve_metrics(addr).await {
                            tracing::error!(error = %e, "metrics server error");
                        }
                    });
                }

                {
                    let drain = Arc::clone(&drain);
                    let drain_timeout = cfg.drain_timeout;
                    tokio::spawn(async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            tracing::info!("drain requested");
                            drain.begin_drain();
                            match drain.wait(drain_timeout).await {
                                Ok(()) => tracing::info!("drain complete"),
                                Err(_) => {
                                    tracing::warn!("drain timed out with connections active")
                                }
                            }
                        }
                    });
                }

                tracing::info!(addr = %cfg.health_listen, "health server listening");
                if let Err(e) =
                    health::start_health_server(cfg.health_listen, drain, registry).await
                {
                    tracing::error!(error = %e, "health server error");
                }
            });
        });
    }
    let _transport_handle = bus_handle;

    // Create Pingora server
    let opt = Opt::default();
    let mut server = Server::new(Some(opt))?;
    server.bootstrap();

    let gateway = RouterProxy::new(Arc::clone(&cfg), registry, drain);
    let mut proxy_service = http_proxy_service(&server.configuration, gateway);
    proxy_service.add_tcp(&cfg.listen.to_string());

    tracing::info!(addr = %cfg.listen, "proxy listening");

    server.add_service(proxy_service);
    server.run_forever();
}
