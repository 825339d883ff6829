#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod logger;
pub mod mutation;
pub mod registry;
pub mod task;
pub mod tcp;
pub mod telemetry;
pub mod udp;

#[cfg(test)]
mod tests;

use crate::config::{Protocol, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::logger::BreadcrumbFlags;
use crate::mutation::{MutationEngine, MutatorConfig};
use crate::registry::{Registry, RegistryBuilder};
use crate::task::TaskSet;
use crate::tcp::{TcpOptions, TcpRelay};
use crate::telemetry::Telemetry;
use crate::udp::{RelayOptions, UdpRelay};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Everything a relay thread needs, cloned into each thread.
#[derive(Clone)]
pub struct RelayContext {
    pub registry: Arc<Registry>,
    pub engine: Arc<MutationEngine>,
    pub telemetry: Arc<Telemetry>,
    pub tasks: Arc<TaskSet>,
}

#[derive(Clone, Debug, Default)]
pub struct ProxyOptions {
    pub mutator: MutatorConfig,
    pub relay: RelayOptions,
    pub tcp: TcpOptions,
}

/// The running proxy: both relay engines, the frozen registry and the
/// threads serving them.
pub struct Proxy {
    udp: UdpRelay,
    tcp: TcpRelay,
    context: RelayContext,
    state: Mutex<ProxyState>,
}

#[derive(Default)]
struct ProxyState {
    running: bool,
    stopped: bool,
}

impl Proxy {
    pub fn new(config: &ProxyConfig, options: ProxyOptions) -> Self {
        let engine = Arc::new(MutationEngine::new(&options.mutator));
        Self::with_engine(config, options, engine)
    }

    /// Builds both relays and freezes the registry. No thread runs until
    /// [`Proxy::start`].
    pub fn with_engine(
        config: &ProxyConfig,
        options: ProxyOptions,
        engine: Arc<MutationEngine>,
    ) -> Self {
        for protocol in [Protocol::Udp, Protocol::Tcp] {
            let names: Vec<&str> = config
                .entities_with_protocol(protocol)
                .map(|entity| entity.name.as_str())
                .collect();
            logger::info(format!("{protocol:?} entities: [{}]", names.join(", ")));
        }

        let mut registry = RegistryBuilder::new();
        let udp = UdpRelay::build(&config.udp_connections(), &options.relay, &mut registry);
        let tcp = TcpRelay::build(&config.tcp_redirections(), &options.tcp, &mut registry);
        let context = RelayContext {
            registry: registry.freeze(),
            engine,
            telemetry: Arc::new(Telemetry::new()),
            tasks: Arc::new(TaskSet::new()),
        };

        logger::breadcrumb(
            BreadcrumbFlags::BOOT,
            format!(
                "proxy built (udp connections={}, tcp listeners={}, style={})",
                udp.connections().len(),
                tcp.listeners().len(),
                context.engine.style()
            ),
        );

        Self {
            udp,
            tcp,
            context,
            state: Mutex::new(ProxyState::default()),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(ProxyError::config("proxy already stopped"));
        }
        if state.running {
            return Err(ProxyError::config("proxy already started"));
        }
        let udp_threads = self
            .udp
            .start(&self.context)
            .map_err(|err| ProxyError::io("spawn udp relay thread", err))?;
        let tcp_threads = self
            .tcp
            .start(&self.context)
            .map_err(|err| ProxyError::io("spawn tcp accept thread", err))?;
        state.running = true;
        logger::info(format!(
            "proxy running ({udp_threads} udp receive threads, {tcp_threads} tcp listeners)"
        ));
        Ok(())
    }

    /// Stops every relay thread and waits for them. Safe to call twice.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.running = false;
        }
        // Joining happens unlocked so state queries stay responsive.
        logger::breadcrumb(BreadcrumbFlags::BOOT, "proxy stop requested");
        self.context.tasks.shutdown_and_join();
        logger::breadcrumb(BreadcrumbFlags::BOOT, "proxy stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Blocks until a relay thread hits an unrecoverable error.
    pub fn wait_fatal(&self) -> Option<ProxyError> {
        self.context.tasks.wait_fatal()
    }

    pub fn wait_fatal_timeout(&self, timeout: Duration) -> Option<ProxyError> {
        self.context.tasks.wait_fatal_timeout(timeout)
    }

    pub fn udp_connection_count(&self) -> usize {
        self.udp.connections().len()
    }

    pub fn tcp_listener_count(&self) -> usize {
        self.tcp.listeners().len()
    }

    pub fn local_tcp_ports(&self) -> Vec<u16> {
        self.tcp
            .listeners()
            .iter()
            .map(|slot| slot.local_addr().port())
            .collect()
    }

    pub fn registry(&self) -> &Registry {
        &self.context.registry
    }

    pub fn engine(&self) -> &MutationEngine {
        &self.context.engine
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.context.telemetry
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.stop();
    }
}
