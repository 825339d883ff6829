//! Socket registry: maps every relay socket to the connection or
//! listener that owns it.
//!
//! The registry is filled through a [`RegistryBuilder`] while the relays
//! are being built and frozen into an immutable [`Registry`] before the
//! first relay thread starts. Relay threads only ever read it, so no
//! lock is needed.

use crate::error::{ProxyError, Result};
use crate::logger::{self, BreadcrumbFlags};
use crate::tcp::TcpListenerSlot;
use crate::udp::{Side, UdpConnection};
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Raw descriptor of a relay socket.
pub type SocketId = RawFd;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketRole {
    /// receives traffic coming from `side`
    Receive,
    /// sends traffic towards `side`
    Send,
}

#[derive(Clone)]
pub enum RegistryEntry {
    Udp {
        connection: Arc<UdpConnection>,
        side: Side,
        role: SocketRole,
    },
    TcpListener {
        listener: Arc<TcpListenerSlot>,
    },
}

impl RegistryEntry {
    fn describe(&self) -> String {
        match self {
            RegistryEntry::Udp {
                connection,
                side,
                role,
            } => format!("udp {:?} {:?} of {}", role, side, connection.name()),
            RegistryEntry::TcpListener { listener } => {
                format!("tcp listener {}", listener.describe())
            }
        }
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    entries: FxHashMap<SocketId, RegistryEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: SocketId, entry: RegistryEntry) -> Result<()> {
        match self.entries.entry(id) {
            Entry::Occupied(existing) => Err(ProxyError::config(format!(
                "socket {id} already registered ({})",
                existing.get().describe()
            ))),
            Entry::Vacant(slot) => {
                logger::breadcrumb(
                    BreadcrumbFlags::REGISTRY,
                    format!("register socket {id} -> {}", entry.describe()),
                );
                slot.insert(entry);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Publishes the registry. Nothing can be added afterwards.
    pub fn freeze(self) -> Arc<Registry> {
        logger::breadcrumb(
            BreadcrumbFlags::REGISTRY,
            format!("registry frozen with {} sockets", self.entries.len()),
        );
        Arc::new(Registry {
            entries: self.entries,
        })
    }
}

pub struct Registry {
    entries: FxHashMap<SocketId, RegistryEntry>,
}

impl Registry {
    pub fn lookup(&self, id: SocketId) -> Option<&RegistryEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct UDP connections, ordered by socket id.
    pub fn udp_connections(&self) -> Vec<Arc<UdpConnection>> {
        let mut ids: Vec<&SocketId> = self.entries.keys().collect();
        ids.sort();
        let mut connections: Vec<Arc<UdpConnection>> = Vec::new();
        for id in ids {
            if let Some(RegistryEntry::Udp { connection, .. }) = self.entries.get(id) {
                if !connections.iter().any(|known| Arc::ptr_eq(known, connection)) {
                    connections.push(Arc::clone(connection));
                }
            }
        }
        connections
    }

    pub fn tcp_listeners(&self) -> Vec<Arc<TcpListenerSlot>> {
        let mut listeners: Vec<(SocketId, Arc<TcpListenerSlot>)> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| match entry {
                RegistryEntry::TcpListener { listener } => Some((*id, Arc::clone(listener))),
                RegistryEntry::Udp { .. } => None,
            })
            .collect();
        listeners.sort_by_key(|(id, _)| *id);
        listeners.into_iter().map(|(_, listener)| listener).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortBinding, TcpRedirection, UdpConnectionConfig};
    use crate::tcp::TcpOptions;
    use crate::udp::RelayOptions;
    use std::net::{Ipv4Addr, UdpSocket};

    fn free_udp_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .and_then(|socket| socket.local_addr())
            .map(|addr| addr.port())
            .expect("ephemeral port")
    }

    fn loopback_connection() -> Arc<UdpConnection> {
        let config = UdpConnectionConfig {
            entity_a_ip: Ipv4Addr::LOCALHOST,
            entity_a_port: PortBinding::Static(5005),
            entity_a_proxy_port_recv: free_udp_port(),
            entity_a_proxy_port_send: free_udp_port(),
            entity_b_ip: Ipv4Addr::LOCALHOST,
            entity_b_port: PortBinding::Dynamic,
            entity_b_proxy_port_recv: free_udp_port(),
            entity_b_proxy_port_send: free_udp_port(),
        };
        let options = RelayOptions {
            transparent: false,
            bind_ip: Ipv4Addr::LOCALHOST,
            ..RelayOptions::default()
        };
        Arc::new(UdpConnection::bind(&config, &options).expect("loopback sockets"))
    }

    #[test]
    fn every_udp_socket_maps_back_to_its_connection() {
        let connection = loopback_connection();
        let mut builder = RegistryBuilder::new();
        for (id, side, role) in connection.socket_ids() {
            builder
                .insert(
                    id,
                    RegistryEntry::Udp {
                        connection: Arc::clone(&connection),
                        side,
                        role,
                    },
                )
                .unwrap();
        }
        assert_eq!(builder.len(), 4);
        let registry = builder.freeze();

        for (id, side, role) in connection.socket_ids() {
            match registry.lookup(id) {
                Some(RegistryEntry::Udp {
                    connection: found,
                    side: found_side,
                    role: found_role,
                }) => {
                    assert!(Arc::ptr_eq(found, &connection));
                    assert_eq!(*found_side, side);
                    assert_eq!(*found_role, role);
                }
                _ => panic!("socket {id} missing from registry"),
            }
        }
        assert_eq!(registry.udp_connections().len(), 1);
        assert!(registry.tcp_listeners().is_empty());
    }

    #[test]
    fn duplicate_socket_is_rejected() {
        let connection = loopback_connection();
        let (id, side, role) = connection.socket_ids()[0];
        let entry = RegistryEntry::Udp {
            connection: Arc::clone(&connection),
            side,
            role,
        };
        let mut builder = RegistryBuilder::new();
        builder.insert(id, entry.clone()).unwrap();
        assert!(builder.insert(id, entry).is_err());
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn tcp_listeners_are_listed() {
        let options = TcpOptions {
            listen_ip: Ipv4Addr::LOCALHOST,
            ..TcpOptions::default()
        };
        let redirection = TcpRedirection {
            server_ip: Ipv4Addr::LOCALHOST,
            server_port: 9,
            proxy_port: 0,
        };
        let slot = Arc::new(TcpListenerSlot::bind(&redirection, &options).expect("listener"));
        let mut builder = RegistryBuilder::new();
        builder
            .insert(
                slot.socket_id(),
                RegistryEntry::TcpListener {
                    listener: Arc::clone(&slot),
                },
            )
            .unwrap();
        let registry = builder.freeze();
        let listeners = registry.tcp_listeners();
        assert_eq!(listeners.len(), 1);
        assert!(Arc::ptr_eq(&listeners[0], &slot));
        assert!(registry.lookup(-1).is_none());
    }
}
