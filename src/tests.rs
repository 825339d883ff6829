use super::*;
use crate::error::MutatorError;
use crate::mutation::{Corruptor, FuzzStyle, MIN_OUTPUT_SIZE, UDP_PAYLOAD_CEILING};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream, UdpSocket};
use std::thread;
use std::time::Instant;

struct NoMutator;

impl Corruptor for NoMutator {
    fn corrupt(&self, _input: &[u8]) -> std::result::Result<Vec<u8>, MutatorError> {
        Err(MutatorError::Empty)
    }
}

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .and_then(|socket| socket.local_addr())
        .map(|addr| addr.port())
        .expect("ephemeral udp port")
}

fn free_tcp_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("ephemeral tcp port")
}

fn loopback_options() -> ProxyOptions {
    ProxyOptions {
        mutator: MutatorConfig::default(),
        relay: RelayOptions {
            transparent: false,
            bind_ip: Ipv4Addr::LOCALHOST,
            poll_interval: Duration::from_millis(20),
        },
        tcp: TcpOptions {
            listen_ip: Ipv4Addr::LOCALHOST,
            connect_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(20),
        },
    }
}

fn no_mutator() -> Arc<MutationEngine> {
    Arc::new(MutationEngine::with_corruptor(
        FuzzStyle::Randomization,
        Arc::new(NoMutator),
    ))
}

fn config_yaml(a_port: u16, udp_ports: [u16; 4], server_port: u16, proxy_port: u16) -> String {
    format!(
        r#"
entities:
  server:
    role: server
    protocol: udp
    ip: 127.0.0.1
    port: {a_port}
  client:
    role: client
    protocol: udp
    ip: 127.0.0.1
    port: -1
  web:
    role: server
    protocol: tcp
    ip: 127.0.0.1
    port: {server_port}
  fuzzer:
    role: fuzzer
    ip: 127.0.0.1
    port: 0
    connections:
      - entityA_ip: 127.0.0.1
        entityA_port: {a_port}
        entityA_proxy_port_recv: {}
        entityA_proxy_port_send: {}
        entityB_ip: 127.0.0.1
        entityB_port: -1
        entityB_proxy_port_recv: {}
        entityB_proxy_port_send: {}
    tcp_redirections:
      - server_ip: 127.0.0.1
        server_port: {server_port}
        proxy_port: {proxy_port}
"#,
        udp_ports[0], udp_ports[1], udp_ports[2], udp_ports[3]
    )
}

fn fresh_udp_ports() -> [u16; 4] {
    [free_udp_port(), free_udp_port(), free_udp_port(), free_udp_port()]
}

#[test]
fn proxy_relays_udp_and_tcp() {
    let entity_a = UdpSocket::bind("127.0.0.1:0").expect("entity A");
    entity_a
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    let a_port = entity_a.local_addr().expect("addr").port();
    let upstream = TcpListener::bind("127.0.0.1:0").expect("upstream");
    let server_port = upstream.local_addr().expect("addr").port();
    let udp_ports = fresh_udp_ports();
    let proxy_port = free_tcp_port();

    let config = ProxyConfig::from_yaml(&config_yaml(a_port, udp_ports, server_port, proxy_port))
        .expect("config");
    config.validate().expect("valid config");

    let proxy = Proxy::with_engine(&config, loopback_options(), no_mutator());
    assert_eq!(proxy.udp_connection_count(), 1);
    assert_eq!(proxy.tcp_listener_count(), 1);
    assert_eq!(proxy.local_tcp_ports(), vec![proxy_port]);
    assert_eq!(proxy.registry().len(), 5);
    assert!(!proxy.is_running());

    proxy.start().expect("start");
    assert!(proxy.is_running());

    entity_a
        .send_to(b"ping", (Ipv4Addr::LOCALHOST, udp_ports[0]))
        .expect("udp send");
    let mut buf = vec![0u8; 70_000];
    let (len, _) = entity_a.recv_from(&mut buf).expect("udp relayed");
    assert_eq!(len, UDP_PAYLOAD_CEILING);
    assert!(buf.starts_with(b"ping"));

    let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, proxy_port)).expect("client");
    let (mut server, _) = upstream.accept().expect("upstream accept");
    server
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    client.write_all(b"GET /").expect("client write");
    let mut at_server = vec![0u8; MIN_OUTPUT_SIZE];
    server.read_exact(&mut at_server).expect("tcp relayed");
    assert!(at_server.starts_with(b"GET /"));

    proxy.stop();
    assert!(!proxy.is_running());
    assert!(proxy.start().is_err());
}

#[test]
fn start_twice_is_rejected() {
    let config = ProxyConfig::default();
    let proxy = Proxy::with_engine(&config, loopback_options(), no_mutator());
    assert_eq!(proxy.udp_connection_count(), 0);
    assert!(proxy.registry().is_empty());
    proxy.start().expect("first start");
    assert!(proxy.start().is_err());
    proxy.stop();
    proxy.stop();
}

#[test]
fn unbindable_udp_connection_leaves_tcp_serving() {
    let held = UdpSocket::bind("127.0.0.1:0").expect("held port");
    let mut udp_ports = fresh_udp_ports();
    udp_ports[2] = held.local_addr().expect("addr").port();
    let config = ProxyConfig::from_yaml(&config_yaml(5005, udp_ports, 9, free_tcp_port()))
        .expect("config");

    let proxy = Proxy::with_engine(&config, loopback_options(), no_mutator());
    assert_eq!(proxy.udp_connection_count(), 0);
    assert_eq!(proxy.tcp_listener_count(), 1);
    assert_eq!(proxy.registry().len(), 1);
}

#[test]
fn unreachable_upstream_surfaces_as_fatal() {
    let server_port = free_tcp_port();
    let proxy_port = free_tcp_port();
    let config = ProxyConfig::from_yaml(&config_yaml(
        5005,
        fresh_udp_ports(),
        server_port,
        proxy_port,
    ))
    .expect("config");
    let proxy = Proxy::with_engine(&config, loopback_options(), no_mutator());
    proxy.start().expect("start");
    assert!(proxy.wait_fatal_timeout(Duration::from_millis(50)).is_none());

    let _client = TcpStream::connect((Ipv4Addr::LOCALHOST, proxy_port)).expect("client");
    match proxy.wait_fatal_timeout(Duration::from_secs(5)) {
        Some(ProxyError::UpstreamConnect { addr, .. }) => assert_eq!(addr.port(), server_port),
        other => panic!("expected upstream failure, got {other:?}"),
    }
}

#[test]
fn stop_returns_while_the_server_stalls() {
    let upstream = TcpListener::bind("127.0.0.1:0").expect("upstream");
    let server_port = upstream.local_addr().expect("addr").port();
    let proxy_port = free_tcp_port();
    let config = ProxyConfig::from_yaml(&config_yaml(5005, fresh_udp_ports(), server_port, proxy_port))
        .expect("config");
    let proxy = Arc::new(Proxy::with_engine(&config, loopback_options(), no_mutator()));
    proxy.start().expect("start");

    let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, proxy_port)).expect("client");
    // Accepted and then ignored: nothing drains what the proxy sends.
    let (_server, _) = upstream.accept().expect("upstream accept");
    for _ in 0..64 {
        client.write_all(b"x").expect("client write");
        thread::sleep(Duration::from_millis(2));
    }
    thread::sleep(Duration::from_millis(100));

    let (stopped_tx, stopped_rx) = crossbeam_channel::bounded(1);
    let stopping = Arc::clone(&proxy);
    thread::spawn(move || {
        stopping.stop();
        let _ = stopped_tx.send(());
    });
    assert!(
        stopped_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
        "stop hung behind a stalled server"
    );
    assert!(!proxy.is_running());
}

#[test]
fn state_queries_answer_while_stop_is_joining() {
    let proxy = Arc::new(Proxy::with_engine(
        &ProxyConfig::default(),
        loopback_options(),
        no_mutator(),
    ));
    proxy.start().expect("start");
    // A thread that ignores the shutdown token keeps stop() busy joining.
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    proxy
        .context
        .tasks
        .spawn("slow-teardown", move || {
            let _ = release_rx.recv();
        })
        .expect("spawn");

    let (stopped_tx, stopped_rx) = crossbeam_channel::bounded(1);
    let stopping = Arc::clone(&proxy);
    thread::spawn(move || {
        stopping.stop();
        let _ = stopped_tx.send(());
    });

    let (state_tx, state_rx) = crossbeam_channel::bounded(1);
    let querying = Arc::clone(&proxy);
    thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        while querying.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let _ = state_tx.send(querying.is_running());
    });
    assert_eq!(state_rx.recv_timeout(Duration::from_secs(5)).ok(), Some(false));
    assert!(stopped_rx.try_recv().is_err());
    assert!(proxy.start().is_err());

    release_tx.send(()).expect("release");
    assert!(stopped_rx.recv_timeout(Duration::from_secs(5)).is_ok());
}
