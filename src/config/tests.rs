use super::*;

const SAMPLE: &str = r#"
general:
  log_level: debug
  log_dir: /tmp/fuzz-logs
network:
  docker_network_name: fuzznet
  subnet: 10.0.0.0/24
  gateway: 10.0.0.1
entities:
  server:
    role: server
    protocol: udp
    ip: 10.0.0.3
    port: 5005
    fuzzed: true
    binary_path: ./server
    exec_with: ""
    args: ["--verbose"]
  client:
    role: client
    protocol: udp
    ip: 10.0.0.2
    port: -1
    fuzzed: true
    binary_path: ./client
    exec_with: python3
    destinations:
      - ip: 10.0.0.3
        port: 5005
  web:
    role: server
    protocol: tcp
    ip: 10.0.0.5
    port: 9000
    fuzzed: false
    binary_path: ./web
    exec_with: ""
  fuzzer:
    role: fuzzer
    ip: 10.0.0.4
    port: 0
    fuzzed: false
    binary_path: ./proxy
    exec_with: ""
    connections:
      - entityA_ip: 10.0.0.3
        entityA_port: 5005
        entityA_proxy_port_recv: 20001
        entityA_proxy_port_send: 20002
        entityB_ip: 10.0.0.2
        entityB_port: -1
        entityB_proxy_port_recv: 20003
        entityB_proxy_port_send: 20004
    tcp_redirections:
      - server_ip: 10.0.0.5
        server_port: 9000
        proxy_port: 9000
"#;

#[test]
fn parses_entities_in_file_order() {
    let config = ProxyConfig::from_yaml(SAMPLE).expect("sample parses");
    let names: Vec<&str> = config.entities().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["server", "client", "web", "fuzzer"]);
    assert_eq!(config.general.log_level.as_deref(), Some("debug"));
    assert_eq!(config.network.docker_network_name, "fuzznet");

    let client = &config.entities()[1];
    assert_eq!(client.role, Role::Client);
    assert_eq!(client.protocol, Some(Protocol::Udp));
    assert_eq!(client.port, PortBinding::Dynamic);
    assert_eq!(client.destinations[0].port, PortBinding::Static(5005));
    assert_eq!(config.fuzzer().map(|f| f.name.as_str()), Some("fuzzer"));
    assert_eq!(config.fuzzer().and_then(|f| f.protocol), None);
}

#[test]
fn flattens_proxy_descriptors() {
    let config = ProxyConfig::from_yaml(SAMPLE).unwrap();
    let connections = config.udp_connections();
    assert_eq!(connections.len(), 1);
    let connection = &connections[0];
    assert_eq!(connection.entity_a_ip, Ipv4Addr::new(10, 0, 0, 3));
    assert_eq!(connection.entity_a_port, PortBinding::Static(5005));
    assert_eq!(connection.entity_b_port, PortBinding::Dynamic);
    assert_eq!(connection.proxy_ports(), [20001, 20002, 20003, 20004]);

    let redirections = config.tcp_redirections();
    assert_eq!(
        redirections,
        vec![TcpRedirection {
            server_ip: Ipv4Addr::new(10, 0, 0, 5),
            server_port: 9000,
            proxy_port: 9000,
        }]
    );
    config.validate().expect("sample is valid");
}

#[test]
fn partitions_by_protocol_and_ip() {
    let config = ProxyConfig::from_yaml(SAMPLE).unwrap();
    assert_eq!(config.entities_with_protocol(Protocol::Udp).count(), 2);
    assert_eq!(config.entities_with_protocol(Protocol::Tcp).count(), 1);
    let at: Vec<&str> = config
        .entities_at("10.0.0.5")
        .map(|e| e.name.as_str())
        .collect();
    assert_eq!(at, vec!["web"]);
}

#[test]
fn missing_port_is_dynamic() {
    let yaml = r#"
entities:
  lonely:
    role: client
    ip: 10.0.0.9
"#;
    let config = ProxyConfig::from_yaml(yaml).unwrap();
    assert_eq!(config.entities()[0].port, PortBinding::Dynamic);
    assert!(!config.entities()[0].fuzzed);
}

#[test]
fn rejects_out_of_range_port() {
    let yaml = r#"
entities:
  broken:
    role: client
    ip: 10.0.0.9
    port: 70000
"#;
    let error = ProxyConfig::from_yaml(yaml).unwrap_err();
    assert!(matches!(error, ProxyError::Config(_)));
    assert!(error.to_string().contains("broken"));
}

#[test]
fn rejects_duplicate_proxy_ports() {
    let yaml = r#"
entities:
  fuzzer:
    role: fuzzer
    ip: 10.0.0.4
    connections:
      - entityA_ip: 10.0.0.3
        entityA_port: 5005
        entityA_proxy_port_recv: 20001
        entityA_proxy_port_send: 20002
        entityB_ip: 10.0.0.2
        entityB_port: 6006
        entityB_proxy_port_recv: 20003
        entityB_proxy_port_send: 20004
    tcp_redirections:
      - server_ip: 10.0.0.5
        server_port: 9000
        proxy_port: 20002
"#;
    let config = ProxyConfig::from_yaml(yaml).unwrap();
    let error = config.validate().unwrap_err();
    assert!(error.to_string().contains("20002"), "{error}");
}

#[test]
fn rejects_bad_connection_address() {
    let yaml = r#"
entities:
  fuzzer:
    role: fuzzer
    ip: 10.0.0.4
    connections:
      - entityA_ip: not-an-ip
        entityA_port: 5005
        entityA_proxy_port_recv: 20001
        entityA_proxy_port_send: 20002
        entityB_ip: 10.0.0.2
        entityB_port: 6006
        entityB_proxy_port_recv: 20003
        entityB_proxy_port_send: 20004
"#;
    assert!(ProxyConfig::from_yaml(yaml).is_err());
}

#[test]
fn port_binding_from_raw() {
    assert_eq!(PortBinding::from_raw(-1), Some(PortBinding::Dynamic));
    assert_eq!(PortBinding::from_raw(40000), Some(PortBinding::Static(40000)));
    assert_eq!(PortBinding::from_raw(-2), None);
    assert_eq!(PortBinding::Static(7).as_static(), Some(7));
    assert!(PortBinding::Dynamic.is_dynamic());
    assert_eq!(PortBinding::Dynamic.to_string(), "dynamic");
}
