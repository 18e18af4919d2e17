//! Tests for the `--publish` port binding parser.

use bodman::network::ports::{PortMapping, parse_port_bindings};

fn parse(specs: &[&str]) -> Vec<PortMapping> {
    let specs: Vec<String> = specs.iter().map(|s| s.to_string()).collect();
    parse_port_bindings(&specs).unwrap()
}

fn parse_err(spec: &str) -> String {
    parse_port_bindings(&[spec.to_string()])
        .unwrap_err()
        .to_string()
}

// =============================================================================
// Shape Tests
// =============================================================================

#[test]
fn test_host_ip_port_and_container_port() {
    assert_eq!(
        parse(&["127.0.0.1:8080:80"]),
        vec![PortMapping {
            host_ip: "127.0.0.1".to_string(),
            host_port: 8080,
            container_port: 80,
            protocol: String::new(),
        }]
    );
}

#[test]
fn test_ipv6_host_ip_with_protocol() {
    assert_eq!(
        parse(&["[::1]:8080:80/udp"]),
        vec![PortMapping {
            host_ip: "::1".to_string(),
            host_port: 8080,
            container_port: 80,
            protocol: "udp".to_string(),
        }]
    );
}

#[test]
fn test_port_range_expands() {
    let mappings = parse(&["8080-8081:80-81"]);
    assert_eq!(
        mappings
            .iter()
            .map(|m| (m.host_port, m.container_port))
            .collect::<Vec<_>>(),
        vec![(8080, 80), (8081, 81)]
    );
}

#[test]
fn test_wildcard_ip_normalized_to_empty() {
    assert_eq!(parse(&["0.0.0.0:80:80"])[0].host_ip, "");
}

#[test]
fn test_container_port_only_mirrors_host_port() {
    let m = parse(&["9000"]);
    assert_eq!(m[0].host_port, 9000);
    assert_eq!(m[0].container_port, 9000);
    assert_eq!(m[0].host_ip, "");
}

#[test]
fn test_multiple_specs_concatenate() {
    let mappings = parse(&["80:80", "443:443/tcp"]);
    assert_eq!(mappings.len(), 2);
    assert_eq!(mappings[1].protocol, "tcp");
}

// =============================================================================
// Quantified Properties
// =============================================================================

#[test]
fn test_all_parsed_mappings_are_in_range() {
    let specs = ["80", "1-10:91-100", "127.0.0.1:65535:65535", ":70-75/udp"];
    for spec in specs {
        for mapping in parse(&[spec]) {
            assert!((1..=65535).contains(&mapping.container_port), "{}", spec);
            assert!((0..=65535).contains(&mapping.host_port), "{}", spec);
            assert!(
                mapping.protocol.is_empty() || ["tcp", "udp"].contains(&mapping.protocol.as_str()),
                "{}",
                spec
            );
            if !mapping.host_ip.is_empty() {
                assert!(mapping.host_ip.parse::<std::net::IpAddr>().is_ok(), "{}", spec);
            }
        }
    }
}

#[test]
fn test_unassigned_host_port_stays_zero_across_range() {
    let mappings = parse(&[":8000-8003"]);
    assert_eq!(mappings.len(), 4);
    assert!(mappings.iter().all(|m| m.host_port == 0));
    assert_eq!(mappings[3].container_port, 8003);
}

// =============================================================================
// Error Tests
// =============================================================================

#[test]
fn test_range_length_mismatch() {
    assert!(parse_err("8080-8082:80-81").contains("different lengths"));
}

#[test]
fn test_descending_range() {
    assert!(parse_err("8081-8080:80-81").contains("higher than the start"));
}

#[test]
fn test_double_protocol() {
    assert!(parse_err("80/tcp/udp").contains("protocol"));
}

#[test]
fn test_unbracketed_ipv6() {
    assert!(parse_port_bindings(&["::1:8080:80".to_string()]).is_err());
}

#[test]
fn test_ipv6_requires_host_port() {
    assert!(parse_port_bindings(&["[::1]:80".to_string()]).is_err());
}

#[test]
fn test_port_zero_and_overflow() {
    assert!(parse_port_bindings(&["0:80".to_string()]).is_err());
    assert!(parse_port_bindings(&["65536:80".to_string()]).is_err());
}

#[test]
fn test_garbage_ip() {
    assert!(parse_err("999.0.0.1:80:80").contains("IP address"));
}
