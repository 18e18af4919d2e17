//! `--publish` port binding parser.
//!
//! Grammar: `[[hostIP:]hostPort[-endPort]:]containerPort[-endPort][/protocol]`
//! with IPv6 host addresses in brackets. Host and container ranges must have
//! the same length; every index of the range expands to one mapping. A host
//! port of 0 means "unassigned" and stays 0 across the whole range.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One port mapping in the shape the CNI portmap capability consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(rename = "hostPort")]
    pub host_port: i32,
    #[serde(rename = "containerPort")]
    pub container_port: i32,
    #[serde(rename = "protocol")]
    pub protocol: String,
    #[serde(rename = "hostIP")]
    pub host_ip: String,
}

fn invalid(spec: &str, reason: impl Into<String>) -> Error {
    Error::InvalidPortSpec {
        spec: spec.to_string(),
        reason: reason.into(),
    }
}

/// Parses every `--publish` value into port mappings.
pub fn parse_port_bindings(specs: &[String]) -> Result<Vec<PortMapping>> {
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        out.extend(parse_one(spec)?);
    }
    Ok(out)
}

fn parse_one(spec: &str) -> Result<Vec<PortMapping>> {
    let mut proto: Option<&str> = None;
    let split_proto: Vec<&str> = spec.split('/').collect();
    match split_proto.len() {
        1 => {}
        2 => proto = Some(split_proto[1]),
        _ => return Err(invalid(spec, "protocol can only be specified once")),
    }

    let mut remainder = split_proto[0];
    let mut host_ip: Option<&str> = None;
    let mut have_v6 = false;

    // A bracketed IPv6 host address, e.g. `[::1]:8080:80`.
    let split_v6: Vec<&str> = remainder.split(']').collect();
    match split_v6.len() {
        1 => {}
        2 => {
            have_v6 = true;
            let Some(ip) = split_v6[0].strip_prefix('[') else {
                return Err(invalid(spec, "IPv6 addresses must be enclosed by []"));
            };
            let Some(rest) = split_v6[1].strip_prefix(':') else {
                return Err(invalid(spec, "IPv6 address must be followed by a colon (':')"));
            };
            host_ip = Some(ip);
            remainder = rest;
        }
        _ => return Err(invalid(spec, "at most one IPv6 address can be specified")),
    }

    let mut host_port: Option<&str> = None;
    let ctr_port;
    let split_port: Vec<&str> = remainder.split(':').collect();
    match split_port.len() {
        1 => {
            if have_v6 {
                return Err(invalid(
                    spec,
                    "must provide host and destination port when specifying an IP",
                ));
            }
            ctr_port = split_port[0];
        }
        2 => {
            host_port = Some(split_port[0]);
            ctr_port = split_port[1];
        }
        3 => {
            if have_v6 {
                return Err(invalid(
                    spec,
                    "when a v6 address is specified, the format is [ipv6]:hostPort:ctrPort",
                ));
            }
            host_ip = Some(split_port[0]);
            host_port = Some(split_port[1]);
            ctr_port = split_port[2];
        }
        _ => return Err(invalid(spec, "format is [[hostIP:]hostPort:]containerPort")),
    }

    expand(spec, host_ip, host_port, ctr_port, proto)
}

fn expand(
    spec: &str,
    host_ip: Option<&str>,
    host_port: Option<&str>,
    ctr_port: &str,
    proto: Option<&str>,
) -> Result<Vec<PortMapping>> {
    if ctr_port.is_empty() {
        return Err(invalid(spec, "must provide a non-empty container port"));
    }
    let (ctr_start, ctr_len) = parse_range(spec, ctr_port)?;

    let mut base = PortMapping {
        host_port: 0,
        container_port: ctr_start,
        protocol: String::new(),
        host_ip: String::new(),
    };

    if let Some(proto) = proto {
        base.protocol = if proto.is_empty() {
            "tcp".to_string()
        } else {
            proto.to_string()
        };
    }

    if let Some(ip) = host_ip {
        if ip.is_empty() {
            return Err(invalid(spec, "must provide a non-empty host IP"));
        }
        // The CNI portmap plugin distinguishes 0.0.0.0 from unset; this
        // runner, like docker, does not.
        if ip != "0.0.0.0" {
            let parsed: IpAddr = ip
                .parse()
                .map_err(|_| invalid(spec, format!("cannot parse {:?} as an IP address", ip)))?;
            base.host_ip = parsed.to_string();
        }
    }

    match host_port {
        // Placeholder: 0 asks for an unused port at mapping time.
        Some("") => base.host_port = 0,
        Some(port) => {
            let (host_start, host_len) = parse_range(spec, port)?;
            if host_len != ctr_len {
                return Err(invalid(
                    spec,
                    format!(
                        "host and container port ranges have different lengths: {} vs {}",
                        host_len, ctr_len
                    ),
                ));
            }
            base.host_port = host_start;
        }
        None => base.host_port = base.container_port,
    }

    let mut out = Vec::with_capacity(ctr_len as usize);
    for i in 0..ctr_len {
        let mut mapping = base.clone();
        mapping.container_port += i;
        if mapping.host_port != 0 {
            mapping.host_port += i;
        }
        out.push(mapping);
    }
    Ok(out)
}

/// Parses `port[-endPort]`, returning the start and the range length.
fn parse_range(spec: &str, range: &str) -> Result<(i32, i32)> {
    let parts: Vec<&str> = range.split('-').collect();
    if parts.len() > 2 {
        return Err(invalid(spec, "port ranges are formatted as startPort-stopPort"));
    }
    if parts[0].is_empty() {
        return Err(invalid(spec, "port numbers cannot be negative"));
    }
    let start = parse_port(spec, parts[0])?;
    if parts.len() == 1 {
        return Ok((start, 1));
    }
    if parts[1].is_empty() {
        return Err(invalid(spec, "must provide ending number for port range"));
    }
    let end = parse_port(spec, parts[1])?;
    if end <= start {
        return Err(invalid(
            spec,
            format!(
                "the end port of a range must be higher than the start port - {} is not higher than {}",
                end, start
            ),
        ));
    }
    // 8080-8081 is two ports, not one.
    Ok((start, end - start + 1))
}

fn parse_port(spec: &str, port: &str) -> Result<i32> {
    let num: i32 = port
        .parse()
        .map_err(|_| invalid(spec, format!("cannot parse {:?} as a port number", port)))?;
    if !(1..=65535).contains(&num) {
        return Err(invalid(
            spec,
            format!("port numbers must be between 1 and 65535 (inclusive), got {}", num),
        ));
    }
    Ok(num)
}
