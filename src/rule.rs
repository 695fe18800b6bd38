// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Compilation of parsed rules into nftables expression lists.
//!
//! One [`RuleSpec`](../types/struct.RuleSpec.html) compiles into the
//! expression list of exactly one rule in a container chain:
//!
//! ```text
//! [ proto-match, peer-match*, sport?, dport?, counter?, log?, terminal ]
//! ```
//!
//! The terminal is `goto` when the rule diverts to a named chain, otherwise
//! `return`: "accept" in a container chain is implemented as fall-through so
//! the parent chain continues to evaluate.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use failure::format_err;
use serde_json::{json, Value};

use crate::errors::{FirewhaleError, Result};
use crate::nftables::service_set_name;
use crate::types::{ContainerSpec, Direction, PortSpec, Protocol, RuleSpec};

/// The RFC1918 prefixes making up `local-networks`.
const LOCAL_NETWORKS: [(&str, u8); 3] = [
    ("10.0.0.0", 8),
    ("172.16.0.0", 12),
    ("192.168.0.0", 16),
];

/// Parse and compile one labelled rule string.
///
/// Errors carry the offending rule verbatim so the operator can find the
/// label they came from.
pub fn compile_rule_string(
    raw: &str,
    container: &ContainerSpec,
    direction: Direction,
    referenced_services: &mut BTreeSet<String>,
) -> Result<Value> {
    let spec: RuleSpec = raw.parse().map_err(|reason| FirewhaleError::InvalidRule {
        rule: raw.to_owned(),
        reason,
    })?;
    compile_rule(&spec, container, direction, referenced_services).map_err(|e| {
        FirewhaleError::InvalidRule {
            rule: raw.to_owned(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Compile one rule into its nftables expression list.
///
/// Service peers the rule references are added to `referenced_services` as
/// fully-qualified `<service>.<network>` identifiers.
pub fn compile_rule(
    rule: &RuleSpec,
    container: &ContainerSpec,
    direction: Direction,
    referenced_services: &mut BTreeSet<String>,
) -> Result<Value> {
    let mut exprs = Vec::new();

    let proto_right = match rule.proto {
        Some(proto) => json!(proto.as_ref()),
        None => json!({ "set": ["tcp", "udp"] }),
    };
    exprs.push(match_expr(
        "==",
        json!({ "payload": { "protocol": "ip", "field": "protocol" } }),
        proto_right,
    ));

    exprs.extend(peer_matchers(
        &rule.peer,
        container,
        direction,
        referenced_services,
    )?);

    let port_protocol = match rule.proto {
        Some(Protocol::Udp) => "udp",
        _ => "tcp",
    };
    if let Some(port) = &rule.src_port {
        exprs.push(match_expr(
            "==",
            json!({ "payload": { "protocol": port_protocol, "field": "sport" } }),
            port_json(port),
        ));
    }
    if let Some(port) = &rule.dst_port {
        exprs.push(match_expr(
            "==",
            json!({ "payload": { "protocol": port_protocol, "field": "dport" } }),
            port_json(port),
        ));
    }

    if rule.counter {
        exprs.push(json!({ "counter": null }));
    }
    if let Some(prefix) = &rule.log_prefix {
        exprs.push(json!({ "log": { "prefix": prefix, "level": "info" } }));
    }

    match &rule.chain {
        Some(chain) => exprs.push(json!({ "goto": { "target": chain } })),
        None => exprs.push(json!({ "return": null })),
    }

    Ok(Value::Array(exprs))
}

/// Resolve a network reference against a container's attachments.
///
/// The name is first matched verbatim; failing that, with the container's
/// namespace prefixed. Unresolvable names pass through unchanged (a service
/// reference may legitimately point at a network this container is not
/// attached to).
pub fn full_network_name(container: &ContainerSpec, net: &str) -> String {
    if container.networks.contains_key(net) {
        return net.to_owned();
    }
    if let Some(namespace) = &container.namespace {
        let candidate = format!("{}_{}", namespace, net);
        if container.networks.contains_key(&candidate) {
            return candidate;
        }
    }
    net.to_owned()
}

fn peer_matchers(
    peer: &str,
    container: &ContainerSpec,
    direction: Direction,
    referenced_services: &mut BTreeSet<String>,
) -> Result<Vec<Value>> {
    // No peer restriction at all.
    if peer == "*" {
        return Ok(Vec::new());
    }

    let mut invert = false;
    let mut peer = peer;
    if peer.starts_with('!') {
        invert = true;
        peer = &peer[1..];
    }

    // `internet` is the complement of the local networks.
    if peer == "internet" {
        invert = !invert;
        peer = "local-networks";
    }

    let op = if invert { "!=" } else { "==" };
    let left = json!({ "payload": { "protocol": "ip", "field": direction.address_field() } });

    if peer == "local-networks" {
        if invert {
            // "not in any of the prefixes": one rule, every prefix excluded.
            return Ok(LOCAL_NETWORKS
                .iter()
                .map(|(addr, len)| {
                    match_expr(op, left.clone(), json!({ "prefix": { "addr": addr, "len": len } }))
                })
                .collect());
        }
        // "in any of the prefixes": a single anonymous-set match.
        let prefixes: Vec<Value> = LOCAL_NETWORKS
            .iter()
            .map(|(addr, len)| json!({ "prefix": { "addr": addr, "len": len } }))
            .collect();
        return Ok(vec![match_expr(op, left, json!({ "set": prefixes }))]);
    }

    // The container's own attachment on a network.
    if peer.starts_with("*.") {
        let net = full_network_name(container, &peer[2..]);
        let attachment = container
            .networks
            .get(&net)
            .ok_or_else(|| format_err!("network '{}' is not attached", net))?;
        let ip = attachment
            .ipv4
            .ok_or_else(|| format_err!("network '{}' has no address", net))?;
        return Ok(vec![match_expr(
            op,
            left,
            json!({ "prefix": { "addr": ip.to_string(), "len": attachment.prefix_len } }),
        )]);
    }

    // Inclusive address range.
    if peer.contains('-') {
        let halves: Vec<&str> = peer.splitn(2, '-').map(str::trim).collect();
        if halves.len() == 2 {
            let bounds = (
                halves[0].parse::<Ipv4Addr>(),
                halves[1].parse::<Ipv4Addr>(),
            );
            if let (Ok(lo), Ok(hi)) = bounds {
                return Ok(vec![match_expr(
                    op,
                    left,
                    json!({ "range": [lo.to_string(), hi.to_string()] }),
                )]);
            }
        }
    }

    // Host or CIDR.
    {
        let mut parts = peer.splitn(2, '/');
        let addr = parts.next().unwrap_or_default();
        if let Ok(ip) = addr.parse::<Ipv4Addr>() {
            return match parts.next() {
                Some(len) => {
                    let len: u8 = len
                        .parse()
                        .map_err(|_| format_err!("invalid prefix length '{}'", len))?;
                    if len > 32 {
                        return Err(format_err!("invalid prefix length '{}'", len));
                    }
                    Ok(vec![match_expr(
                        op,
                        left,
                        json!({ "prefix": { "addr": ip.to_string(), "len": len } }),
                    )])
                }
                None => Ok(vec![match_expr(op, left, json!(ip.to_string()))]),
            };
        }
    }

    // Service reference, `[<namespace>:]<service>.<network>`.
    if let Some((namespace, service, net)) = parse_service_peer(peer) {
        let namespace = namespace
            .map(str::to_owned)
            .or_else(|| container.namespace.clone());
        let service = match namespace {
            Some(ref ns) if !ns.is_empty() => format!("{}_{}", ns, service),
            _ => service.to_owned(),
        };
        let net = full_network_name(container, net);
        let qualified = format!("{}.{}", service, net);
        referenced_services.insert(qualified.clone());
        return Ok(vec![match_expr(
            op,
            left,
            json!(format!("@{}", service_set_name(&qualified))),
        )]);
    }

    Err(format_err!("unrecognized peer '{}'", peer))
}

fn parse_service_peer(peer: &str) -> Option<(Option<&str>, &str, &str)> {
    let (namespace, rest) = match peer.find(':') {
        Some(split) => (Some(&peer[..split]), &peer[split + 1..]),
        None => (None, peer),
    };
    let mut parts = rest.splitn(2, '.');
    let service = parts.next()?;
    let net = parts.next()?;
    if net.contains('.') {
        return None;
    }

    fn valid_token(token: &str) -> bool {
        !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }

    if let Some(namespace) = namespace {
        if !valid_token(namespace) {
            return None;
        }
    }
    if valid_token(service) && valid_token(net) {
        Some((namespace, service, net))
    } else {
        None
    }
}

fn match_expr(op: &str, left: Value, right: Value) -> Value {
    json!({ "match": { "op": op, "left": left, "right": right } })
}

fn port_json(port: &PortSpec) -> Value {
    match port {
        PortSpec::Single(port) => json!(port),
        PortSpec::Range(lo, hi) => json!({ "range": [lo, hi] }),
        PortSpec::Set(ports) => json!({ "set": ports }),
    }
}
