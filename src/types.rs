// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The types in this module make up firewhale's configuration surface: the
//! `firewhale.*` container labels and the rule mini-language they carry.
//!
//! # Example
//!
//! The following labels on a container
//!
//! ```yaml
//! firewhale.enabled: "true"
//! firewhale.outbound: "[ 'tcp; 8.8.8.8; 53', 'udp; internet' ]"
//! firewhale.inbound: "tcp; caddy.web; 80"
//! ```
//!
//! parse into a [`FirewhaleConfig`](struct.FirewhaleConfig.html) with two
//! outbound rule strings and one inbound rule string.
//!
//! Label values are YAML documents: booleans and strings deserialize
//! directly, and rule lists may be given either as a single string or as a
//! sequence of strings.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::net::Ipv4Addr;
use std::str::FromStr;

use derive_builder::Builder;
use serde::{de, Deserialize};
use strum_macros::{AsRefStr, EnumString};

use crate::errors::{FirewhaleError, Result};

/// Prefix shared by every label firewhale consumes as its own.
pub const LABEL_PREFIX: &str = "firewhale.";

/// Swarm's service-name label, second in the service-identity precedence.
pub const SWARM_SERVICE_LABEL: &str = "com.docker.swarm.service.name";
/// Compose's service-name label, third in the service-identity precedence.
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
/// Compose's project label, used as the namespace for peer resolution.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
/// Swarm's stack-namespace label, fallback namespace for peer resolution.
pub const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";

/// Traffic direction a rule list applies to.
///
/// Outbound rules match on the destination address of a packet leaving the
/// container, inbound rules on the source address of a packet entering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr)]
pub enum Direction {
    /// Traffic originating from the container.
    #[strum(serialize = "outbound")]
    Outbound,
    /// Traffic destined for the container.
    #[strum(serialize = "inbound")]
    Inbound,
}

impl Direction {
    /// Both directions, outbound first.
    pub fn both() -> [Direction; 2] {
        [Direction::Outbound, Direction::Inbound]
    }

    /// The IP header field the peer selector matches against.
    pub fn address_field(self) -> &'static str {
        match self {
            Direction::Outbound => "daddr",
            Direction::Inbound => "saddr",
        }
    }

    /// Name of the per-host verdict map dispatching this direction.
    pub fn map_name(self) -> &'static str {
        match self {
            Direction::Outbound => "firewhale-outbound",
            Direction::Inbound => "firewhale-inbound",
        }
    }

    /// Name of a container's chain for this direction.
    pub fn chain_name(self, chain_prefix: &str) -> String {
        format!("{}-{}", chain_prefix, self.as_ref())
    }
}

/// Transport protocol selector of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr)]
#[allow(missing_docs)]
pub enum Protocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

/// The parsed `firewhale.*` label set of one container.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FirewhaleConfig {
    /// Whether firewhale manages this container at all.
    #[serde(default)]
    pub enabled: bool,

    /// Override for the service identity the container publishes under.
    #[serde(default)]
    pub service_name: Option<String>,

    /// Whether the container's IPs are published into the IP directory.
    #[serde(default = "default_publish_ips")]
    pub publish_ips: bool,

    /// Rule strings applied to traffic leaving the container.
    ///
    /// The label value can be a single string or a sequence of strings.
    #[serde(default, deserialize_with = "string_or_seq_string")]
    pub outbound: Vec<String>,

    /// Rule strings applied to traffic entering the container.
    ///
    /// The label value can be a single string or a sequence of strings.
    #[serde(default, deserialize_with = "string_or_seq_string")]
    pub inbound: Vec<String>,
}

impl Default for FirewhaleConfig {
    fn default() -> FirewhaleConfig {
        FirewhaleConfig {
            enabled: false,
            service_name: None,
            publish_ips: default_publish_ips(),
            outbound: Vec::new(),
            inbound: Vec::new(),
        }
    }
}

fn default_publish_ips() -> bool {
    true
}

impl FirewhaleConfig {
    /// Collect and parse every `firewhale.*` label into a config.
    ///
    /// Each label value is parsed as a YAML document; unknown keys below the
    /// prefix are a configuration error for the container.
    pub fn from_labels(labels: &HashMap<String, String>) -> Result<FirewhaleConfig> {
        let mut document = serde_yaml::Mapping::new();
        for (label, value) in labels {
            if !label.starts_with(LABEL_PREFIX) {
                continue;
            }
            let key = &label[LABEL_PREFIX.len()..];
            let parsed: serde_yaml::Value =
                serde_yaml::from_str(value).map_err(|e| FirewhaleError::ContainerConfiguration {
                    reason: format!("label '{}' is not valid YAML: {}", label, e),
                })?;
            document.insert(serde_yaml::Value::String(key.to_owned()), parsed);
        }

        if document.is_empty() {
            return Ok(FirewhaleConfig::default());
        }

        serde_yaml::from_value(serde_yaml::Value::Mapping(document)).map_err(|e| {
            FirewhaleError::ContainerConfiguration {
                reason: format!("invalid firewhale labels: {}", e),
            }
            .into()
        })
    }

    /// The rule strings for one direction.
    pub fn rules(&self, direction: Direction) -> &[String] {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        }
    }
}

/// One network attachment of a container.
///
/// The address is optional: created-but-unstarted containers list their
/// networks without addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkAttachment {
    /// The container's address on this network.
    pub ipv4: Option<Ipv4Addr>,
    /// Prefix length of the network.
    pub prefix_len: u8,
}

/// Everything firewhale needs to know about one container.
///
/// Constructed from the runtime's inspect output (or from the builder in
/// tests); all projection state is keyed by [`id16`](#method.id16).
#[derive(Debug, Clone, Default, Builder)]
#[builder(setter(into), default)]
pub struct ContainerSpec {
    /// Full container id.
    pub id: String,
    /// Container name, without the leading slash.
    pub name: String,
    /// Resolved service identity.
    pub service_name: String,
    /// Compose project or stack namespace, if any.
    pub namespace: Option<String>,
    /// Attached networks; ordered so derived batches are deterministic.
    pub networks: BTreeMap<String, NetworkAttachment>,
    /// Whether the container runs in the host network namespace.
    pub host_network: bool,
    /// The parsed `firewhale.*` labels.
    pub firewhale: FirewhaleConfig,
}

impl ContainerSpec {
    /// Build a spec from raw runtime data.
    pub fn from_runtime(
        id: &str,
        name: &str,
        labels: &HashMap<String, String>,
        networks: BTreeMap<String, NetworkAttachment>,
    ) -> Result<ContainerSpec> {
        let firewhale = FirewhaleConfig::from_labels(labels)?;
        let name = name.trim_start_matches('/').to_owned();
        let service_name = firewhale
            .service_name
            .clone()
            .or_else(|| labels.get(SWARM_SERVICE_LABEL).cloned())
            .or_else(|| labels.get(COMPOSE_SERVICE_LABEL).cloned())
            .unwrap_or_else(|| name.clone());
        let namespace = labels
            .get(COMPOSE_PROJECT_LABEL)
            .or_else(|| labels.get(STACK_NAMESPACE_LABEL))
            .cloned();
        let host_network = networks.contains_key("host");

        Ok(ContainerSpec {
            id: id.to_owned(),
            name,
            service_name,
            namespace,
            networks,
            host_network,
            firewhale,
        })
    }

    /// The 16-character id prefix used in chain names.
    pub fn id16(&self) -> &str {
        let len = self.id.len().min(16);
        &self.id[..len]
    }

    /// Prefix of every chain owned by this container.
    pub fn chain_prefix(&self) -> String {
        crate::nftables::container_chain_prefix(self.id16())
    }

    /// Whether firewhale manages this container.
    pub fn enabled(&self) -> bool {
        self.firewhale.enabled
    }

    /// The container's addresses, in network-name order.
    pub fn ips(&self) -> Vec<Ipv4Addr> {
        self.networks.values().filter_map(|n| n.ipv4).collect()
    }
}

/// A port expression: a single port, an inclusive range, or a set.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
    Set(Vec<u16>),
}

impl FromStr for PortSpec {
    type Err = String;

    fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty port expression".to_owned());
        }
        if let Ok(port) = s.parse::<u16>() {
            return Ok(PortSpec::Single(port));
        }
        if s.contains('-') {
            let halves: Vec<&str> = s.splitn(2, '-').map(str::trim).collect();
            let lo = halves[0]
                .parse::<u16>()
                .map_err(|e| format!("invalid port '{}': {}", halves[0], e))?;
            let hi = halves[1]
                .parse::<u16>()
                .map_err(|e| format!("invalid port '{}': {}", halves[1], e))?;
            if lo > hi {
                return Err(format!("port range '{}' is inverted", s));
            }
            return Ok(PortSpec::Range(lo, hi));
        }
        if s.contains(',') {
            let ports = s
                .split(',')
                .map(|p| {
                    p.trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid port '{}': {}", p.trim(), e))
                })
                .collect::<::std::result::Result<Vec<u16>, String>>()?;
            return Ok(PortSpec::Set(ports));
        }
        Err(format!("invalid port expression '{}'", s))
    }
}

/// One parsed rule of the label mini-language.
///
/// The string form is a semicolon-separated token list with one positional
/// prefix and free-form `key:value` suffix:
///
/// ```text
/// [proto;] peer [; [:]dst_port] [; key:value ...]
/// ```
///
/// # Example
///
/// ```
/// # use firewhale::types::{PortSpec, Protocol, RuleSpec};
/// let rule: RuleSpec = "tcp; caddy.web; 80; sport:8000-9000".parse().unwrap();
/// assert_eq!(rule.proto, Some(Protocol::Tcp));
/// assert_eq!(rule.peer, "caddy.web");
/// assert_eq!(rule.dst_port, Some(PortSpec::Single(80)));
/// assert_eq!(rule.src_port, Some(PortSpec::Range(8000, 9000)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSpec {
    /// Protocol restriction; `None` matches both tcp and udp.
    pub proto: Option<Protocol>,
    /// The peer selector token, uninterpreted until compilation.
    pub peer: String,
    /// Source-port restriction.
    pub src_port: Option<PortSpec>,
    /// Destination-port restriction.
    pub dst_port: Option<PortSpec>,
    /// Whether the compiled rule carries a packet counter.
    pub counter: bool,
    /// Log matched packets with this prefix.
    pub log_prefix: Option<String>,
    /// Divert matched packets to this chain instead of returning.
    pub chain: Option<String>,
}

impl FromStr for RuleSpec {
    type Err = String;

    fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
        let mut bits: Vec<&str> = s.split(';').map(str::trim).collect();
        bits.retain(|bit| !bit.is_empty());
        if bits.is_empty() {
            return Err("empty rule".to_owned());
        }
        bits.reverse();

        let mut rule = RuleSpec::default();

        // Protocol (optional)
        if let Ok(proto) = bits[bits.len() - 1].to_lowercase().parse::<Protocol>() {
            rule.proto = Some(proto);
            bits.pop();
        }

        // Peer
        rule.peer = match bits.pop() {
            Some(peer) => peer.to_owned(),
            None => return Err("rule has no peer".to_owned()),
        };

        // Destination port (optional, positional)
        if let Some(&bit) = bits.last() {
            if !bit.contains(':') {
                rule.dst_port = Some(bit.parse()?);
                bits.pop();
            }
        }
        if let Some(&bit) = bits.last() {
            if bit.starts_with(':') {
                rule.dst_port = Some(bit[1..].parse()?);
                bits.pop();
            }
        }

        // Key-value pairs
        while let Some(bit) = bits.pop() {
            let mut halves = bit.splitn(2, ':');
            let key = halves.next().unwrap_or("").trim();
            let value = halves.next().unwrap_or("").trim();
            if key.is_empty() || value.is_empty() {
                return Err(format!("invalid key-value pair '{}'", bit));
            }
            match key {
                "proto" => {
                    rule.proto = Some(
                        value
                            .to_lowercase()
                            .parse()
                            .map_err(|_| format!("invalid protocol '{}'", value))?,
                    )
                }
                "src_port" | "sport" => rule.src_port = Some(value.parse()?),
                "dst_port" | "dport" => rule.dst_port = Some(value.parse()?),
                "counter" => {
                    rule.counter = value
                        .to_lowercase()
                        .parse()
                        .map_err(|_| format!("invalid counter flag '{}'", value))?
                }
                "log_prefix" => rule.log_prefix = Some(value.to_owned()),
                "chain" => rule.chain = Some(value.to_owned()),
                _ => return Err(format!("unknown rule key '{}'", key)),
            }
        }

        Ok(rule)
    }
}

fn string_or_seq_string<'de, D>(deserializer: D) -> ::std::result::Result<Vec<String>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct StringOrSeqString(PhantomData<Vec<String>>);

    impl<'de> de::Visitor<'de> for StringOrSeqString {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("string or sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> ::std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![value.to_owned()])
        }

        fn visit_seq<S>(self, visitor: S) -> ::std::result::Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            de::Deserialize::deserialize(de::value::SeqAccessDeserializer::new(visitor))
        }
    }

    deserializer.deserialize_any(StringOrSeqString(PhantomData))
}

#[cfg(test)]
mod test {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn config_defaults() {
        let config = FirewhaleConfig::from_labels(&labels(&[])).unwrap();
        assert!(!config.enabled);
        assert!(config.publish_ips);
        assert!(config.outbound.is_empty());
    }

    #[test]
    fn config_parses_booleans_and_lists() {
        let config = FirewhaleConfig::from_labels(&labels(&[
            ("firewhale.enabled", "true"),
            ("firewhale.publish_ips", "false"),
            ("firewhale.outbound", "[ 'tcp; 8.8.8.8; 53', 'udp; internet' ]"),
            ("firewhale.inbound", "tcp; caddy.web; 80"),
            ("some.other.label", "ignored"),
        ]))
        .unwrap();
        assert!(config.enabled);
        assert!(!config.publish_ips);
        assert_eq!(config.outbound.len(), 2);
        assert_eq!(config.inbound, vec!["tcp; caddy.web; 80".to_owned()]);
    }

    #[test]
    fn config_rejects_unknown_keys() {
        assert!(FirewhaleConfig::from_labels(&labels(&[("firewhale.bogus", "true")])).is_err());
    }

    #[test]
    fn service_name_precedence() {
        let networks = BTreeMap::new();
        let spec = ContainerSpec::from_runtime(
            "0123456789abcdef0123",
            "/my-container",
            &labels(&[
                ("firewhale.service_name", "override"),
                (SWARM_SERVICE_LABEL, "swarm-svc"),
            ]),
            networks.clone(),
        )
        .unwrap();
        assert_eq!(spec.service_name, "override");

        let spec = ContainerSpec::from_runtime(
            "0123456789abcdef0123",
            "/my-container",
            &labels(&[(SWARM_SERVICE_LABEL, "swarm-svc")]),
            networks.clone(),
        )
        .unwrap();
        assert_eq!(spec.service_name, "swarm-svc");

        let spec = ContainerSpec::from_runtime(
            "0123456789abcdef0123",
            "/my-container",
            &labels(&[]),
            networks,
        )
        .unwrap();
        assert_eq!(spec.service_name, "my-container");
        assert_eq!(spec.name, "my-container");
    }

    #[test]
    fn id16_and_chain_prefix() {
        let spec = ContainerSpecBuilder::default()
            .id("aabbccddeeff00112233445566778899")
            .build()
            .unwrap();
        assert_eq!(spec.id16(), "aabbccddeeff0011");
        assert_eq!(spec.chain_prefix(), "firewhale-container-aabbccddeeff0011");
    }

    #[test]
    fn rule_positional_parsing() {
        let rule: RuleSpec = "tcp; 8.8.8.8; 53".parse().unwrap();
        assert_eq!(rule.proto, Some(Protocol::Tcp));
        assert_eq!(rule.peer, "8.8.8.8");
        assert_eq!(rule.dst_port, Some(PortSpec::Single(53)));
        assert_eq!(rule.src_port, None);
    }

    #[test]
    fn rule_without_protocol() {
        let rule: RuleSpec = "internet".parse().unwrap();
        assert_eq!(rule.proto, None);
        assert_eq!(rule.peer, "internet");
        assert_eq!(rule.dst_port, None);
    }

    #[test]
    fn rule_colon_prefixed_port() {
        let rule: RuleSpec = "udp; *; :9000".parse().unwrap();
        assert_eq!(rule.proto, Some(Protocol::Udp));
        assert_eq!(rule.dst_port, Some(PortSpec::Single(9000)));
    }

    #[test]
    fn rule_key_value_pairs_and_aliases() {
        let rule: RuleSpec = "tcp; caddy.web; 80; sport:8000-9000; counter:true; chain:audit"
            .parse()
            .unwrap();
        assert_eq!(rule.src_port, Some(PortSpec::Range(8000, 9000)));
        assert!(rule.counter);
        assert_eq!(rule.chain, Some("audit".to_owned()));
    }

    #[test]
    fn rule_rejects_malformed_key_value() {
        assert!("tcp; peer; bad:".parse::<RuleSpec>().is_err());
        assert!("tcp; peer; unknown_key:value".parse::<RuleSpec>().is_err());
    }

    #[test]
    fn port_specs() {
        assert_eq!("53".parse::<PortSpec>().unwrap(), PortSpec::Single(53));
        assert_eq!(
            "1000-2000".parse::<PortSpec>().unwrap(),
            PortSpec::Range(1000, 2000)
        );
        assert_eq!(
            "80,443,8080".parse::<PortSpec>().unwrap(),
            PortSpec::Set(vec![80, 443, 8080])
        );
        assert!("2000-1000".parse::<PortSpec>().is_err());
        assert!("http".parse::<PortSpec>().is_err());
    }
}
