// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! End-to-end scenarios: the controller over an in-memory firewall engine
//! and a local IP directory.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crossbeam_channel::unbounded;
use serde_json::Value;
use slog::{o, Drain, Logger};

use firewhale::errors::Result;
use firewhale::ipdir::LocalDirectory;
use firewhale::nftables::MemoryTransport;
use firewhale::serve::{ContainerSource, Controller, WorkItem};
use firewhale::types::{ContainerSpec, ContainerSpecBuilder, FirewhaleConfig, NetworkAttachment};

fn logger() -> Logger {
    Logger::root(slog::Discard.fuse(), o!())
}

struct SharedSource {
    specs: Arc<Mutex<Vec<ContainerSpec>>>,
    // Containers that are only visible to inspect(), i.e. created after the
    // initial inventory was taken.
    late: Arc<Mutex<Vec<ContainerSpec>>>,
}

impl ContainerSource for SharedSource {
    fn list(&self) -> Result<Vec<ContainerSpec>> {
        Ok(self.specs.lock().unwrap().clone())
    }

    fn inspect(&self, id: &str) -> Result<Option<ContainerSpec>> {
        Ok(self
            .specs
            .lock()
            .unwrap()
            .iter()
            .chain(self.late.lock().unwrap().iter())
            .find(|spec| spec.id == id)
            .cloned())
    }
}

fn container(id: &str, service: &str, ip: &str, rules: &[&str]) -> ContainerSpec {
    let mut networks = BTreeMap::new();
    networks.insert(
        "web".to_owned(),
        NetworkAttachment {
            ipv4: Some(ip.parse().unwrap()),
            prefix_len: 24,
        },
    );
    ContainerSpecBuilder::default()
        .id(id)
        .name(service)
        .service_name(service)
        .networks(networks)
        .firewhale(FirewhaleConfig {
            enabled: true,
            outbound: rules.iter().map(|r| (*r).to_string()).collect(),
            ..FirewhaleConfig::default()
        })
        .build()
        .unwrap()
}

struct Harness {
    transport: Arc<MemoryTransport>,
    specs: Arc<Mutex<Vec<ContainerSpec>>>,
    late: Arc<Mutex<Vec<ContainerSpec>>>,
}

impl Harness {
    fn new(specs: Vec<ContainerSpec>) -> Harness {
        Harness {
            transport: Arc::new(MemoryTransport::with_docker_user()),
            specs: Arc::new(Mutex::new(specs)),
            late: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run one controller session over the given work items.
    fn run(&self, items: Vec<WorkItem>) {
        let directory = LocalDirectory::new(self.transport.clone(), &logger());
        let (tx, rx) = unbounded();
        let mut controller = Controller::new(
            Box::new(SharedSource {
                specs: self.specs.clone(),
                late: self.late.clone(),
            }),
            self.transport.clone(),
            Box::new(directory),
            rx,
            &logger(),
        );
        controller.prime_directory().unwrap();
        for item in items {
            tx.send(item).unwrap();
        }
        tx.send(WorkItem::Stop).unwrap();
        controller.run().unwrap();
    }

    fn snapshot(&self) -> (Vec<String>, BTreeMap<String, Value>, Option<Vec<String>>) {
        (
            self.transport.chain_names(),
            self.transport.map_rows("firewhale-outbound").unwrap_or_default(),
            self.transport
                .set_elements("firewhale-service:caddy.web:ip"),
        )
    }
}

const CLIENT: &str = "1111222233334444aaaabbbbccccdddd";
const CLIENT16: &str = "1111222233334444";
const CADDY: &str = "5555666677778888eeeeffff00001111";
const OTHER: &str = "9999aaaabbbbcccc0000111122223333";

#[test]
fn service_fabric_end_to_end() {
    // The client references caddy.web before the caddy container exists;
    // caddy is only created mid-session.
    let harness = Harness::new(vec![container(
        CLIENT,
        "api",
        "10.0.0.5",
        &["tcp; caddy.web; 80"],
    )]);
    harness
        .late
        .lock()
        .unwrap()
        .push(container(CADDY, "caddy", "10.0.0.9", &[]));

    harness.run(vec![
        WorkItem::TransportConnected,
        WorkItem::Container {
            action: "create".to_owned(),
            id: CADDY.to_owned(),
        },
    ]);

    assert_eq!(
        harness
            .transport
            .set_elements("firewhale-service:caddy.web:ip"),
        Some(vec!["10.0.0.9".to_owned()])
    );
    // The membership update is exactly one element addition to the set.
    let set_additions: Vec<Value> = harness
        .transport
        .mutations()
        .into_iter()
        .filter(|command| {
            command
                .get("add")
                .and_then(|add| add.get("element"))
                .and_then(|element| element.get("name"))
                .and_then(Value::as_str)
                == Some("firewhale-service:caddy.web:ip")
        })
        .collect();
    assert_eq!(set_additions.len(), 1);

    // The compiled client rule references the set.
    let rules = harness
        .transport
        .chain_rules(&format!("firewhale-container-{}-outbound", CLIENT16))
        .unwrap();
    assert_eq!(
        rules[0].1[1]["match"]["right"],
        serde_json::json!("@firewhale-service:caddy.web:ip")
    );
}

#[test]
fn last_subscriber_death_removes_the_service_set() {
    let harness = Harness::new(vec![
        container(CLIENT, "api", "10.0.0.5", &["tcp; caddy.web; 80"]),
        container(OTHER, "worker", "10.0.0.6", &["tcp; caddy.web; 443"]),
    ]);

    // Both subscribe; the first death keeps the set, the second removes it,
    // and no container chain survives its owner.
    harness.run(vec![
        WorkItem::TransportConnected,
        WorkItem::Container {
            action: "die".to_owned(),
            id: CLIENT.to_owned(),
        },
        WorkItem::Container {
            action: "die".to_owned(),
            id: OTHER.to_owned(),
        },
    ]);

    assert_eq!(
        harness
            .transport
            .set_elements("firewhale-service:caddy.web:ip"),
        None
    );
    for chain in harness.transport.chain_names() {
        assert!(
            !chain.starts_with("firewhale-container-"),
            "container chain '{}' survived its container",
            chain
        );
    }
    assert!(harness
        .transport
        .map_rows("firewhale-outbound")
        .unwrap()
        .is_empty());
}

#[test]
fn reconnect_converges_to_the_cold_start_state() {
    let specs = vec![
        container(CLIENT, "api", "10.0.0.5", &["tcp; caddy.web; 80", "internet"]),
        container(CADDY, "caddy", "10.0.0.9", &[]),
    ];

    let harness = Harness::new(specs.clone());
    harness.run(vec![WorkItem::TransportConnected]);
    let after_cold_start = harness.snapshot();

    // The transport reattaches (e.g. the agent was restarted): the daemon
    // re-runs the full reconcile and lands in the identical state.
    harness.run(vec![WorkItem::TransportConnected]);
    assert_eq!(harness.snapshot(), after_cold_start);

    // And a pristine engine driven by a fresh controller agrees too.
    let fresh = Harness::new(specs);
    fresh.run(vec![WorkItem::TransportConnected]);
    let (chains, outbound, _) = fresh.snapshot();
    assert_eq!(chains, after_cold_start.0);
    assert_eq!(outbound, after_cold_start.1);
}

#[test]
fn orphaned_state_is_swept_on_reconcile() {
    let harness = Harness::new(vec![container(CLIENT, "api", "10.0.0.5", &[])]);
    harness
        .transport
        .seed_chain("firewhale-container-DEADBEEFDEADBEEF-inbound");
    harness.transport.seed_map_row(
        "firewhale-inbound",
        "10.9.9.9",
        serde_json::json!({ "jump": { "target": "firewhale-container-DEADBEEFDEADBEEF-inbound" } }),
    );

    harness.run(vec![WorkItem::TransportConnected]);

    assert!(!harness
        .transport
        .chain_names()
        .iter()
        .any(|chain| chain.contains("DEADBEEF")));
    assert!(harness
        .transport
        .map_rows("firewhale-inbound")
        .unwrap()
        .keys()
        .all(|ip| ip != "10.9.9.9"));

    // The live container's own state survived the sweep.
    let ips: BTreeSet<String> = harness
        .transport
        .map_rows("firewhale-outbound")
        .unwrap()
        .keys()
        .cloned()
        .collect();
    assert!(ips.contains("10.0.0.5"));
}
