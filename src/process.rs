// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! This module holds the projection of container intent into the kernel
//! firewall: the root chain structure, per-container chains and verdict-map
//! entries, orphan cleanup, and the full teardown.
//!
//! Projection is difference-driven. Every operation reads the current table
//! state and only emits what drifted, so re-running a reconcile against a
//! converged ruleset submits nothing.

use std::collections::{BTreeSet, HashSet};

use serde_json::{json, Value};
use slog::{debug, error, info, o, warn, Logger};

use crate::errors::{FirewhaleError, Result};
use crate::nftables::{
    chain_container_id, chain_json, cmd, container_chain_prefix, exprs_equal, list_table_chains,
    read_table_state, remove_tagged_rules, rule_json, sync_tagged_rules, table_json,
    NftTransport, DOCKER_USER_CHAIN, FAMILY, FIREWHALE_CHAIN, RULE_TAG, SERVICE_SET_PREFIX,
    TABLE_NAME,
};
use crate::ipdir::IpDirectory;
use crate::nftables::ErrorMode;
use crate::rule::compile_rule_string;
use crate::types::{ContainerSpec, Direction};

/// Enclosing struct to manage the projection of containers into the
/// firewall.
pub struct ProjectContext<'a> {
    transport: &'a dyn NftTransport,
    directory: &'a mut dyn IpDirectory,
    logger: Logger,
}

impl<'a> ProjectContext<'a> {
    /// Create a new projection context over explicit dependencies.
    pub fn new(
        transport: &'a dyn NftTransport,
        directory: &'a mut dyn IpDirectory,
        logger: &Logger,
    ) -> ProjectContext<'a> {
        ProjectContext {
            transport,
            directory,
            logger: logger.new(o!()),
        }
    }

    /// Ensure the root structures exist and are current: the table, the
    /// verdict maps, the core chain with its dispatch rules, and the tagged
    /// bounce rule in Docker's ingress chain.
    ///
    /// A missing ingress chain is fatal: without it no container traffic
    /// ever reaches firewhale.
    pub fn initialize_core_chains(&self) -> Result<()> {
        let state = read_table_state(self.transport)?;
        if !state.has_chain(DOCKER_USER_CHAIN) {
            return Err(FirewhaleError::ChainNotFound {
                chain: DOCKER_USER_CHAIN.to_owned(),
                table: TABLE_NAME.to_owned(),
            }
            .into());
        }

        let mut commands = Vec::new();
        if !state.exists {
            commands.push(cmd("add", "table", table_json()));
        }
        for direction in Direction::both().iter().copied() {
            if !state.maps.contains_key(direction.map_name()) {
                commands.push(cmd(
                    "add",
                    "map",
                    json!({
                        "family": FAMILY,
                        "table": TABLE_NAME,
                        "name": direction.map_name(),
                        "type": "ipv4_addr",
                        "map": "verdict",
                    }),
                ));
            }
        }

        let desired = core_chain_rules();
        let rebuild = match state.chains.get(FIREWHALE_CHAIN) {
            Some(current) => !rules_match(current, &desired),
            None => {
                commands.push(cmd("add", "chain", chain_json(FIREWHALE_CHAIN)));
                true
            }
        };
        if rebuild {
            if state.has_chain(FIREWHALE_CHAIN) {
                commands.push(cmd("flush", "chain", chain_json(FIREWHALE_CHAIN)));
            }
            for rule in &desired {
                commands.push(cmd("add", "rule", rule.clone()));
            }
        }

        if !commands.is_empty() {
            self.transport.run(&commands, ErrorMode::Strict)?;
            info!(self.logger, "Core chain structure initialized");
        }

        sync_tagged_rules(self.transport, DOCKER_USER_CHAIN, &[bounce_rule()], RULE_TAG)
    }

    /// Project one container: per-direction chains, verdict-map entries,
    /// service subscriptions and IP publications.
    ///
    /// Rules that fail to compile are skipped individually; the rest of the
    /// container still projects.
    pub fn apply_container(&mut self, container: &ContainerSpec) -> Result<()> {
        if !container.enabled() {
            debug!(self.logger, "Container not firewhale-enabled, skipping";
                   o!("container" => container.name.clone()));
            return Ok(());
        }
        if container.host_network {
            return Err(FirewhaleError::ContainerConfiguration {
                reason: format!(
                    "container '{}' is attached to the host network",
                    container.name
                ),
            }
            .into());
        }

        let state = read_table_state(self.transport)?;
        let prefix = container.chain_prefix();
        let ips: Vec<String> = container.ips().iter().map(ToString::to_string).collect();
        let mut referenced_services = BTreeSet::new();
        let mut commands = Vec::new();

        for direction in Direction::both().iter().copied() {
            let chain = direction.chain_name(&prefix);

            let mut desired = Vec::new();
            for raw in container.firewhale.rules(direction) {
                match compile_rule_string(raw, container, direction, &mut referenced_services) {
                    Ok(exprs) => desired.push(rule_json(&chain, exprs, None)),
                    Err(e) => {
                        warn!(self.logger, "Skipping rule that does not compile";
                              o!("container" => container.name.clone(),
                                 "rule" => raw.clone(),
                                 "error" => e.to_string()));
                    }
                }
            }
            // Every container chain terminates.
            desired.push(rule_json(&chain, json!([{ "drop": null }]), None));

            match state.chains.get(&chain) {
                Some(current) if rules_match(current, &desired) => {}
                Some(_) => {
                    commands.push(cmd("flush", "chain", chain_json(&chain)));
                    for rule in &desired {
                        commands.push(cmd("add", "rule", rule.clone()));
                    }
                }
                None => {
                    commands.push(cmd("add", "chain", chain_json(&chain)));
                    for rule in &desired {
                        commands.push(cmd("add", "rule", rule.clone()));
                    }
                }
            }

            let rows = state.maps.get(direction.map_name());
            let mut additions = Vec::new();
            for ip in &ips {
                let verdict = json!({ "jump": { "target": chain } });
                if rows.and_then(|rows| rows.get(ip)) != Some(&verdict) {
                    additions.push(json!([ip, verdict]));
                }
            }
            let mut deletions = Vec::new();
            if let Some(rows) = rows {
                for (ip, verdict) in rows {
                    let target = verdict.get("jump").and_then(|j| j.get("target"));
                    if target.and_then(Value::as_str) == Some(chain.as_str())
                        && !ips.contains(ip)
                    {
                        deletions.push(json!(ip));
                    }
                }
            }
            if !additions.is_empty() {
                commands.push(cmd(
                    "add",
                    "element",
                    json!({
                        "family": FAMILY,
                        "table": TABLE_NAME,
                        "name": direction.map_name(),
                        "elem": additions,
                    }),
                ));
            }
            if !deletions.is_empty() {
                commands.push(cmd(
                    "delete",
                    "element",
                    json!({
                        "family": FAMILY,
                        "table": TABLE_NAME,
                        "name": direction.map_name(),
                        "elem": deletions,
                    }),
                ));
            }
        }

        // Referenced sets must exist before rules referencing them land.
        for service in &referenced_services {
            self.directory.subscribe(service, container.id16())?;
        }

        if commands.is_empty() {
            debug!(self.logger, "Container already converged";
                   o!("container" => container.name.clone()));
        } else {
            self.transport.run(&commands, ErrorMode::Strict)?;
            info!(self.logger, "Container projected";
                  o!("container" => container.name.clone(),
                     "id" => container.id16().to_owned(),
                     "ips" => ips.len()));
        }

        if container.firewhale.publish_ips {
            for (net, attachment) in &container.networks {
                if let Some(ip) = attachment.ipv4 {
                    self.directory.publish(
                        &format!("{}.{}", container.service_name, net),
                        &ip.to_string(),
                        container.id16(),
                    )?;
                }
            }
        }

        Ok(())
    }

    /// Tear down everything belonging to a container that died.
    ///
    /// `known_ips` is the controller's last view of the container's
    /// attachments; it is unioned with the directory's claims so map entries
    /// disappear even when the container never published. Errors are logged
    /// and swallowed, the container is already gone.
    pub fn destroy_container(&mut self, id16: &str, known_ips: &[String]) -> Result<()> {
        let mut ips: BTreeSet<String> = known_ips.iter().cloned().collect();
        match self.directory.container_ips(id16) {
            Ok(published) => ips.extend(published),
            Err(e) => {
                warn!(self.logger, "Could not read published IPs for teardown";
                      o!("id" => id16.to_owned(), "error" => e.to_string()));
            }
        }

        let mut commands = Vec::new();
        for direction in Direction::both().iter().copied() {
            for ip in &ips {
                commands.push(cmd(
                    "delete",
                    "element",
                    json!({
                        "family": FAMILY,
                        "table": TABLE_NAME,
                        "name": direction.map_name(),
                        "elem": [ip],
                    }),
                ));
            }
        }

        let prefix = container_chain_prefix(id16);
        match list_table_chains(self.transport) {
            Ok(chains) => {
                for chain in chains {
                    if let Some(name) = chain.get("name").and_then(Value::as_str) {
                        if name.starts_with(&prefix) {
                            commands.push(cmd("flush", "chain", chain_json(name)));
                            commands.push(cmd("delete", "chain", chain_json(name)));
                        }
                    }
                }
            }
            Err(e) => {
                warn!(self.logger, "Could not list chains for teardown";
                      o!("id" => id16.to_owned(), "error" => e.to_string()));
            }
        }

        if !commands.is_empty() {
            if let Err(e) = self.transport.run(&commands, ErrorMode::Continue) {
                warn!(self.logger, "Teardown batch failed";
                      o!("id" => id16.to_owned(), "error" => e.to_string()));
            }
        }

        if let Err(e) = self.directory.unsubscribe_all(id16) {
            warn!(self.logger, "Unsubscribing failed during teardown";
                  o!("id" => id16.to_owned(), "error" => e.to_string()));
        }
        if let Err(e) = self.directory.unpublish_container(id16) {
            warn!(self.logger, "Unpublishing failed during teardown";
                  o!("id" => id16.to_owned(), "error" => e.to_string()));
        }

        info!(self.logger, "Container state removed"; o!("id" => id16.to_owned()));
        Ok(())
    }

    /// Remove chains and verdict-map entries of containers that are no
    /// longer alive. The container id is parsed out of the chain name.
    pub fn cleanup_orphans(&self, live: &HashSet<String>) -> Result<()> {
        let state = read_table_state(self.transport)?;
        let mut commands = Vec::new();

        for direction in Direction::both().iter().copied() {
            if let Some(rows) = state.maps.get(direction.map_name()) {
                for (ip, verdict) in rows {
                    let target = verdict
                        .get("jump")
                        .and_then(|jump| jump.get("target"))
                        .and_then(Value::as_str);
                    if let Some(cid) = target.and_then(chain_container_id) {
                        if !live.contains(cid) {
                            commands.push(cmd(
                                "delete",
                                "element",
                                json!({
                                    "family": FAMILY,
                                    "table": TABLE_NAME,
                                    "name": direction.map_name(),
                                    "elem": [ip],
                                }),
                            ));
                        }
                    }
                }
            }
        }

        for chain in state.container_chains() {
            if let Some(cid) = chain_container_id(&chain) {
                if !live.contains(cid) {
                    commands.push(cmd("flush", "chain", chain_json(&chain)));
                    commands.push(cmd("delete", "chain", chain_json(&chain)));
                }
            }
        }

        if !commands.is_empty() {
            info!(self.logger, "Cleaning up orphaned container state";
                  o!("commands" => commands.len()));
            self.transport.run(&commands, ErrorMode::Continue)?;
        }
        Ok(())
    }

    /// Bring the whole host to the desired state: core structures, every
    /// live container, then orphan cleanup. Per-container failures are
    /// logged and do not stop the sweep.
    pub fn reconcile(&mut self, containers: &[ContainerSpec]) -> Result<()> {
        self.initialize_core_chains()?;

        let mut live = HashSet::new();
        for container in containers {
            if !container.enabled() {
                continue;
            }
            live.insert(container.id16().to_owned());
            if let Err(e) = self.apply_container(container) {
                error!(self.logger, "Projecting container failed";
                       o!("container" => container.name.clone(),
                          "error" => format!("{:?}", e)));
            }
        }

        self.cleanup_orphans(&live)
    }
}

/// Remove every chain, map, set and tagged rule firewhale owns.
///
/// Everything is best-effort: partial state from a crashed daemon must not
/// stop the cleanup.
pub fn full_cleanup(transport: &dyn NftTransport, logger: &Logger) -> Result<()> {
    remove_tagged_rules(transport, DOCKER_USER_CHAIN, RULE_TAG)?;

    let state = read_table_state(transport)?;
    let mut commands = Vec::new();

    if state.has_chain(FIREWHALE_CHAIN) {
        commands.push(cmd("flush", "chain", chain_json(FIREWHALE_CHAIN)));
        commands.push(cmd("delete", "chain", chain_json(FIREWHALE_CHAIN)));
    }
    for direction in Direction::both().iter().copied() {
        if state.maps.contains_key(direction.map_name()) {
            let reference = json!({
                "family": FAMILY,
                "table": TABLE_NAME,
                "name": direction.map_name(),
            });
            commands.push(cmd("flush", "map", reference.clone()));
            commands.push(cmd("delete", "map", reference));
        }
    }
    for chain in state.container_chains() {
        commands.push(cmd("flush", "chain", chain_json(&chain)));
        commands.push(cmd("delete", "chain", chain_json(&chain)));
    }
    for set in state.sets.keys() {
        if set.starts_with(SERVICE_SET_PREFIX) {
            commands.push(cmd(
                "delete",
                "set",
                json!({ "family": FAMILY, "table": TABLE_NAME, "name": set }),
            ));
        }
    }

    if !commands.is_empty() {
        transport.run(&commands, ErrorMode::Continue)?;
    }
    info!(logger, "Removed all firewhale firewall state";
          o!("commands" => commands.len()));
    Ok(())
}

fn core_chain_rules() -> Vec<Value> {
    let mut rules = vec![rule_json(
        FIREWHALE_CHAIN,
        json!([
            { "match": { "op": "in",
                         "left": { "ct": { "key": "state" } },
                         "right": ["established", "related"] } },
            { "counter": null },
            { "return": null },
        ]),
        Some("Allow established connections"),
    )];
    for direction in Direction::both().iter().copied() {
        rules.push(rule_json(
            FIREWHALE_CHAIN,
            json!([
                { "vmap": {
                    "key": { "payload": { "protocol": "ip",
                                          "field": direction.address_field() } },
                    "data": format!("@{}", direction.map_name()),
                } }
            ]),
            Some(&format!("Dispatch {} traffic", direction.as_ref())),
        ));
    }
    rules
}

fn bounce_rule() -> Value {
    rule_json(
        DOCKER_USER_CHAIN,
        json!([{ "jump": { "target": FIREWHALE_CHAIN } }]),
        Some("Jump to firewhale chain"),
    )
}

fn rules_match(current: &[Value], desired: &[Value]) -> bool {
    current.len() == desired.len()
        && current
            .iter()
            .zip(desired.iter())
            .all(|(a, b)| exprs_equal(a, b))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ipdir::LocalDirectory;
    use crate::nftables::MemoryTransport;
    use crate::types::{ContainerSpecBuilder, FirewhaleConfig, NetworkAttachment};
    use slog::Drain;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn logger() -> Logger {
        Logger::root(slog::Discard.fuse(), o!())
    }

    fn harness() -> (Arc<MemoryTransport>, LocalDirectory) {
        let transport = Arc::new(MemoryTransport::with_docker_user());
        let directory = LocalDirectory::new(transport.clone(), &logger());
        (transport, directory)
    }

    fn container(id: &str, config: FirewhaleConfig) -> ContainerSpec {
        let mut networks = BTreeMap::new();
        networks.insert(
            "proj_web".to_owned(),
            NetworkAttachment {
                ipv4: Some("10.0.0.5".parse().unwrap()),
                prefix_len: 24,
            },
        );
        ContainerSpecBuilder::default()
            .id(id)
            .name("api-1")
            .service_name("api")
            .namespace(Some("proj".to_owned()))
            .networks(networks)
            .firewhale(config)
            .build()
            .unwrap()
    }

    fn enabled_config(outbound: &[&str]) -> FirewhaleConfig {
        FirewhaleConfig {
            enabled: true,
            outbound: outbound.iter().map(|s| (*s).to_string()).collect(),
            ..FirewhaleConfig::default()
        }
    }

    const CID: &str = "aabbccddeeff00112233445566778899";
    const CID16: &str = "aabbccddeeff0011";

    #[test]
    fn initialize_requires_docker_user_chain() {
        let transport = MemoryTransport::new();
        let mut directory = LocalDirectory::new(Arc::new(MemoryTransport::new()), &logger());
        let log = logger();
        let ctx = ProjectContext::new(&transport, &mut directory, &log);
        assert!(ctx.initialize_core_chains().is_err());
    }

    #[test]
    fn initialize_builds_core_structure_once() {
        let (transport, mut directory) = harness();
        let log = logger();
        let ctx = ProjectContext::new(transport.as_ref(), &mut directory, &log);

        ctx.initialize_core_chains().unwrap();
        assert!(transport.chain_rules(FIREWHALE_CHAIN).unwrap().len() == 3);
        assert!(transport.map_rows("firewhale-outbound").is_some());
        assert!(transport.map_rows("firewhale-inbound").is_some());
        let bounce: Vec<_> = transport
            .chain_rules(DOCKER_USER_CHAIN)
            .unwrap()
            .into_iter()
            .filter(|(comment, _)| {
                comment.as_ref().map_or(false, |c| c.starts_with(RULE_TAG))
            })
            .collect();
        assert_eq!(bounce.len(), 1);

        // A second run is a no-op.
        transport.clear_journal();
        ctx.initialize_core_chains().unwrap();
        assert!(transport.mutations().is_empty());
    }

    #[test]
    fn apply_projects_chains_and_map_entries() {
        let (transport, mut directory) = harness();
        let log = logger();
        let mut ctx = ProjectContext::new(transport.as_ref(), &mut directory, &log);
        ctx.initialize_core_chains().unwrap();

        let spec = container(CID, enabled_config(&["tcp; 8.8.8.8; 53"]));
        ctx.apply_container(&spec).unwrap();

        for direction in &["outbound", "inbound"] {
            let chain = format!("firewhale-container-{}-{}", CID16, direction);
            let rules = transport.chain_rules(&chain).unwrap();
            // Chains end in a drop.
            assert_eq!(rules.last().unwrap().1, json!([{ "drop": null }]));
            let rows = transport
                .map_rows(&format!("firewhale-{}", direction))
                .unwrap();
            assert_eq!(
                rows.get("10.0.0.5").unwrap(),
                &json!({ "jump": { "target": chain } })
            );
        }

        // The outbound chain carries the compiled rule with the fixed
        // destination-port field.
        let outbound = transport
            .chain_rules(&format!("firewhale-container-{}-outbound", CID16))
            .unwrap();
        assert_eq!(outbound.len(), 2);
        assert_eq!(
            outbound[0].1,
            json!([
                { "match": { "op": "==",
                             "left": { "payload": { "protocol": "ip", "field": "protocol" } },
                             "right": "tcp" } },
                { "match": { "op": "==",
                             "left": { "payload": { "protocol": "ip", "field": "daddr" } },
                             "right": "8.8.8.8" } },
                { "match": { "op": "==",
                             "left": { "payload": { "protocol": "tcp", "field": "dport" } },
                             "right": 53 } },
                { "return": null },
            ])
        );
    }

    #[test]
    fn apply_twice_is_quiet() {
        let (transport, mut directory) = harness();
        let log = logger();
        let mut ctx = ProjectContext::new(transport.as_ref(), &mut directory, &log);
        ctx.initialize_core_chains().unwrap();

        let spec = container(CID, enabled_config(&["tcp; 8.8.8.8; 53"]));
        ctx.apply_container(&spec).unwrap();
        transport.clear_journal();
        ctx.apply_container(&spec).unwrap();
        assert!(transport.mutations().is_empty());
    }

    #[test]
    fn apply_skips_uncompilable_rules_but_projects_the_rest() {
        let (transport, mut directory) = harness();
        let log = logger();
        let mut ctx = ProjectContext::new(transport.as_ref(), &mut directory, &log);
        ctx.initialize_core_chains().unwrap();

        let spec = container(CID, enabled_config(&["garbage rule here", "tcp; 1.2.3.4"]));
        ctx.apply_container(&spec).unwrap();

        let outbound = transport
            .chain_rules(&format!("firewhale-container-{}-outbound", CID16))
            .unwrap();
        // One compiled rule plus the drop.
        assert_eq!(outbound.len(), 2);
    }

    #[test]
    fn apply_subscribes_referenced_services() {
        let (transport, mut directory) = harness();
        let log = logger();
        let mut ctx = ProjectContext::new(transport.as_ref(), &mut directory, &log);
        ctx.initialize_core_chains().unwrap();

        let spec = container(CID, enabled_config(&["tcp; caddy.web; 80"]));
        ctx.apply_container(&spec).unwrap();

        assert!(transport
            .set_elements("firewhale-service:proj_caddy.proj_web:ip")
            .is_some());
        let outbound = transport
            .chain_rules(&format!("firewhale-container-{}-outbound", CID16))
            .unwrap();
        assert_eq!(
            outbound[0].1[1]["match"]["right"],
            json!("@firewhale-service:proj_caddy.proj_web:ip")
        );
    }

    #[test]
    fn host_networked_container_is_rejected_without_firewall_changes() {
        let (transport, mut directory) = harness();
        let log = logger();
        let mut ctx = ProjectContext::new(transport.as_ref(), &mut directory, &log);
        ctx.initialize_core_chains().unwrap();
        transport.clear_journal();

        let mut networks = BTreeMap::new();
        networks.insert("host".to_owned(), NetworkAttachment::default());
        let spec = ContainerSpecBuilder::default()
            .id(CID)
            .name("hosty")
            .service_name("hosty")
            .networks(networks)
            .firewhale(enabled_config(&[]))
            .build()
            .unwrap();

        assert!(ctx.apply_container(&spec).is_err());
        assert!(transport.mutations().is_empty());
    }

    #[test]
    fn zero_network_container_gets_chains_but_no_elements() {
        let (transport, mut directory) = harness();
        let log = logger();
        let mut ctx = ProjectContext::new(transport.as_ref(), &mut directory, &log);
        ctx.initialize_core_chains().unwrap();

        let spec = ContainerSpecBuilder::default()
            .id(CID)
            .name("lonely")
            .service_name("lonely")
            .firewhale(enabled_config(&[]))
            .build()
            .unwrap();
        ctx.apply_container(&spec).unwrap();

        assert!(transport
            .chain_rules(&format!("firewhale-container-{}-outbound", CID16))
            .is_some());
        assert!(transport.map_rows("firewhale-outbound").unwrap().is_empty());
    }

    #[test]
    fn destroy_round_trips_to_pre_creation_state() {
        let (transport, mut directory) = harness();
        let log = logger();
        let mut ctx = ProjectContext::new(transport.as_ref(), &mut directory, &log);
        ctx.initialize_core_chains().unwrap();

        let chains_before = transport.chain_names();
        let outbound_before = transport.map_rows("firewhale-outbound").unwrap();

        let spec = container(CID, enabled_config(&["tcp; caddy.web; 80"]));
        ctx.apply_container(&spec).unwrap();
        let known: Vec<String> = spec.ips().iter().map(ToString::to_string).collect();
        ctx.destroy_container(CID16, &known).unwrap();

        assert_eq!(transport.chain_names(), chains_before);
        assert_eq!(transport.map_rows("firewhale-outbound").unwrap(), outbound_before);
        assert!(transport
            .set_elements("firewhale-service:proj_caddy.proj_web:ip")
            .is_none());
    }

    #[test]
    fn orphan_cleanup_removes_dead_chains_and_map_rows() {
        let (transport, mut directory) = harness();
        let log = logger();
        let mut ctx = ProjectContext::new(transport.as_ref(), &mut directory, &log);
        ctx.initialize_core_chains().unwrap();

        transport.seed_chain("firewhale-container-DEADBEEFDEADBEEF-inbound");
        transport.seed_map_row(
            "firewhale-inbound",
            "10.9.9.9",
            json!({ "jump": { "target": "firewhale-container-DEADBEEFDEADBEEF-inbound" } }),
        );

        ctx.reconcile(&[]).unwrap();

        assert!(!transport
            .chain_names()
            .contains(&"firewhale-container-DEADBEEFDEADBEEF-inbound".to_owned()));
        assert!(transport.map_rows("firewhale-inbound").unwrap().is_empty());
    }

    #[test]
    fn reconcile_twice_emits_no_mutations() {
        let (transport, mut directory) = harness();
        let log = logger();
        let mut ctx = ProjectContext::new(transport.as_ref(), &mut directory, &log);

        let specs = vec![
            container(CID, enabled_config(&["tcp; 8.8.8.8; 53", "internet"])),
            container(
                "ffeeddccbbaa99887766554433221100",
                enabled_config(&["tcp; caddy.web; 80"]),
            ),
        ];
        ctx.reconcile(&specs).unwrap();

        transport.clear_journal();
        ctx.reconcile(&specs).unwrap();
        assert_eq!(transport.mutations(), Vec::<Value>::new());
    }

    #[test]
    fn full_cleanup_removes_everything() {
        let (transport, mut directory) = harness();
        let log = logger();
        let mut ctx = ProjectContext::new(transport.as_ref(), &mut directory, &log);

        let spec = container(CID, enabled_config(&["tcp; caddy.web; 80"]));
        ctx.reconcile(&[spec]).unwrap();

        full_cleanup(transport.as_ref(), &log).unwrap();

        assert_eq!(transport.chain_names(), vec![DOCKER_USER_CHAIN.to_owned()]);
        assert!(transport.map_rows("firewhale-outbound").is_none());
        assert!(transport
            .set_elements("firewhale-service:proj_caddy.proj_web:ip")
            .is_none());
        assert!(transport
            .chain_rules(DOCKER_USER_CHAIN)
            .unwrap()
            .is_empty());
    }
}
