// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The controller: a single dispatcher thread draining one work queue.
//!
//! Producers (the container event stream, the signal handler, the socket
//! transport's accept thread, the shared store's pub/sub listener) only ever
//! enqueue [`WorkItem`](enum.WorkItem.html)s; every mutation of firewall
//! state, subscription tables or IP caches happens here, so serial order
//! matches the causal order of enqueue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use slog::{debug, error, info, o, warn, Logger};

use crate::errors::{FirewhaleError, Result};
use crate::ipdir::IpDirectory;
use crate::nftables::NftTransport;
use crate::process::ProjectContext;
use crate::types::ContainerSpec;

/// One unit of work for the dispatcher.
#[derive(Debug)]
pub enum WorkItem {
    /// A container lifecycle event from the runtime.
    Container {
        /// The runtime's action string (`create`, `die`).
        action: String,
        /// Full container id.
        id: String,
    },
    /// The firewall transport (re)attached; run a full reconcile.
    TransportConnected,
    /// The shared store reconnected; republish, reclaim, reconcile.
    StoreReconnected,
    /// A service membership delta arrived over pub/sub.
    ServiceDelta {
        /// Fully-qualified service identifier.
        service: String,
        /// The affected IP.
        ip: String,
    },
    /// Shut down cleanly.
    Stop,
}

/// Source of container inventory, abstracted so tests can run the
/// controller over an in-memory fixture.
pub trait ContainerSource: Send {
    /// All containers carrying firewhale labels.
    fn list(&self) -> Result<Vec<ContainerSpec>>;

    /// One container by id; `None` when it no longer exists.
    fn inspect(&self, id: &str) -> Result<Option<ContainerSpec>>;
}

/// The per-host control loop.
pub struct Controller {
    source: Box<dyn ContainerSource>,
    transport: Arc<dyn NftTransport>,
    directory: Box<dyn IpDirectory>,
    queue: Receiver<WorkItem>,
    containers: HashMap<String, ContainerSpec>,
    logger: Logger,
}

impl Controller {
    /// Assemble a controller over explicit dependencies.
    pub fn new(
        source: Box<dyn ContainerSource>,
        transport: Arc<dyn NftTransport>,
        directory: Box<dyn IpDirectory>,
        queue: Receiver<WorkItem>,
        logger: &Logger,
    ) -> Controller {
        Controller {
            source,
            transport,
            directory,
            queue,
            containers: HashMap::new(),
            logger: logger.new(o!()),
        }
    }

    /// Seed the IP directory from the current inventory.
    ///
    /// Runs before the first reconcile and performs no firewall changes:
    /// nothing is subscribed yet, so publishing cannot emit set updates.
    pub fn prime_directory(&mut self) -> Result<()> {
        for spec in self.source.list()? {
            if spec.enabled() && spec.firewhale.publish_ips {
                publish_container_ips(self.directory.as_mut(), &spec, &self.logger);
            }
        }
        Ok(())
    }

    /// Drain the queue until a stop is requested or every producer is gone.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let item = match self.queue.recv() {
                Ok(item) => item,
                Err(_) => {
                    warn!(self.logger, "All work producers disappeared, stopping");
                    break;
                }
            };
            if !self.handle(item)? {
                break;
            }
        }
        self.directory.close();
        info!(self.logger, "Shut down cleanly");
        Ok(())
    }

    fn handle(&mut self, item: WorkItem) -> Result<bool> {
        match item {
            WorkItem::Stop => {
                info!(self.logger, "Stop requested");
                return Ok(false);
            }
            WorkItem::TransportConnected => {
                info!(self.logger, "Firewall transport attached, reconciling");
                self.reconcile_logged()?;
            }
            WorkItem::StoreReconnected => {
                info!(self.logger, "Shared store reattached, republishing local claims");
                match self.source.list() {
                    Ok(inventory) => {
                        let live: HashSet<String> = inventory
                            .iter()
                            .filter(|spec| spec.enabled())
                            .map(|spec| spec.id16().to_owned())
                            .collect();
                        for spec in &inventory {
                            if spec.enabled() && spec.firewhale.publish_ips {
                                publish_container_ips(
                                    self.directory.as_mut(),
                                    spec,
                                    &self.logger,
                                );
                            }
                        }
                        if let Err(e) = self.directory.reclaim(&live) {
                            warn!(self.logger, "Reclaiming stale claims failed";
                                  o!("error" => e.to_string()));
                        }
                    }
                    Err(e) => {
                        warn!(self.logger, "Could not list containers for republish";
                              o!("error" => e.to_string()));
                    }
                }
                self.reconcile_logged()?;
            }
            WorkItem::ServiceDelta { service, ip } => {
                debug!(self.logger, "Service membership delta";
                       o!("service" => service.clone(), "ip" => ip.clone()));
                if let Err(e) = self.directory.refresh_ip(&ip) {
                    warn!(self.logger, "Refreshing IP attribution failed";
                          o!("ip" => ip, "error" => e.to_string()));
                }
            }
            WorkItem::Container { action, id } => {
                self.handle_container_event(&action, &id);
            }
        }
        Ok(true)
    }

    /// Run a full reconcile; only a missing ingress chain is fatal.
    fn reconcile_logged(&mut self) -> Result<()> {
        match self.full_reconcile() {
            Ok(()) => Ok(()),
            Err(e) => {
                let fatal = e
                    .downcast_ref::<FirewhaleError>()
                    .map_or(false, |fe| matches!(fe, FirewhaleError::ChainNotFound { .. }));
                if fatal {
                    return Err(e);
                }
                error!(self.logger, "Reconcile failed";
                       o!("error" => format!("{:?}", e)));
                Ok(())
            }
        }
    }

    fn full_reconcile(&mut self) -> Result<()> {
        let inventory = self.source.list()?;
        let enabled: Vec<ContainerSpec> = inventory
            .into_iter()
            .filter(|spec| spec.enabled())
            .collect();

        self.containers
            .retain(|id16, _| enabled.iter().any(|spec| spec.id16() == id16));

        let mut specs = Vec::new();
        for spec in enabled {
            match self.register(spec.clone()) {
                Ok(()) => specs.push(spec),
                Err(e) => {
                    error!(self.logger, "Refusing to project container";
                           o!("container" => spec.name.clone(),
                              "error" => e.to_string()));
                }
            }
        }

        let mut ctx = ProjectContext::new(
            self.transport.as_ref(),
            self.directory.as_mut(),
            &self.logger,
        );
        ctx.reconcile(&specs)
    }

    fn handle_container_event(&mut self, action: &str, id: &str) {
        match action {
            "create" => {
                let spec = match self.source.inspect(id) {
                    Ok(Some(spec)) => spec,
                    Ok(None) => {
                        debug!(self.logger, "Created container already gone";
                               o!("id" => id.to_owned()));
                        return;
                    }
                    Err(e) => {
                        warn!(self.logger, "Inspecting created container failed";
                              o!("id" => id.to_owned(), "error" => e.to_string()));
                        return;
                    }
                };
                if !spec.enabled() {
                    debug!(self.logger, "Container not firewhale-enabled";
                           o!("id" => id.to_owned()));
                    return;
                }
                if let Err(e) = self.register(spec.clone()) {
                    error!(self.logger, "Refusing to project container";
                           o!("container" => spec.name.clone(), "error" => e.to_string()));
                    return;
                }
                let mut ctx = ProjectContext::new(
                    self.transport.as_ref(),
                    self.directory.as_mut(),
                    &self.logger,
                );
                if let Err(e) = ctx.apply_container(&spec) {
                    error!(self.logger, "Projecting container failed";
                           o!("container" => spec.name.clone(),
                              "error" => format!("{:?}", e)));
                }
            }
            "die" => {
                let id16: String = id.chars().take(16).collect();
                let known: Vec<String> = self
                    .containers
                    .remove(&id16)
                    .map(|spec| spec.ips().iter().map(ToString::to_string).collect())
                    .unwrap_or_default();
                let mut ctx = ProjectContext::new(
                    self.transport.as_ref(),
                    self.directory.as_mut(),
                    &self.logger,
                );
                if let Err(e) = ctx.destroy_container(&id16, &known) {
                    error!(self.logger, "Destroying container state failed";
                           o!("id" => id16, "error" => format!("{:?}", e)));
                }
            }
            _ => {
                debug!(self.logger, "Ignoring container event";
                       o!("action" => action.to_owned(), "id" => id.to_owned()));
            }
        }
    }

    /// Track a container, refusing chain-name prefix collisions.
    fn register(&mut self, spec: ContainerSpec) -> Result<()> {
        let id16 = spec.id16().to_owned();
        if let Some(existing) = self.containers.get(&id16) {
            if existing.id != spec.id {
                return Err(FirewhaleError::ContainerConfiguration {
                    reason: format!(
                        "chain id collision between containers '{}' and '{}'",
                        existing.id, spec.id
                    ),
                }
                .into());
            }
        }
        self.containers.insert(id16, spec);
        Ok(())
    }
}

fn publish_container_ips(directory: &mut dyn IpDirectory, spec: &ContainerSpec, logger: &Logger) {
    for (net, attachment) in &spec.networks {
        if let Some(ip) = attachment.ipv4 {
            let service = format!("{}.{}", spec.service_name, net);
            if let Err(e) = directory.publish(&service, &ip.to_string(), spec.id16()) {
                warn!(logger, "Publishing IP failed";
                      o!("service" => service, "ip" => ip.to_string(),
                         "error" => e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ipdir::LocalDirectory;
    use crate::nftables::MemoryTransport;
    use crate::types::{ContainerSpecBuilder, FirewhaleConfig, NetworkAttachment};
    use crossbeam_channel::unbounded;
    use slog::Drain;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn logger() -> Logger {
        Logger::root(slog::Discard.fuse(), o!())
    }

    struct StaticSource {
        specs: Mutex<Vec<ContainerSpec>>,
    }

    impl StaticSource {
        fn new(specs: Vec<ContainerSpec>) -> StaticSource {
            StaticSource {
                specs: Mutex::new(specs),
            }
        }
    }

    impl ContainerSource for StaticSource {
        fn list(&self) -> Result<Vec<ContainerSpec>> {
            Ok(self.specs.lock().unwrap().clone())
        }

        fn inspect(&self, id: &str) -> Result<Option<ContainerSpec>> {
            Ok(self
                .specs
                .lock()
                .unwrap()
                .iter()
                .find(|spec| spec.id == id)
                .cloned())
        }
    }

    fn spec(id: &str, ip: &str) -> ContainerSpec {
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
            .name(format!("c-{}", &id[..4]))
            .service_name("api")
            .networks(networks)
            .firewhale(FirewhaleConfig {
                enabled: true,
                outbound: vec!["tcp; 8.8.8.8; 53".to_owned()],
                ..FirewhaleConfig::default()
            })
            .build()
            .unwrap()
    }

    fn controller(
        specs: Vec<ContainerSpec>,
    ) -> (
        Arc<MemoryTransport>,
        crossbeam_channel::Sender<WorkItem>,
        Controller,
    ) {
        let transport = Arc::new(MemoryTransport::with_docker_user());
        let directory = LocalDirectory::new(transport.clone(), &logger());
        let (tx, rx) = unbounded();
        let controller = Controller::new(
            Box::new(StaticSource::new(specs)),
            transport.clone(),
            Box::new(directory),
            rx,
            &logger(),
        );
        (transport, tx, controller)
    }

    const CID_A: &str = "aabbccddeeff00112233445566778899";
    const CID_B: &str = "aabbccddeeff0011ffffffffffffffff";

    #[test]
    fn transport_connected_triggers_reconcile() {
        let (transport, tx, mut controller) = controller(vec![spec(CID_A, "10.0.0.5")]);
        tx.send(WorkItem::TransportConnected).unwrap();
        tx.send(WorkItem::Stop).unwrap();
        controller.run().unwrap();

        assert!(transport
            .chain_names()
            .contains(&"firewhale-container-aabbccddeeff0011-outbound".to_owned()));
        assert!(transport
            .map_rows("firewhale-outbound")
            .unwrap()
            .contains_key("10.0.0.5"));
    }

    #[test]
    fn create_and_die_events_round_trip() {
        let (transport, tx, mut controller) = controller(vec![spec(CID_A, "10.0.0.5")]);
        tx.send(WorkItem::TransportConnected).unwrap();
        tx.send(WorkItem::Stop).unwrap();
        controller.run().unwrap();
        let populated = transport.chain_names();

        // The container dies...
        let (tx2, rx2) = unbounded();
        controller.queue = rx2;
        tx2.send(WorkItem::Container {
            action: "die".to_owned(),
            id: CID_A.to_owned(),
        })
        .unwrap();
        tx2.send(WorkItem::Stop).unwrap();
        controller.run().unwrap();

        assert!(transport.chain_names().len() < populated.len());
        assert!(transport.map_rows("firewhale-outbound").unwrap().is_empty());
    }

    #[test]
    fn chain_id_collision_is_rejected() {
        let (transport, tx, mut controller) =
            controller(vec![spec(CID_A, "10.0.0.5"), spec(CID_B, "10.0.0.6")]);
        tx.send(WorkItem::TransportConnected).unwrap();
        tx.send(WorkItem::Stop).unwrap();
        controller.run().unwrap();

        // The first container projects, the collider does not.
        let rows = transport.map_rows("firewhale-outbound").unwrap();
        assert!(rows.contains_key("10.0.0.5"));
        assert!(!rows.contains_key("10.0.0.6"));
    }

    #[test]
    fn missing_ingress_chain_is_fatal() {
        let transport = Arc::new(MemoryTransport::new());
        let directory = LocalDirectory::new(transport.clone(), &logger());
        let (tx, rx) = unbounded();
        let mut controller = Controller::new(
            Box::new(StaticSource::new(Vec::new())),
            transport,
            Box::new(directory),
            rx,
            &logger(),
        );
        tx.send(WorkItem::TransportConnected).unwrap();
        assert!(controller.run().is_err());
    }

    #[test]
    fn prime_directory_makes_no_firewall_changes() {
        let (transport, _tx, mut controller) = controller(vec![spec(CID_A, "10.0.0.5")]);
        controller.prime_directory().unwrap();
        assert!(transport.mutations().is_empty());
    }
}
