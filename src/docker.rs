// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The Docker adapter: container inventory, cluster-membership probing, and
//! the lifecycle-event producer thread.
//!
//! Everything the rest of the daemon sees is a
//! [`ContainerSpec`](../types/struct.ContainerSpec.html); the runtime's own
//! representation stops here.

use std::collections::BTreeMap;
use std::io;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use futures::StreamExt;
use shiplift::rep::ContainerDetails;
use shiplift::{ContainerFilter, ContainerListOptions, Docker, EventsOptions};
use slog::{debug, error, o, warn, Logger};

use crate::errors::Result;
use crate::serve::{ContainerSource, WorkItem};
use crate::types::{ContainerSpec, NetworkAttachment};
use crate::util::FutureExt;

/// Containers are only interesting when they carry this label at all;
/// whether the value enables them is decided after parsing.
const ENABLED_LABEL: &str = "firewhale.enabled";

/// Inventory source backed by the Docker API.
pub struct DockerSource {
    docker: Docker,
    logger: Logger,
}

impl DockerSource {
    /// Wrap a Docker client.
    pub fn new(docker: Docker, logger: &Logger) -> DockerSource {
        DockerSource {
            docker,
            logger: logger.new(o!("source" => "docker")),
        }
    }

    fn fetch(&self, id: &str) -> Result<Option<ContainerSpec>> {
        let details = match self.docker.containers().get(id).inspect().sync() {
            Ok(details) => details,
            Err(shiplift::Error::Fault { code, .. }) if code.as_u16() == 404 => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        spec_from_details(&details).map(Some)
    }
}

impl ContainerSource for DockerSource {
    fn list(&self) -> Result<Vec<ContainerSpec>> {
        let options = ContainerListOptions::builder()
            .all()
            .filter(vec![ContainerFilter::LabelName(ENABLED_LABEL.to_owned())])
            .build();
        let summaries = self.docker.containers().list(&options).sync()?;

        let mut specs = Vec::new();
        for summary in summaries {
            match self.fetch(&summary.id) {
                Ok(Some(spec)) => specs.push(spec),
                Ok(None) => {}
                Err(e) => {
                    warn!(self.logger, "Inspecting container failed";
                          o!("id" => summary.id.clone(), "error" => e.to_string()));
                }
            }
        }
        Ok(specs)
    }

    fn inspect(&self, id: &str) -> Result<Option<ContainerSpec>> {
        self.fetch(id)
    }
}

/// Convert an inspect result into the runtime-independent spec.
pub fn spec_from_details(details: &ContainerDetails) -> Result<ContainerSpec> {
    let labels = details.config.labels.clone().unwrap_or_default();
    let mut networks = BTreeMap::new();
    for (name, entry) in &details.network_settings.networks {
        networks.insert(
            name.clone(),
            NetworkAttachment {
                // Created-but-unstarted containers list networks without
                // addresses; malformed addresses read the same way.
                ipv4: entry.ip_address.parse().ok(),
                prefix_len: entry.ip_prefix_len as u8,
            },
        );
    }
    ContainerSpec::from_runtime(&details.id, &details.name, &labels, networks)
}

/// Whether this host is part of an active cluster.
///
/// The runtime exposes no direct membership bit through the client library,
/// but a cluster member always carries swarm-scoped networks.
pub fn swarm_active(docker: &Docker, logger: &Logger) -> bool {
    match docker.networks().list(&Default::default()).sync() {
        Ok(networks) => networks.iter().any(|network| network.scope == "swarm"),
        Err(e) => {
            warn!(logger, "Could not probe cluster membership, assuming single host";
                  o!("error" => e.to_string()));
            false
        }
    }
}

/// Start the producer thread forwarding container lifecycle events into the
/// work queue.
///
/// The stream ending or failing is fatal: the daemon cannot track container
/// churn without it, so a stop is enqueued.
pub fn spawn_event_thread(
    docker: Docker,
    queue: Sender<WorkItem>,
    logger: Logger,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("docker-events".to_owned())
        .spawn(move || {
            async {
                let options = EventsOptions::default();
                let mut stream = docker.events(&options);
                while let Some(event) = stream.next().await {
                    match event {
                        Ok(event) => {
                            if event.typ != "container" {
                                continue;
                            }
                            if event.action != "create" && event.action != "die" {
                                continue;
                            }
                            debug!(logger, "Container event";
                                   o!("action" => event.action.clone(),
                                      "id" => event.actor.id.clone()));
                            if queue
                                .send(WorkItem::Container {
                                    action: event.action.clone(),
                                    id: event.actor.id.clone(),
                                })
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => {
                            error!(logger, "Container event stream failed";
                                   o!("error" => e.to_string()));
                            break;
                        }
                    }
                }
                let _ = queue.send(WorkItem::Stop);
            }
            .sync();
        })
}

#[cfg(all(test, feature = "docker-tests"))]
mod test {
    use super::*;
    use slog::Drain;

    #[test]
    fn lists_containers_from_live_daemon() {
        let logger = Logger::root(slog::Discard.fuse(), o!());
        let source = DockerSource::new(Docker::new(), &logger);
        // The assertion is only that the round trip through list + inspect
        // and label parsing holds up against a real daemon.
        source.list().unwrap();
    }
}
