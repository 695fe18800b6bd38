// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! # Firewhale - label-driven container firewalling
//!
//! Firewhale is a per-host daemon that turns firewall intent expressed as
//! labels on Docker containers into nftables rules. Workloads come and go;
//! firewhale watches the container lifecycle and keeps three things
//! consistent:
//!
//! * **Container projection** - every firewhale-enabled container gets one
//!   chain per traffic direction, populated from its labelled rules, and
//!   verdict-map entries dispatching its addresses into those chains.
//!
//! * **Service fabric** - peers are addressed by *service name*, not by
//!   ephemeral IP. Each container's addresses are published under its
//!   service identity, and kernel sets named after `<service>.<network>`
//!   mirror the union of IPs for every referenced service. A single-host
//!   deployment keeps this in memory; a cluster shares it through Redis
//!   with pub/sub fan-out.
//!
//! * **Transport split** - the daemon can run sandboxed while a small
//!   privileged agent executes the actual nftables batches on the host,
//!   bridged over a framed Unix-socket protocol with automatic resync on
//!   every reattach.
//!
//! ## Labels
//!
//! ```yaml
//! firewhale.enabled: "true"
//! firewhale.outbound: "[ 'tcp; api.web; 80', 'udp; 8.8.8.8; 53' ]"
//! firewhale.inbound: "tcp; caddy.web; :8080"
//! ```
//!
//! A rule is `[proto;] peer [; [:]dst_port] [; key:value ...]`; peers can be
//! wildcards, `internet`/`local-networks`, the container's own network, a
//! `[namespace:]service.network` reference, a host, a CIDR, or an address
//! range. See [`types`](types/index.html) for the grammar and
//! [`rule`](rule/index.html) for the compilation.
//!
//! ## Running
//!
//! ```console
//! $ firewhale run
//! $ firewhale run --nfagent --redis=redis://redis:6379/0
//! $ firewhale nfagent
//! $ firewhale full-cleanup
//! ```
//!
//! Defaults are inferred from cluster membership: inside an active swarm,
//! the shared store and the agent split are both enabled.

#![deny(missing_docs)]

pub mod agent;
pub mod docker;
pub mod errors;
pub mod ipdir;
pub mod nftables;
pub mod process;
pub mod rule;
pub mod serve;
pub mod types;
pub mod util;

pub use crate::serve::{ContainerSource, Controller, WorkItem};
