// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The IP directory tracks which service an IP belongs to and keeps the
//! kernel's per-service sets mirrored to that attribution.
//!
//! Two backends share one contract ([`IpDirectory`](trait.IpDirectory.html)):
//!
//! * [`LocalDirectory`](struct.LocalDirectory.html) is self-sufficient on a
//!   single host and keeps its authoritative state in memory.
//! * [`RedisDirectory`](struct.RedisDirectory.html) coordinates a cluster
//!   through a shared store: claims live in Redis, are reassigned atomically
//!   by a stored function library, and membership deltas fan out over
//!   pub/sub.
//!
//! All directory methods run on the controller's dispatcher thread; the only
//! background activity is the pub/sub listener, which forwards deltas back
//! to the dispatcher instead of acting on them itself.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use failure::format_err;
use serde_json::json;
use slog::{debug, info, o, warn, Logger};

use crate::errors::Result;
use crate::nftables::{cmd, service_set_name, ErrorMode, NftTransport, FAMILY, TABLE_NAME};
use crate::util::{BiMultiMap, MultiMap};

const PUBSUB_POLL: Duration = Duration::from_millis(100);
const STORE_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// The stored function library registered with the shared store.
pub const STORE_FUNCTIONS: &str = include_str!("../resources/ips.lua");

/// Contract of the service/IP fabric, backend-agnostic.
///
/// All methods take `&mut self`: the directory is owned by the dispatcher
/// and never shared across threads.
pub trait IpDirectory: Send {
    /// Record that `container` holds `ip` under `service`, displacing any
    /// prior claim on the IP. Returns true if the attribution changed.
    fn publish(&mut self, service: &str, ip: &str, container: &str) -> Result<bool>;

    /// Drop every claim held by a container.
    fn unpublish_container(&mut self, container: &str) -> Result<()>;

    /// The IPs currently claimed by a container, for teardown.
    fn container_ips(&mut self, container: &str) -> Result<Vec<String>>;

    /// The directory's current view of a service's IPs.
    fn service_ips(&mut self, service: &str) -> Result<BTreeSet<String>>;

    /// Express a container's interest in a service.
    ///
    /// Returns true on the first subscriber, at which point the kernel set
    /// exists and is populated with the known IP union.
    fn subscribe(&mut self, service: &str, container: &str) -> Result<bool>;

    /// Withdraw a container's interest in a service.
    ///
    /// Returns true on the last subscriber, at which point the kernel set is
    /// gone.
    fn unsubscribe(&mut self, service: &str, container: &str) -> Result<bool>;

    /// Withdraw all of a container's interests; called on container death.
    fn unsubscribe_all(&mut self, container: &str) -> Result<()>;

    /// Drop stale claims attributed to this node whose containers are no
    /// longer in the live set.
    fn reclaim(&mut self, live: &HashSet<String>) -> Result<()>;

    /// Re-read an IP's attribution and update mirrored sets; driven by
    /// pub/sub deltas in shared mode.
    fn refresh_ip(&mut self, ip: &str) -> Result<()>;

    /// Release backend resources (pub/sub threads, connections).
    fn close(&mut self) {}
}

/// Subscription bookkeeping and kernel-set mirroring shared by all backends.
pub(crate) struct SubscriptionTable {
    transport: Arc<dyn NftTransport>,
    subscriptions: BiMultiMap<String, String>,
    ip_service_cache: HashMap<String, String>,
    logger: Logger,
}

impl SubscriptionTable {
    fn new(transport: Arc<dyn NftTransport>, logger: Logger) -> SubscriptionTable {
        SubscriptionTable {
            transport,
            subscriptions: BiMultiMap::new(),
            ip_service_cache: HashMap::new(),
            logger,
        }
    }

    fn subscribed(&self, service: &str) -> bool {
        self.subscriptions.has_key(&service.to_owned())
    }

    fn services_of(&self, container: &str) -> Vec<String> {
        self.subscriptions
            .get_by_value(&container.to_owned())
            .map(|services| {
                let mut services: Vec<String> = services.iter().cloned().collect();
                services.sort();
                services
            })
            .unwrap_or_default()
    }

    /// First subscriber creates and fills the kernel set.
    fn subscribe_set(
        &mut self,
        service: &str,
        container: &str,
        initial: &BTreeSet<String>,
    ) -> Result<bool> {
        if !self
            .subscriptions
            .add(service.to_owned(), container.to_owned())
        {
            return Ok(false);
        }

        let mut set = json!({
            "family": FAMILY,
            "table": TABLE_NAME,
            "name": service_set_name(service),
            "type": "ipv4_addr",
        });
        if !initial.is_empty() {
            set["elem"] = json!(initial);
        }
        if let Err(e) = self.transport.run(&[cmd("add", "set", set)], ErrorMode::Strict) {
            self.subscriptions
                .remove(&service.to_owned(), &container.to_owned());
            return Err(e);
        }
        for ip in initial {
            self.ip_service_cache.insert(ip.clone(), service.to_owned());
        }
        info!(self.logger, "Service subscribed";
              o!("service" => service.to_owned(), "ips" => initial.len()));
        Ok(true)
    }

    /// Last subscriber deletes the kernel set.
    fn unsubscribe_set(&mut self, service: &str, container: &str) -> Result<bool> {
        if !self
            .subscriptions
            .remove(&service.to_owned(), &container.to_owned())
        {
            return Ok(false);
        }

        self.transport.run(
            &[cmd(
                "delete",
                "set",
                json!({
                    "family": FAMILY,
                    "table": TABLE_NAME,
                    "name": service_set_name(service),
                }),
            )],
            ErrorMode::Strict,
        )?;
        self.ip_service_cache.retain(|_, svc| svc != service);
        info!(self.logger, "Service unsubscribed";
              o!("service" => service.to_owned()));
        Ok(true)
    }

    /// Mirror an attribution change into the kernel sets.
    ///
    /// Emits the delete-from-prior and add-to-new elements as one strict
    /// batch; the cache is only updated once the batch went through, so a
    /// failed mirror is retried by the next delta or publish.
    fn mirror_ip(&mut self, ip: &str, new_service: Option<&str>) -> Result<()> {
        let prior = self.ip_service_cache.get(ip).cloned();
        if prior.as_deref() == new_service {
            return Ok(());
        }

        let mut commands = Vec::new();
        if let Some(prior) = &prior {
            if self.subscribed(prior) {
                commands.push(cmd(
                    "delete",
                    "element",
                    json!({
                        "family": FAMILY,
                        "table": TABLE_NAME,
                        "name": service_set_name(prior),
                        "elem": [ip],
                    }),
                ));
            }
        }
        if let Some(new_service) = new_service {
            if self.subscribed(new_service) {
                commands.push(cmd(
                    "add",
                    "element",
                    json!({
                        "family": FAMILY,
                        "table": TABLE_NAME,
                        "name": service_set_name(new_service),
                        "elem": [ip],
                    }),
                ));
            }
        }
        if !commands.is_empty() {
            self.transport.run(&commands, ErrorMode::Strict)?;
        }

        match new_service {
            Some(service) => {
                self.ip_service_cache.insert(ip.to_owned(), service.to_owned());
            }
            None => {
                self.ip_service_cache.remove(ip);
            }
        }
        debug!(self.logger, "IP attribution mirrored";
               o!("ip" => ip.to_owned(),
                  "service" => new_service.unwrap_or("<none>").to_owned()));
        Ok(())
    }
}

// === Local backend ===

/// Directory backend holding authoritative state in memory.
pub struct LocalDirectory {
    table: SubscriptionTable,
    ip_service: HashMap<String, String>,
    ip_container: HashMap<String, String>,
    service_published: MultiMap<String, String>,
    logger: Logger,
}

impl LocalDirectory {
    /// Create a local directory over the given transport.
    pub fn new(transport: Arc<dyn NftTransport>, logger: &Logger) -> LocalDirectory {
        let logger = logger.new(o!("directory" => "local"));
        LocalDirectory {
            table: SubscriptionTable::new(transport, logger.clone()),
            ip_service: HashMap::new(),
            ip_container: HashMap::new(),
            service_published: MultiMap::new(),
            logger,
        }
    }

    fn published_ips(&self, service: &str) -> BTreeSet<String> {
        self.service_published
            .get(&service.to_owned())
            .map(|ips| ips.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remove_claim(&mut self, ip: &str) -> Result<()> {
        if let Some(service) = self.ip_service.remove(ip) {
            self.service_published.remove(&service, &ip.to_owned());
            self.ip_container.remove(ip);
            self.table.mirror_ip(ip, None)?;
        }
        Ok(())
    }
}

impl IpDirectory for LocalDirectory {
    fn publish(&mut self, service: &str, ip: &str, container: &str) -> Result<bool> {
        let changed = self.ip_service.get(ip).map(String::as_str) != Some(service);

        if let Some(prior) = self
            .ip_service
            .insert(ip.to_owned(), service.to_owned())
        {
            if prior != service {
                self.service_published.remove(&prior, &ip.to_owned());
            }
        }
        self.ip_container.insert(ip.to_owned(), container.to_owned());
        self.service_published.add(service.to_owned(), ip.to_owned());

        // The mirror call is unconditional: it no-ops when converged, and
        // retries a previously failed batch otherwise.
        self.table.mirror_ip(ip, Some(service))?;
        if changed {
            debug!(self.logger, "IP published";
                   o!("ip" => ip.to_owned(), "service" => service.to_owned()));
        }
        Ok(changed)
    }

    fn unpublish_container(&mut self, container: &str) -> Result<()> {
        for ip in self.container_ips(container)? {
            self.remove_claim(&ip)?;
        }
        Ok(())
    }

    fn container_ips(&mut self, container: &str) -> Result<Vec<String>> {
        let mut ips: Vec<String> = self
            .ip_container
            .iter()
            .filter(|(_, owner)| owner.as_str() == container)
            .map(|(ip, _)| ip.clone())
            .collect();
        ips.sort();
        Ok(ips)
    }

    fn service_ips(&mut self, service: &str) -> Result<BTreeSet<String>> {
        Ok(self.published_ips(service))
    }

    fn subscribe(&mut self, service: &str, container: &str) -> Result<bool> {
        let initial = self.published_ips(service);
        self.table.subscribe_set(service, container, &initial)
    }

    fn unsubscribe(&mut self, service: &str, container: &str) -> Result<bool> {
        self.table.unsubscribe_set(service, container)
    }

    fn unsubscribe_all(&mut self, container: &str) -> Result<()> {
        for service in self.table.services_of(container) {
            if let Err(e) = self.table.unsubscribe_set(&service, container) {
                warn!(self.logger, "Unsubscribing failed";
                      o!("service" => service, "error" => e.to_string()));
            }
        }
        Ok(())
    }

    fn reclaim(&mut self, live: &HashSet<String>) -> Result<()> {
        let stale: Vec<String> = self
            .ip_container
            .iter()
            .filter(|(_, owner)| !live.contains(owner.as_str()))
            .map(|(ip, _)| ip.clone())
            .collect();
        for ip in stale {
            self.remove_claim(&ip)?;
        }
        Ok(())
    }

    fn refresh_ip(&mut self, _ip: &str) -> Result<()> {
        // Local attributions are mirrored inline by publish/unpublish.
        Ok(())
    }
}

// === Shared (Redis) backend ===

/// Delivered for every pub/sub delta: `(service, ip)`.
pub type DeltaCallback = Box<dyn Fn(String, String) + Send>;
/// Fired after the pub/sub connection was re-established.
pub type ReconnectCallback = Box<dyn Fn() + Send>;

enum PubSubControl {
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

/// Directory backend coordinating IP claims through a shared Redis store.
pub struct RedisDirectory {
    table: SubscriptionTable,
    client: redis::Client,
    connection: Option<redis::Connection>,
    node: String,
    control: Sender<PubSubControl>,
    worker: Option<JoinHandle<()>>,
    logger: Logger,
}

impl RedisDirectory {
    /// Connect to the store, register the function library and start the
    /// pub/sub listener.
    pub fn new(
        url: &str,
        transport: Arc<dyn NftTransport>,
        node: &str,
        on_delta: DeltaCallback,
        on_reconnect: ReconnectCallback,
        logger: &Logger,
    ) -> Result<RedisDirectory> {
        let logger = logger.new(o!("directory" => "redis"));
        let client = redis::Client::open(url)?;

        let (control_tx, control_rx) = unbounded();
        let worker_client = client.clone();
        let worker_logger = logger.new(o!("thread" => "redis-pubsub"));
        let worker = thread::Builder::new()
            .name("redis-pubsub".to_owned())
            .spawn(move || {
                pubsub_worker(worker_client, control_rx, on_delta, on_reconnect, worker_logger)
            })?;

        let mut directory = RedisDirectory {
            table: SubscriptionTable::new(transport, logger.clone()),
            client,
            connection: None,
            node: node.to_owned(),
            control: control_tx,
            worker: Some(worker),
            logger,
        };
        // Establish the command connection eagerly so startup fails loudly
        // when the store is unreachable.
        directory.connection()?;
        Ok(directory)
    }

    fn connection(&mut self) -> Result<&mut redis::Connection> {
        if self.connection.is_none() {
            let mut connection = self.client.get_connection()?;
            redis::cmd("FUNCTION")
                .arg("LOAD")
                .arg("REPLACE")
                .arg(STORE_FUNCTIONS)
                .query::<String>(&mut connection)?;
            debug!(self.logger, "Registered shared-store function library");
            self.connection = Some(connection);
        }
        match self.connection.as_mut() {
            Some(connection) => Ok(connection),
            None => Err(format_err!("shared store connection unavailable")),
        }
    }

    /// Run a command, re-establishing the connection once on I/O failure.
    fn query<T: redis::FromRedisValue>(&mut self, command: &redis::Cmd) -> Result<T> {
        let first = {
            let connection = self.connection()?;
            command.query::<T>(connection)
        };
        match first {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
                    warn!(self.logger, "Shared store connection lost, reconnecting";
                          o!("error" => e.to_string()));
                    self.connection = None;
                    let connection = self.connection()?;
                    command.query::<T>(connection).map_err(Into::into)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    fn smembers(&mut self, key: &str) -> Result<Vec<String>> {
        let mut command = redis::cmd("SMEMBERS");
        command.arg(key);
        self.query(&command)
    }
}

impl IpDirectory for RedisDirectory {
    fn publish(&mut self, service: &str, ip: &str, container: &str) -> Result<bool> {
        let ts = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut command = redis::cmd("FCALL");
        command
            .arg("set_ip")
            .arg(1)
            .arg(ip)
            .arg(service)
            .arg(container)
            .arg(self.node.as_str())
            .arg(ts);
        let changed: i64 = self.query(&command)?;
        if changed == 1 {
            debug!(self.logger, "IP published";
                   o!("ip" => ip.to_owned(), "service" => service.to_owned()));
        }
        Ok(changed == 1)
    }

    fn unpublish_container(&mut self, container: &str) -> Result<()> {
        let mut command = redis::cmd("FCALL");
        command
            .arg("rm_ips_by")
            .arg(1)
            .arg(container)
            .arg("container");
        let _removed: i64 = self.query(&command)?;
        Ok(())
    }

    fn container_ips(&mut self, container: &str) -> Result<Vec<String>> {
        let mut ips = self.smembers(&format!("container:{}:ips", container))?;
        ips.sort();
        Ok(ips)
    }

    fn service_ips(&mut self, service: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .smembers(&format!("service:{}:ips", service))?
            .into_iter()
            .collect())
    }

    fn subscribe(&mut self, service: &str, container: &str) -> Result<bool> {
        let initial = self.service_ips(service)?;
        if self.table.subscribe_set(service, container, &initial)? {
            let _ = self
                .control
                .send(PubSubControl::Subscribe(format!("service:{}", service)));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn unsubscribe(&mut self, service: &str, container: &str) -> Result<bool> {
        if self.table.unsubscribe_set(service, container)? {
            let _ = self
                .control
                .send(PubSubControl::Unsubscribe(format!("service:{}", service)));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn unsubscribe_all(&mut self, container: &str) -> Result<()> {
        for service in self.table.services_of(container) {
            if let Err(e) = self.unsubscribe(&service, container) {
                warn!(self.logger, "Unsubscribing failed";
                      o!("service" => service, "error" => e.to_string()));
            }
        }
        Ok(())
    }

    fn reclaim(&mut self, live: &HashSet<String>) -> Result<()> {
        let node_key = format!("node:{}:ips", self.node);
        for ip in self.smembers(&node_key)? {
            let mut command = redis::cmd("HGETALL");
            command.arg(format!("ip:{}", ip));
            let state: HashMap<String, String> = self.query(&command)?;

            if state.get("node").map(String::as_str) != Some(self.node.as_str()) {
                // The claim moved nodes (or vanished); our node index is stale.
                let mut command = redis::cmd("SREM");
                command.arg(&node_key).arg(&ip);
                let _: i64 = self.query(&command)?;
                continue;
            }
            if let Some(container) = state.get("container") {
                if !live.contains(container.as_str()) {
                    info!(self.logger, "Reclaiming stale IP";
                          o!("ip" => ip.clone(), "container" => container.clone()));
                    let mut command = redis::cmd("FCALL");
                    command
                        .arg("rm_ip")
                        .arg(1)
                        .arg(&ip)
                        .arg("container")
                        .arg(container.as_str());
                    let _: i64 = self.query(&command)?;
                }
            }
        }
        Ok(())
    }

    fn refresh_ip(&mut self, ip: &str) -> Result<()> {
        let mut command = redis::cmd("HGETALL");
        command.arg(format!("ip:{}", ip));
        let state: HashMap<String, String> = self.query(&command)?;
        let service = state.get("service").cloned();
        self.table.mirror_ip(ip, service.as_deref())
    }

    fn close(&mut self) {
        let _ = self.control.send(PubSubControl::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn pubsub_worker(
    client: redis::Client,
    control: Receiver<PubSubControl>,
    on_delta: DeltaCallback,
    on_reconnect: ReconnectCallback,
    logger: Logger,
) {
    let mut channels: HashSet<String> = HashSet::new();
    let mut first_connect = true;

    'connect: loop {
        let mut connection = match client.get_connection() {
            Ok(connection) => connection,
            Err(e) => {
                debug!(logger, "Store connection failed, retrying";
                       o!("error" => e.to_string()));
                match control.recv_timeout(STORE_RECONNECT_DELAY) {
                    Ok(PubSubControl::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
                    Ok(PubSubControl::Subscribe(channel)) => {
                        channels.insert(channel);
                    }
                    Ok(PubSubControl::Unsubscribe(channel)) => {
                        channels.remove(&channel);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                }
                continue 'connect;
            }
        };

        let mut pubsub = connection.as_pubsub();
        if pubsub.set_read_timeout(Some(PUBSUB_POLL)).is_err() {
            thread::sleep(STORE_RECONNECT_DELAY);
            continue 'connect;
        }
        for channel in &channels {
            if pubsub.subscribe(channel).is_err() {
                thread::sleep(STORE_RECONNECT_DELAY);
                continue 'connect;
            }
        }

        if !first_connect {
            info!(logger, "Shared store reconnected");
            on_reconnect();
        }
        first_connect = false;

        loop {
            // Apply pending subscription changes.
            loop {
                match control.try_recv() {
                    Ok(PubSubControl::Subscribe(channel)) => {
                        let fresh = channels.insert(channel.clone());
                        if fresh && pubsub.subscribe(&channel).is_err() {
                            continue 'connect;
                        }
                    }
                    Ok(PubSubControl::Unsubscribe(channel)) => {
                        channels.remove(&channel);
                        let _ = pubsub.unsubscribe(&channel);
                    }
                    Ok(PubSubControl::Shutdown) | Err(TryRecvError::Disconnected) => return,
                    Err(TryRecvError::Empty) => break,
                }
            }

            match pubsub.get_message() {
                Ok(message) => {
                    let channel = message.get_channel_name().to_owned();
                    let ip: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(_) => continue,
                    };
                    if channel.starts_with("service:") {
                        on_delta(channel["service:".len()..].to_owned(), ip);
                    }
                }
                Err(e) if e.is_timeout() => continue,
                Err(e) => {
                    warn!(logger, "Pub/sub connection lost";
                          o!("error" => e.to_string()));
                    break;
                }
            }
        }

        thread::sleep(STORE_RECONNECT_DELAY);
    }
}
