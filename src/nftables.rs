// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! This module holds everything that touches the nftables engine: the names
//! firewhale reserves in the kernel firewall, builders for the engine's JSON
//! command format, the [`NftTransport`](trait.NftTransport.html) trait, and
//! its three implementations:
//!
//! * [`LocalTransport`](struct.LocalTransport.html), piping JSON batches to
//!   the `nft` binary,
//! * [`SocketTransport`](struct.SocketTransport.html), bridging batches over
//!   a Unix socket to a privileged agent process, and
//! * [`MemoryTransport`](struct.MemoryTransport.html), a stateful in-memory
//!   stand-in used by the test-suite.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use failure::format_err;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use slog::{debug, info, o, warn, Logger};

use crate::errors::{FirewhaleError, Result};

/// The nftables binary the local transport drives.
pub const NFT_PROGRAM: &str = "nft";

/// Address family of everything firewhale manages.
pub const FAMILY: &str = "ip";
/// The table firewhale works in.
pub const TABLE_NAME: &str = "filter";
/// The per-host entry chain.
pub const FIREWHALE_CHAIN: &str = "firewhale";
/// Docker's ingress chain, into which the tagged bounce rule is placed.
pub const DOCKER_USER_CHAIN: &str = "DOCKER-USER";
/// Comment tag identifying rules firewhale owns inside foreign chains.
pub const RULE_TAG: &str = "[firewhale]";
/// Name prefix of every per-container chain.
pub const CONTAINER_CHAIN_PREFIX: &str = "firewhale-container-";
/// Name prefix of every per-service set.
pub const SERVICE_SET_PREFIX: &str = "firewhale-service:";

/// Default path of the agent socket.
pub const DEFAULT_SOCKET_PATH: &str = "/shared/firewhale-nfagent";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on a single wire frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Prefix of every chain owned by the container with the given id prefix.
pub fn container_chain_prefix(id16: &str) -> String {
    format!("{}{}", CONTAINER_CHAIN_PREFIX, id16)
}

/// Name of the kernel set mirroring a fully-qualified service.
pub fn service_set_name(service: &str) -> String {
    format!("{}{}:ip", SERVICE_SET_PREFIX, service)
}

/// Extract the container id encoded in a per-container chain name.
///
/// The id is the third dash-separated component
/// (`firewhale-container-<id16>[-<direction>]`).
pub fn chain_container_id(chain_name: &str) -> Option<&str> {
    if !chain_name.starts_with(CONTAINER_CHAIN_PREFIX) {
        return None;
    }
    chain_name.split('-').nth(2)
}

/// JSON reference to the managed table.
pub fn table_json() -> Value {
    json!({ "family": FAMILY, "name": TABLE_NAME })
}

/// JSON reference to a chain in the managed table.
pub fn chain_json(name: &str) -> Value {
    json!({ "family": FAMILY, "table": TABLE_NAME, "name": name })
}

/// JSON rule object for a chain in the managed table.
pub fn rule_json(chain: &str, expr: Value, comment: Option<&str>) -> Value {
    let mut rule = json!({
        "family": FAMILY,
        "table": TABLE_NAME,
        "chain": chain,
        "expr": expr,
    });
    if let Some(comment) = comment {
        rule["comment"] = json!(comment);
    }
    rule
}

/// Build one command object, e.g. `cmd("add", "chain", chain_json("x"))`.
pub fn cmd(verb: &str, kind: &str, object: Value) -> Value {
    let mut inner = serde_json::Map::new();
    inner.insert(kind.to_owned(), object);
    let mut outer = serde_json::Map::new();
    outer.insert(verb.to_owned(), Value::Object(inner));
    Value::Object(outer)
}

/// Normalize a comment tag to its bracketed form.
pub fn normalize_tag(tag: &str) -> String {
    let mut tag = tag.to_owned();
    if !tag.starts_with('[') {
        tag.insert(0, '[');
    }
    if !tag.ends_with(']') {
        tag.push(']');
    }
    tag
}

fn sorted_values(items: &[Value]) -> Vec<Value> {
    let mut items = items.to_vec();
    items.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    items
}

fn normalize_statement(stmt: &Value) -> Value {
    // Counters accumulate packet/byte counts in engine output; treat any
    // counter as equal to any other.
    if stmt.get("counter").is_some() {
        return json!({ "counter": null });
    }
    let matcher = match stmt.get("match") {
        Some(matcher) => matcher,
        None => return stmt.clone(),
    };
    let mut matcher = matcher.clone();
    let normalized_right = match matcher.get("right") {
        Some(Value::Array(items)) => Some(json!({ "set": sorted_values(items) })),
        Some(other) => match other.get("set") {
            Some(Value::Array(items)) => Some(json!({ "set": sorted_values(items) })),
            _ => None,
        },
        None => None,
    };
    if let Some(right) = normalized_right {
        matcher["right"] = right;
    }
    json!({ "match": matcher })
}

/// The expression list of a rule object, normalized for comparison.
///
/// Engine output spells anonymous sets and counters differently from the
/// commands that created them; both sides are normalized before comparing.
pub fn normalized_exprs(rule: &Value) -> Vec<Value> {
    rule.get("expr")
        .and_then(Value::as_array)
        .map(|exprs| exprs.iter().map(normalize_statement).collect())
        .unwrap_or_default()
}

/// Whether two rule objects have equal (normalized) expressions.
pub fn exprs_equal(a: &Value, b: &Value) -> bool {
    normalized_exprs(a) == normalized_exprs(b)
}

fn rule_comment(rule: &Value) -> Option<&str> {
    rule.get("comment").and_then(Value::as_str)
}

/// How a batch reacts to engine-reported errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    /// Any error aborts the batch and surfaces to the caller.
    Strict,
    /// The batch is submitted once; errors are logged and swallowed.
    Ignore,
    /// Items are applied individually; errors are logged, the sequence
    /// continues. Used on teardown paths where partial state is expected.
    Continue,
}

impl Serialize for ErrorMode {
    fn serialize<S>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            ErrorMode::Strict => serializer.serialize_bool(true),
            ErrorMode::Ignore => serializer.serialize_bool(false),
            ErrorMode::Continue => serializer.serialize_str("continue"),
        }
    }
}

impl<'de> Deserialize<'de> for ErrorMode {
    fn deserialize<D>(deserializer: D) -> ::std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ErrorModeVisitor;

        impl<'de> de::Visitor<'de> for ErrorModeVisitor {
            type Value = ErrorMode;

            fn expecting(&self, formatter: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                formatter.write_str("a boolean or the string 'continue'")
            }

            fn visit_bool<E>(self, value: bool) -> ::std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(if value {
                    ErrorMode::Strict
                } else {
                    ErrorMode::Ignore
                })
            }

            fn visit_str<E>(self, value: &str) -> ::std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value == "continue" {
                    Ok(ErrorMode::Continue)
                } else {
                    Err(de::Error::custom(format!("unknown throw mode '{}'", value)))
                }
            }
        }

        deserializer.deserialize_any(ErrorModeVisitor)
    }
}

/// One request over the agent wire.
#[derive(Debug, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Either the array of batch commands, or the string `"ping"`.
    pub cmd: Value,
    /// Error handling the agent should apply.
    pub throw: ErrorMode,
}

/// Outcome marker of an agent response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum AgentStatus {
    Ok,
    Error,
}

/// One response over the agent wire.
#[derive(Debug, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Whether the request succeeded.
    pub status: AgentStatus,
    /// Engine output on success, error text on failure.
    #[serde(default)]
    pub data: Value,
}

/// Write one length-framed payload.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one length-framed payload.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Abstraction over the kernel firewall command channel.
///
/// A single operation: submit a batch of declarative JSON command objects.
/// The returned values are whatever objects the engine printed (list command
/// results, echoes), with the `nftables` envelope stripped.
pub trait NftTransport: Send + Sync {
    /// Submit `commands` with the given error handling.
    fn run(&self, commands: &[Value], mode: ErrorMode) -> Result<Vec<Value>>;
}

// === Shared queries over a transport ===

/// Every chain object of the managed table.
pub fn list_table_chains(transport: &dyn NftTransport) -> Result<Vec<Value>> {
    let output = transport.run(&[cmd("list", "table", table_json())], ErrorMode::Strict)?;
    Ok(output
        .into_iter()
        .filter_map(|obj| obj.get("chain").cloned())
        .filter(|chain| chain.get("table").and_then(Value::as_str) == Some(TABLE_NAME))
        .collect())
}

/// Every rule object of one chain of the managed table.
pub fn list_chain_rules(transport: &dyn NftTransport, chain: &str) -> Result<Vec<Value>> {
    let output = transport.run(&[cmd("list", "chain", chain_json(chain))], ErrorMode::Strict)?;
    Ok(output
        .into_iter()
        .filter_map(|obj| obj.get("rule").cloned())
        .filter(|rule| {
            rule.get("table").and_then(Value::as_str) == Some(TABLE_NAME)
                && rule.get("chain").and_then(Value::as_str) == Some(chain)
        })
        .collect())
}

/// Synchronize the tagged rules of a chain with the desired rules.
///
/// Desired rules are tagged (their comment is prefixed with the normalized
/// tag), then matched against the chain's current tagged rules by comment:
/// missing rules are inserted, drifted rules replaced by handle, and
/// extraneous tagged rules deleted. Untagged rules are never touched.
pub fn sync_tagged_rules(
    transport: &dyn NftTransport,
    chain: &str,
    desired: &[Value],
    tag: &str,
) -> Result<()> {
    let tag = normalize_tag(tag);
    let current = list_chain_rules(transport, chain)?;
    let tagged: Vec<&Value> = current
        .iter()
        .filter(|rule| rule_comment(rule).map_or(false, |c| c.starts_with(&tag)))
        .collect();

    let mut unmatched: BTreeMap<u64, &Value> = tagged
        .iter()
        .filter_map(|rule| rule.get("handle").and_then(Value::as_u64).map(|h| (h, *rule)))
        .collect();

    let mut commands = Vec::new();
    for rule in desired {
        let mut rule = rule.clone();
        let comment = match rule_comment(&rule) {
            Some(c) if c.starts_with(&tag) => c.to_owned(),
            Some(c) => format!("{} {}", tag, c),
            None => tag.clone(),
        };
        rule["comment"] = json!(comment);

        match tagged
            .iter()
            .find(|existing| rule_comment(existing) == Some(comment.as_str()))
        {
            Some(existing) => {
                if let Some(handle) = existing.get("handle").and_then(Value::as_u64) {
                    unmatched.remove(&handle);
                    if !exprs_equal(&rule, existing) {
                        rule["handle"] = json!(handle);
                        commands.push(cmd("replace", "rule", rule));
                    }
                }
            }
            None => commands.push(cmd("insert", "rule", rule)),
        }
    }

    for (handle, old) in unmatched {
        let chain = old.get("chain").and_then(Value::as_str).unwrap_or(chain);
        commands.push(cmd(
            "delete",
            "rule",
            json!({
                "family": FAMILY,
                "table": TABLE_NAME,
                "chain": chain,
                "handle": handle,
            }),
        ));
    }

    if !commands.is_empty() {
        transport.run(&commands, ErrorMode::Strict)?;
    }
    Ok(())
}

/// Delete every tagged rule of a chain. Used by the full cleanup.
pub fn remove_tagged_rules(transport: &dyn NftTransport, chain: &str, tag: &str) -> Result<()> {
    let tag = normalize_tag(tag);
    let current = match list_chain_rules(transport, chain) {
        Ok(rules) => rules,
        // The chain not existing means there is nothing to untag.
        Err(_) => return Ok(()),
    };
    let commands: Vec<Value> = current
        .iter()
        .filter(|rule| rule_comment(rule).map_or(false, |c| c.starts_with(&tag)))
        .filter_map(|rule| rule.get("handle").and_then(Value::as_u64))
        .map(|handle| {
            cmd(
                "delete",
                "rule",
                json!({
                    "family": FAMILY,
                    "table": TABLE_NAME,
                    "chain": chain,
                    "handle": handle,
                }),
            )
        })
        .collect();
    if !commands.is_empty() {
        transport.run(&commands, ErrorMode::Continue)?;
    }
    Ok(())
}

/// Snapshot of the managed table, as read from the engine.
#[derive(Debug, Default)]
pub struct TableState {
    /// Whether the table exists at all.
    pub exists: bool,
    /// Chain name to rule objects (including handles).
    pub chains: BTreeMap<String, Vec<Value>>,
    /// Map name to `element key -> verdict` rows.
    pub maps: BTreeMap<String, BTreeMap<String, Value>>,
    /// Set name to elements.
    pub sets: BTreeMap<String, Vec<String>>,
}

impl TableState {
    /// Whether a chain exists in the snapshot.
    pub fn has_chain(&self, name: &str) -> bool {
        self.chains.contains_key(name)
    }

    /// Names of all chains with the per-container prefix.
    pub fn container_chains(&self) -> Vec<String> {
        self.chains
            .keys()
            .filter(|name| name.starts_with(CONTAINER_CHAIN_PREFIX))
            .cloned()
            .collect()
    }
}

/// Read the current state of the managed table.
///
/// A missing table reads as the empty state; transport failures propagate.
pub fn read_table_state(transport: &dyn NftTransport) -> Result<TableState> {
    let output = match transport.run(&[cmd("list", "table", table_json())], ErrorMode::Strict) {
        Ok(output) => output,
        Err(e) => {
            return match e.downcast_ref::<FirewhaleError>() {
                Some(FirewhaleError::NftablesError { .. }) => Ok(TableState::default()),
                _ => Err(e),
            };
        }
    };

    let mut state = TableState::default();
    for obj in output {
        if obj.get("table").is_some() {
            state.exists = true;
        } else if let Some(chain) = obj.get("chain") {
            if let Some(name) = chain.get("name").and_then(Value::as_str) {
                state.chains.entry(name.to_owned()).or_default();
            }
        } else if let Some(rule) = obj.get("rule") {
            if let Some(chain) = rule.get("chain").and_then(Value::as_str) {
                state
                    .chains
                    .entry(chain.to_owned())
                    .or_default()
                    .push(rule.clone());
            }
        } else if let Some(map) = obj.get("map") {
            if let Some(name) = map.get("name").and_then(Value::as_str) {
                let rows = state.maps.entry(name.to_owned()).or_default();
                if let Some(elems) = map.get("elem").and_then(Value::as_array) {
                    for elem in elems {
                        if let (Some(key), Some(verdict)) = (
                            elem.get(0).and_then(Value::as_str),
                            elem.get(1),
                        ) {
                            rows.insert(key.to_owned(), verdict.clone());
                        }
                    }
                }
            }
        } else if let Some(set) = obj.get("set") {
            if let Some(name) = set.get("name").and_then(Value::as_str) {
                let elems = state.sets.entry(name.to_owned()).or_default();
                if let Some(items) = set.get("elem").and_then(Value::as_array) {
                    for item in items {
                        if let Some(ip) = item.as_str() {
                            elems.push(ip.to_owned());
                        }
                    }
                }
            }
        }
    }
    Ok(state)
}

// === Local transport ===

/// Transport backed by the local `nft` binary.
pub struct LocalTransport {
    logger: Logger,
}

impl LocalTransport {
    /// Create a local transport.
    pub fn new(logger: &Logger) -> LocalTransport {
        LocalTransport {
            logger: logger.new(o!("transport" => "local")),
        }
    }

    fn exec(&self, commands: &[Value], throw: bool) -> Result<Vec<Value>> {
        let payload = json!({ "nftables": commands });
        debug!(self.logger, "Submitting batch";
               o!("items" => commands.len()));

        let mut child = Command::new(NFT_PROGRAM)
            .args(&["-j", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| format_err!("could not attach to nft stdin"))?;
            stdin.write_all(serde_json::to_string(&payload)?.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            if throw {
                return Err(FirewhaleError::NftablesError { stdout, stderr }.into());
            }
            warn!(self.logger, "nft reported an error, continuing";
                  o!("stderr" => stderr));
            return Ok(Vec::new());
        }

        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        let parsed: Value = serde_json::from_str(&stdout)?;
        Ok(parsed
            .get("nftables")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

impl NftTransport for LocalTransport {
    fn run(&self, commands: &[Value], mode: ErrorMode) -> Result<Vec<Value>> {
        match mode {
            ErrorMode::Strict => self.exec(commands, true),
            ErrorMode::Ignore => self.exec(commands, false),
            ErrorMode::Continue => {
                let mut output = Vec::new();
                for command in commands {
                    output.extend(self.exec(::std::slice::from_ref(command), false)?);
                }
                Ok(output)
            }
        }
    }
}

// === Socket transport ===

/// Callback fired on every successful agent (re)attach.
pub type ConnectCallback = Box<dyn Fn() + Send + Sync>;

/// Daemon-side transport bridging batches to a privileged agent process
/// over a Unix-domain stream socket.
///
/// The daemon listens; the agent connects. One request is outstanding at a
/// time (requests serialize on an internal mutex), frames are length-framed
/// JSON, and a heartbeat ping runs while no requests flow. Any I/O failure
/// or timeout drops the connection; in-flight and subsequent calls fail with
/// [`AgentNotConnected`](../errors/enum.FirewhaleError.html) until the agent
/// reattaches, at which point the connect callback fires.
pub struct SocketTransport {
    conn: Mutex<Option<UnixStream>>,
    path: PathBuf,
    logger: Logger,
}

impl SocketTransport {
    /// Bind the socket and start the accept and heartbeat threads.
    pub fn bind(
        path: &Path,
        on_connect: ConnectCallback,
        logger: &Logger,
    ) -> Result<Arc<SocketTransport>> {
        if path.exists() {
            ::std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        let transport = Arc::new(SocketTransport {
            conn: Mutex::new(None),
            path: path.to_owned(),
            logger: logger.new(o!("transport" => "socket")),
        });

        let accept_transport = Arc::clone(&transport);
        thread::Builder::new()
            .name("nfagent-accept".to_owned())
            .spawn(move || accept_transport.accept_loop(listener, on_connect))?;

        let heartbeat_transport = Arc::clone(&transport);
        thread::Builder::new()
            .name("nfagent-heartbeat".to_owned())
            .spawn(move || heartbeat_transport.heartbeat_loop())?;

        Ok(transport)
    }

    fn accept_loop(&self, listener: UnixListener, on_connect: ConnectCallback) {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    {
                        let mut guard = self.conn.lock().unwrap();
                        if let Some(previous) = guard.replace(stream) {
                            info!(self.logger, "Agent already attached, dropping previous connection");
                            let _ = previous.shutdown(Shutdown::Both);
                        }
                    }
                    info!(self.logger, "Agent connected");
                    on_connect();
                }
                Err(e) => {
                    warn!(self.logger, "Accepting agent connection failed";
                          o!("error" => e.to_string()));
                }
            }
        }
    }

    fn heartbeat_loop(&self) {
        loop {
            thread::sleep(HEARTBEAT_INTERVAL);
            let mut guard = self.conn.lock().unwrap();
            if let Some(stream) = guard.as_mut() {
                let ping = AgentRequest {
                    cmd: json!("ping"),
                    throw: ErrorMode::Strict,
                };
                if let Err(e) = Self::roundtrip(stream, &ping) {
                    warn!(self.logger, "Heartbeat failed, dropping agent connection";
                          o!("error" => e.to_string()));
                    let _ = stream.shutdown(Shutdown::Both);
                    *guard = None;
                }
            }
        }
    }

    fn roundtrip(stream: &mut UnixStream, request: &AgentRequest) -> io::Result<AgentResponse> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_frame(stream, &payload)?;
        stream.set_read_timeout(Some(CALL_TIMEOUT))?;
        let frame = read_frame(stream)?;
        serde_json::from_slice(&frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn call(&self, request: &AgentRequest) -> Result<Value> {
        let mut guard = self.conn.lock().unwrap();
        let stream = match guard.as_mut() {
            Some(stream) => stream,
            None => return Err(FirewhaleError::AgentNotConnected.into()),
        };

        match Self::roundtrip(stream, request) {
            Ok(response) => match response.status {
                AgentStatus::Ok => Ok(response.data),
                AgentStatus::Error => Err(FirewhaleError::NftablesError {
                    stdout: String::new(),
                    stderr: response
                        .data
                        .as_str()
                        .map(str::to_owned)
                        .unwrap_or_else(|| response.data.to_string()),
                }
                .into()),
            },
            Err(e) => {
                warn!(self.logger, "Agent call failed, dropping connection";
                      o!("error" => e.to_string()));
                let _ = stream.shutdown(Shutdown::Both);
                *guard = None;
                Err(FirewhaleError::AgentNotConnected.into())
            }
        }
    }

    /// Whether an agent is currently attached.
    pub fn connected(&self) -> bool {
        self.conn.lock().unwrap().is_some()
    }
}

impl NftTransport for SocketTransport {
    fn run(&self, commands: &[Value], mode: ErrorMode) -> Result<Vec<Value>> {
        let request = AgentRequest {
            cmd: Value::Array(commands.to_vec()),
            throw: mode,
        };
        let data = self.call(&request)?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        let _ = ::std::fs::remove_file(&self.path);
    }
}

// === In-memory transport ===

#[derive(Debug, Clone)]
struct MemRule {
    handle: u64,
    comment: Option<String>,
    expr: Value,
}

#[derive(Debug, Default)]
struct MemState {
    table: bool,
    chains: BTreeMap<String, Vec<MemRule>>,
    maps: BTreeMap<String, BTreeMap<String, Value>>,
    sets: BTreeMap<String, Vec<String>>,
    next_handle: u64,
}

/// Transport emulating enough of the nftables engine for tests: tables,
/// chains, rules (with handles), verdict maps, sets, elements, and the
/// `list` commands the daemon issues. Mutation commands are journaled so
/// tests can assert that converged reconciles stay quiet.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemState>,
    journal: Mutex<Vec<Value>>,
}

impl MemoryTransport {
    /// An empty engine.
    pub fn new() -> MemoryTransport {
        MemoryTransport::default()
    }

    /// An engine pre-seeded with the `filter` table and Docker's ingress
    /// chain, i.e. what a Docker host looks like before firewhale runs.
    pub fn with_docker_user() -> MemoryTransport {
        let transport = MemoryTransport::new();
        {
            let mut state = transport.state.lock().unwrap();
            state.table = true;
            state.chains.insert(DOCKER_USER_CHAIN.to_owned(), Vec::new());
        }
        transport
    }

    /// All mutation commands submitted so far.
    pub fn mutations(&self) -> Vec<Value> {
        self.journal.lock().unwrap().clone()
    }

    /// Forget the journal (state is kept).
    pub fn clear_journal(&self) {
        self.journal.lock().unwrap().clear();
    }

    /// Names of all chains.
    pub fn chain_names(&self) -> Vec<String> {
        self.state.lock().unwrap().chains.keys().cloned().collect()
    }

    /// The rules of a chain as `(comment, expr)` pairs.
    pub fn chain_rules(&self, chain: &str) -> Option<Vec<(Option<String>, Value)>> {
        self.state
            .lock()
            .unwrap()
            .chains
            .get(chain)
            .map(|rules| {
                rules
                    .iter()
                    .map(|rule| (rule.comment.clone(), rule.expr.clone()))
                    .collect()
            })
    }

    /// The rows of a verdict map.
    pub fn map_rows(&self, map: &str) -> Option<BTreeMap<String, Value>> {
        self.state.lock().unwrap().maps.get(map).cloned()
    }

    /// The elements of a set.
    pub fn set_elements(&self, set: &str) -> Option<Vec<String>> {
        self.state.lock().unwrap().sets.get(set).cloned()
    }

    /// Pre-seed a chain, e.g. an orphan from a previous daemon run.
    pub fn seed_chain(&self, chain: &str) {
        let mut state = self.state.lock().unwrap();
        state.table = true;
        state.chains.entry(chain.to_owned()).or_default();
    }

    /// Pre-seed a verdict-map row.
    pub fn seed_map_row(&self, map: &str, key: &str, verdict: Value) {
        let mut state = self.state.lock().unwrap();
        state.table = true;
        state
            .maps
            .entry(map.to_owned())
            .or_default()
            .insert(key.to_owned(), verdict);
    }

    fn apply(&self, state: &mut MemState, command: &Value) -> Result<Vec<Value>> {
        let (verb, body) = match command.as_object().and_then(|obj| obj.iter().next()) {
            Some((verb, body)) => (verb.as_str(), body),
            None => return Err(format_err!("malformed command: {}", command)),
        };
        let (kind, object) = match body.as_object().and_then(|obj| obj.iter().next()) {
            Some((kind, object)) => (kind.as_str(), object),
            None => return Err(format_err!("malformed command object: {}", command)),
        };

        if verb != "list" {
            self.journal.lock().unwrap().push(command.clone());
        }

        let name = object
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        match (verb, kind) {
            ("add", "table") => {
                state.table = true;
                Ok(Vec::new())
            }
            ("delete", "table") => {
                *state = MemState::default();
                Ok(Vec::new())
            }
            ("add", "chain") => {
                if !state.table {
                    return Err(engine_error("no such table"));
                }
                state.chains.entry(name).or_default();
                Ok(Vec::new())
            }
            ("flush", "chain") => match state.chains.get_mut(&name) {
                Some(rules) => {
                    rules.clear();
                    Ok(Vec::new())
                }
                None => Err(engine_error("no such chain")),
            },
            ("delete", "chain") => match state.chains.remove(&name) {
                Some(_) => Ok(Vec::new()),
                None => Err(engine_error("no such chain")),
            },
            ("add", "rule") | ("insert", "rule") => {
                let chain = object
                    .get("chain")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                state.next_handle += 1;
                let handle = state.next_handle;
                let rules = state
                    .chains
                    .get_mut(&chain)
                    .ok_or_else(|| engine_error("no such chain"))?;
                let rule = MemRule {
                    handle,
                    comment: object
                        .get("comment")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    expr: object.get("expr").cloned().unwrap_or(Value::Null),
                };
                if verb == "insert" {
                    rules.insert(0, rule);
                } else {
                    rules.push(rule);
                }
                Ok(Vec::new())
            }
            ("replace", "rule") => {
                let chain = object
                    .get("chain")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let handle = object.get("handle").and_then(Value::as_u64).unwrap_or(0);
                let rules = state
                    .chains
                    .get_mut(&chain)
                    .ok_or_else(|| engine_error("no such chain"))?;
                match rules.iter_mut().find(|rule| rule.handle == handle) {
                    Some(rule) => {
                        rule.expr = object.get("expr").cloned().unwrap_or(Value::Null);
                        rule.comment = object
                            .get("comment")
                            .and_then(Value::as_str)
                            .map(str::to_owned);
                        Ok(Vec::new())
                    }
                    None => Err(engine_error("no rule with that handle")),
                }
            }
            ("delete", "rule") => {
                let chain = object
                    .get("chain")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let handle = object.get("handle").and_then(Value::as_u64).unwrap_or(0);
                let rules = state
                    .chains
                    .get_mut(&chain)
                    .ok_or_else(|| engine_error("no such chain"))?;
                let before = rules.len();
                rules.retain(|rule| rule.handle != handle);
                if rules.len() == before {
                    return Err(engine_error("no rule with that handle"));
                }
                Ok(Vec::new())
            }
            ("add", "map") => {
                if !state.table {
                    return Err(engine_error("no such table"));
                }
                state.maps.entry(name).or_default();
                Ok(Vec::new())
            }
            ("flush", "map") => match state.maps.get_mut(&name) {
                Some(rows) => {
                    rows.clear();
                    Ok(Vec::new())
                }
                None => Err(engine_error("no such map")),
            },
            ("delete", "map") => match state.maps.remove(&name) {
                Some(_) => Ok(Vec::new()),
                None => Err(engine_error("no such map")),
            },
            ("add", "set") => {
                if !state.table {
                    return Err(engine_error("no such table"));
                }
                let elements = state.sets.entry(name).or_default();
                if let Some(items) = object.get("elem").and_then(Value::as_array) {
                    for item in items {
                        if let Some(ip) = item.as_str() {
                            if !elements.contains(&ip.to_owned()) {
                                elements.push(ip.to_owned());
                            }
                        }
                    }
                }
                Ok(Vec::new())
            }
            ("flush", "set") => match state.sets.get_mut(&name) {
                Some(elements) => {
                    elements.clear();
                    Ok(Vec::new())
                }
                None => Err(engine_error("no such set")),
            },
            ("delete", "set") => match state.sets.remove(&name) {
                Some(_) => Ok(Vec::new()),
                None => Err(engine_error("no such set")),
            },
            ("add", "element") | ("delete", "element") => {
                let items = object
                    .get("elem")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if let Some(rows) = state.maps.get_mut(&name) {
                    for item in &items {
                        if verb == "add" {
                            match (item.get(0).and_then(Value::as_str), item.get(1)) {
                                (Some(key), Some(verdict)) => {
                                    rows.insert(key.to_owned(), verdict.clone());
                                }
                                _ => return Err(engine_error("malformed map element")),
                            }
                        } else {
                            let key = item
                                .get(0)
                                .and_then(Value::as_str)
                                .or_else(|| item.as_str())
                                .unwrap_or_default();
                            if rows.remove(key).is_none() {
                                return Err(engine_error("no such element"));
                            }
                        }
                    }
                    Ok(Vec::new())
                } else if let Some(elements) = state.sets.get_mut(&name) {
                    for item in &items {
                        let ip = item.as_str().unwrap_or_default().to_owned();
                        if verb == "add" {
                            if !elements.contains(&ip) {
                                elements.push(ip);
                            }
                        } else {
                            let before = elements.len();
                            elements.retain(|existing| *existing != ip);
                            if elements.len() == before {
                                return Err(engine_error("no such element"));
                            }
                        }
                    }
                    Ok(Vec::new())
                } else {
                    Err(engine_error("no such set or map"))
                }
            }
            ("list", "table") => {
                if !state.table {
                    return Err(engine_error("no such table"));
                }
                let mut output = vec![json!({ "table": table_json() })];
                for (chain, rules) in &state.chains {
                    output.push(json!({ "chain": chain_json(chain) }));
                    for rule in rules {
                        output.push(mem_rule_json(chain, rule));
                    }
                }
                for (map, rows) in &state.maps {
                    output.push(mem_map_json(map, rows));
                }
                for (set, elements) in &state.sets {
                    output.push(mem_set_json(set, elements));
                }
                Ok(output)
            }
            ("list", "chain") => match state.chains.get(&name) {
                Some(rules) => {
                    let mut output = vec![json!({ "chain": chain_json(&name) })];
                    for rule in rules {
                        output.push(mem_rule_json(&name, rule));
                    }
                    Ok(output)
                }
                None => Err(engine_error("no such chain")),
            },
            ("list", "map") => match state.maps.get(&name) {
                Some(rows) => Ok(vec![mem_map_json(&name, rows)]),
                None => Err(engine_error("no such map")),
            },
            _ => Err(format_err!("unsupported command: {}", command)),
        }
    }
}

fn engine_error(message: &str) -> failure::Error {
    FirewhaleError::NftablesError {
        stdout: String::new(),
        stderr: format!("Error: {}", message),
    }
    .into()
}

fn mem_rule_json(chain: &str, rule: &MemRule) -> Value {
    let mut obj = json!({
        "rule": {
            "family": FAMILY,
            "table": TABLE_NAME,
            "chain": chain,
            "handle": rule.handle,
            "expr": rule.expr,
        }
    });
    if let Some(comment) = &rule.comment {
        obj["rule"]["comment"] = json!(comment);
    }
    obj
}

fn mem_map_json(map: &str, rows: &BTreeMap<String, Value>) -> Value {
    let elem: Vec<Value> = rows
        .iter()
        .map(|(key, verdict)| json!([key, verdict]))
        .collect();
    json!({
        "map": {
            "family": FAMILY,
            "table": TABLE_NAME,
            "name": map,
            "type": "ipv4_addr",
            "map": "verdict",
            "elem": elem,
        }
    })
}

fn mem_set_json(set: &str, elements: &[String]) -> Value {
    json!({
        "set": {
            "family": FAMILY,
            "table": TABLE_NAME,
            "name": set,
            "type": "ipv4_addr",
            "elem": elements,
        }
    })
}

impl NftTransport for MemoryTransport {
    fn run(&self, commands: &[Value], mode: ErrorMode) -> Result<Vec<Value>> {
        let mut state = self.state.lock().unwrap();
        let mut output = Vec::new();
        for command in commands {
            match self.apply(&mut state, command) {
                Ok(mut produced) => output.append(&mut produced),
                Err(e) => match mode {
                    ErrorMode::Strict => return Err(e),
                    ErrorMode::Ignore | ErrorMode::Continue => continue,
                },
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::Drain;
    use std::sync::mpsc;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard.fuse(), o!())
    }

    #[test]
    fn socket_transport_round_trips_one_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nfagent.sock");

        let (connected_tx, connected_rx) = mpsc::channel();
        let transport = SocketTransport::bind(
            &path,
            Box::new(move || {
                let _ = connected_tx.send(());
            }),
            &test_logger(),
        )
        .unwrap();

        let agent_path = path.clone();
        let agent = thread::spawn(move || {
            let mut stream = UnixStream::connect(&agent_path).unwrap();
            let frame = read_frame(&mut stream).unwrap();
            let request: AgentRequest = serde_json::from_slice(&frame).unwrap();
            assert_eq!(request.throw, ErrorMode::Strict);
            assert!(request.cmd.is_array());
            let response = AgentResponse {
                status: AgentStatus::Ok,
                data: json!([{ "echo": true }]),
            };
            write_frame(&mut stream, &serde_json::to_vec(&response).unwrap()).unwrap();
        });

        connected_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("agent never connected");
        let output = transport
            .run(&[cmd("add", "table", table_json())], ErrorMode::Strict)
            .unwrap();
        assert_eq!(output, vec![json!({ "echo": true })]);
        agent.join().unwrap();
    }

    #[test]
    fn socket_transport_fails_fast_without_agent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nfagent.sock");
        let transport =
            SocketTransport::bind(&path, Box::new(|| {}), &test_logger()).unwrap();

        let err = transport
            .run(&[cmd("add", "table", table_json())], ErrorMode::Strict)
            .unwrap_err();
        match err.downcast_ref::<FirewhaleError>() {
            Some(FirewhaleError::AgentNotConnected) => {}
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn tag_normalization() {
        assert_eq!(normalize_tag("firewhale"), "[firewhale]");
        assert_eq!(normalize_tag("[firewhale]"), "[firewhale]");
    }

    #[test]
    fn container_id_extraction() {
        assert_eq!(
            chain_container_id("firewhale-container-0123456789abcdef-outbound"),
            Some("0123456789abcdef")
        );
        assert_eq!(
            chain_container_id("firewhale-container-0123456789abcdef"),
            Some("0123456789abcdef")
        );
        assert_eq!(chain_container_id("DOCKER-USER"), None);
    }

    #[test]
    fn error_mode_wire_format() {
        assert_eq!(serde_json::to_value(&ErrorMode::Strict).unwrap(), json!(true));
        assert_eq!(serde_json::to_value(&ErrorMode::Ignore).unwrap(), json!(false));
        assert_eq!(
            serde_json::to_value(&ErrorMode::Continue).unwrap(),
            json!("continue")
        );

        assert_eq!(
            serde_json::from_value::<ErrorMode>(json!(true)).unwrap(),
            ErrorMode::Strict
        );
        assert_eq!(
            serde_json::from_value::<ErrorMode>(json!("continue")).unwrap(),
            ErrorMode::Continue
        );
        assert!(serde_json::from_value::<ErrorMode>(json!("nope")).is_err());
    }

    #[test]
    fn frame_roundtrip() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let payload = br#"{"cmd":"ping","throw":true}"#.to_vec();
        write_frame(&mut a, &payload).unwrap();
        assert_eq!(read_frame(&mut b).unwrap(), payload);
    }

    #[test]
    fn expr_normalization_treats_counters_and_sets_equal() {
        let desired = json!({
            "expr": [
                { "match": { "op": "in", "left": { "ct": { "key": "state" } },
                             "right": ["established", "related"] } },
                { "counter": null },
                { "return": null },
            ]
        });
        let listed = json!({
            "expr": [
                { "match": { "op": "in", "left": { "ct": { "key": "state" } },
                             "right": { "set": ["related", "established"] } } },
                { "counter": { "packets": 12, "bytes": 345 } },
                { "return": null },
            ]
        });
        assert!(exprs_equal(&desired, &listed));
    }

    #[test]
    fn memory_transport_chains_and_elements() {
        let transport = MemoryTransport::with_docker_user();
        transport
            .run(
                &[
                    cmd("add", "chain", chain_json("firewhale")),
                    cmd("add", "map", json!({
                        "family": FAMILY, "table": TABLE_NAME,
                        "name": "firewhale-outbound",
                        "type": "ipv4_addr", "map": "verdict",
                    })),
                    cmd("add", "element", json!({
                        "family": FAMILY, "table": TABLE_NAME,
                        "name": "firewhale-outbound",
                        "elem": [["10.0.0.5", { "jump": { "target": "x" } }]],
                    })),
                ],
                ErrorMode::Strict,
            )
            .unwrap();

        let rows = transport.map_rows("firewhale-outbound").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows.contains_key("10.0.0.5"));

        let state = read_table_state(&transport).unwrap();
        assert!(state.exists);
        assert!(state.has_chain("firewhale"));
        assert!(state.maps["firewhale-outbound"].contains_key("10.0.0.5"));
    }

    #[test]
    fn memory_transport_strict_vs_continue() {
        let transport = MemoryTransport::with_docker_user();
        let bad = cmd("delete", "chain", chain_json("missing"));
        assert!(transport.run(&[bad.clone()], ErrorMode::Strict).is_err());
        assert!(transport.run(&[bad], ErrorMode::Continue).is_ok());
    }

    #[test]
    fn sync_tagged_rules_is_idempotent_and_prunes_extras() {
        let transport = MemoryTransport::with_docker_user();
        // A stale tagged rule and a foreign rule are already present.
        transport
            .run(
                &[
                    cmd("add", "rule", rule_json(
                        DOCKER_USER_CHAIN,
                        json!([{ "jump": { "target": "stale" } }]),
                        Some("[firewhale] old bounce"),
                    )),
                    cmd("add", "rule", rule_json(
                        DOCKER_USER_CHAIN,
                        json!([{ "accept": null }]),
                        None,
                    )),
                ],
                ErrorMode::Strict,
            )
            .unwrap();

        let desired = vec![rule_json(
            DOCKER_USER_CHAIN,
            json!([{ "jump": { "target": FIREWHALE_CHAIN } }]),
            Some("Jump to firewhale chain"),
        )];
        sync_tagged_rules(&transport, DOCKER_USER_CHAIN, &desired, RULE_TAG).unwrap();

        let rules = transport.chain_rules(DOCKER_USER_CHAIN).unwrap();
        let tagged: Vec<_> = rules
            .iter()
            .filter(|(comment, _)| {
                comment.as_ref().map_or(false, |c| c.starts_with(RULE_TAG))
            })
            .collect();
        assert_eq!(tagged.len(), 1);
        // The foreign rule survives.
        assert_eq!(rules.len(), 2);

        // Converged: a second sync emits nothing.
        transport.clear_journal();
        sync_tagged_rules(&transport, DOCKER_USER_CHAIN, &desired, RULE_TAG).unwrap();
        assert!(transport.mutations().is_empty());
    }
}
