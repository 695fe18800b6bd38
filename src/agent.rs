// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The privileged agent companion.
//!
//! When the daemon runs sandboxed it cannot touch the kernel firewall
//! itself; this small process runs on the host with the necessary
//! capability, connects to the daemon's Unix socket, and executes whatever
//! batches arrive over the wire. It reconnects with a fixed backoff and goes
//! away cleanly on termination signals.

use std::io::{self, Read};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use slog::{debug, info, o, warn, Logger};

use crate::errors::Result;
use crate::nftables::{
    write_frame, AgentRequest, AgentResponse, AgentStatus, LocalTransport, NftTransport,
    MAX_FRAME_LEN,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Run the agent until a termination signal arrives.
pub fn run(socket_path: &Path, logger: &Logger) -> Result<()> {
    let logger = logger.new(o!("process" => "nfagent"));
    let transport = LocalTransport::new(&logger);

    let term = Arc::new(AtomicBool::new(false));
    let signals =
        signal_hook::iterator::Signals::new(&[signal_hook::SIGINT, signal_hook::SIGTERM])?;
    let term_flag = Arc::clone(&term);
    thread::spawn(move || {
        if signals.forever().next().is_some() {
            term_flag.store(true, Ordering::SeqCst);
        }
    });

    info!(logger, "Agent starting";
          o!("socket" => socket_path.display().to_string()));

    while !term.load(Ordering::SeqCst) {
        match UnixStream::connect(socket_path) {
            Ok(stream) => {
                info!(logger, "Connected to daemon");
                if let Err(e) = serve_stream(stream, &transport, &term) {
                    warn!(logger, "Connection to daemon lost";
                          o!("error" => e.to_string()));
                }
            }
            Err(e) => {
                debug!(logger, "Daemon socket not reachable";
                       o!("error" => e.to_string()));
            }
        }
        if term.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(RECONNECT_DELAY);
    }

    info!(logger, "Agent stopped");
    Ok(())
}

fn serve_stream(
    mut stream: UnixStream,
    transport: &LocalTransport,
    term: &AtomicBool,
) -> io::Result<()> {
    stream.set_read_timeout(Some(IDLE_POLL))?;
    loop {
        if term.load(Ordering::SeqCst) {
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(());
        }
        let frame = match read_request_frame(&mut stream)? {
            Some(frame) => frame,
            None => continue,
        };
        let response = match serde_json::from_slice::<AgentRequest>(&frame) {
            Ok(request) => handle_request(&request, transport),
            Err(e) => AgentResponse {
                status: AgentStatus::Error,
                data: json!(format!("malformed request: {}", e)),
            },
        };
        let payload = serde_json::to_vec(&response)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_frame(&mut stream, &payload)?;
    }
}

/// Read one frame, returning `None` when the idle poll expired before any
/// byte arrived. Once a header byte was seen the frame is read to
/// completion.
fn read_request_frame(stream: &mut UnixStream) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match stream.read(&mut header[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "daemon closed the connection",
                ));
            }
            Ok(n) => filled += n,
            Err(ref e) if is_timeout(e) && filled == 0 => return Ok(None),
            Err(ref e) if is_timeout(e) => continue,
            Err(e) => return Err(e),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match stream.read(&mut payload[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "daemon closed the connection mid-frame",
                ));
            }
            Ok(n) => filled += n,
            Err(ref e) if is_timeout(e) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Some(payload))
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn handle_request(request: &AgentRequest, transport: &LocalTransport) -> AgentResponse {
    if request.cmd == json!("ping") {
        return AgentResponse {
            status: AgentStatus::Ok,
            data: Value::Null,
        };
    }
    let commands = match request.cmd.as_array() {
        Some(commands) => commands,
        None => {
            return AgentResponse {
                status: AgentStatus::Error,
                data: json!("cmd must be a command array or 'ping'"),
            };
        }
    };
    match transport.run(commands, request.throw) {
        Ok(output) => AgentResponse {
            status: AgentStatus::Ok,
            data: Value::Array(output),
        },
        Err(e) => AgentResponse {
            status: AgentStatus::Error,
            data: json!(e.to_string()),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nftables::{read_frame, ErrorMode};
    use slog::Drain;

    fn logger() -> Logger {
        Logger::root(slog::Discard.fuse(), o!())
    }

    #[test]
    fn ping_is_answered_without_touching_the_engine() {
        let transport = LocalTransport::new(&logger());
        let response = handle_request(
            &AgentRequest {
                cmd: json!("ping"),
                throw: ErrorMode::Strict,
            },
            &transport,
        );
        assert_eq!(response.status, AgentStatus::Ok);
    }

    #[test]
    fn non_array_commands_are_rejected() {
        let transport = LocalTransport::new(&logger());
        let response = handle_request(
            &AgentRequest {
                cmd: json!({ "bogus": true }),
                throw: ErrorMode::Strict,
            },
            &transport,
        );
        assert_eq!(response.status, AgentStatus::Error);
    }

    #[test]
    fn serve_stream_answers_pings_over_the_wire() {
        let (mut daemon_end, agent_end) = UnixStream::pair().unwrap();
        let term = Arc::new(AtomicBool::new(false));

        let worker_term = Arc::clone(&term);
        let worker = thread::spawn(move || {
            let transport = LocalTransport::new(&logger());
            let _ = serve_stream(agent_end, &transport, &worker_term);
        });

        let request = serde_json::to_vec(&AgentRequest {
            cmd: json!("ping"),
            throw: ErrorMode::Strict,
        })
        .unwrap();
        write_frame(&mut daemon_end, &request).unwrap();

        let response: AgentResponse =
            serde_json::from_slice(&read_frame(&mut daemon_end).unwrap()).unwrap();
        assert_eq!(response.status, AgentStatus::Ok);

        term.store(true, Ordering::SeqCst);
        drop(daemon_end);
        worker.join().unwrap();
    }
}
