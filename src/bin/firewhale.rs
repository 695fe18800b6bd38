// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

use std::env;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::thread;

use clap::{crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use crossbeam_channel::bounded;
use failure::format_err;
use shiplift::Docker;
use slog::{error, info, o, Logger};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

use firewhale::agent;
use firewhale::docker::{spawn_event_thread, swarm_active, DockerSource};
use firewhale::errors::Result;
use firewhale::ipdir::{IpDirectory, LocalDirectory, RedisDirectory};
use firewhale::nftables::{LocalTransport, NftTransport, SocketTransport, DEFAULT_SOCKET_PATH};
use firewhale::process::full_cleanup;
use firewhale::serve::{Controller, WorkItem};
use firewhale::util::node_id;

const DEFAULT_REDIS_URL: &str = "redis://redis:6379/0";

fn main() {
    let matches = App::new("firewhale")
        .version(crate_version!())
        .about("Label-driven container firewall daemon")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .takes_value(true)
                .default_value("info")
                .possible_values(&["trace", "debug", "info", "warning", "error", "critical"])
                .global(true)
                .help("Verbosity of the log output"),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Start the firewhale daemon")
                .arg(
                    Arg::with_name("nfagent")
                        .long("nfagent")
                        .min_values(0)
                        .max_values(1)
                        .value_name("on|off")
                        .help(
                            "Bridge firewall batches through the privileged agent \
                             [default: on inside a cluster]",
                        ),
                )
                .arg(
                    Arg::with_name("redis")
                        .long("redis")
                        .min_values(0)
                        .max_values(1)
                        .value_name("URL|on|off")
                        .help(
                            "Use the shared IP directory ('on' reads REDIS_URL) \
                             [default: on inside a cluster]",
                        ),
                )
                .arg(
                    Arg::with_name("socket-path")
                        .long("socket-path")
                        .takes_value(true)
                        .default_value(DEFAULT_SOCKET_PATH)
                        .help("Unix socket the agent connects to"),
                ),
        )
        .subcommand(
            SubCommand::with_name("nfagent")
                .about(
                    "Run firewhale's privileged agent, executing firewall batches \
                     on behalf of a sandboxed daemon",
                )
                .arg(
                    Arg::with_name("socket-path")
                        .long("socket-path")
                        .takes_value(true)
                        .default_value(DEFAULT_SOCKET_PATH)
                        .help("Unix socket of the daemon"),
                ),
        )
        .subcommand(SubCommand::with_name("full-cleanup").about(
            "Remove every firewhale chain, map, set and tagged rule. Must run \
             with host networking and NET_ADMIN, without the agent",
        ))
        .get_matches();

    let logger = match build_logger(matches.value_of("log-level").unwrap_or("info")) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("firewhale: could not set up logging: {}", e);
            exit(1);
        }
    };

    let result = match matches.subcommand() {
        ("run", Some(sub)) => run_daemon(sub, &logger),
        ("nfagent", Some(sub)) => agent::run(
            Path::new(sub.value_of("socket-path").unwrap_or(DEFAULT_SOCKET_PATH)),
            &logger,
        ),
        ("full-cleanup", _) => {
            let transport = LocalTransport::new(&logger);
            full_cleanup(&transport, &logger)
        }
        _ => unreachable!("clap requires a subcommand"),
    };

    if let Err(e) = result {
        error!(logger, "Exiting with failure"; o!("error" => format!("{:?}", e)));
        exit(1);
    }
}

fn build_logger(level: &str) -> ::std::result::Result<Logger, sloggers::Error> {
    let severity = match level {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "warning" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    };
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);
    builder.build()
}

/// A `--flag[=on|off]` option: absent, explicitly on, or explicitly off.
fn tri_state(matches: &ArgMatches, name: &str) -> Option<bool> {
    if !matches.is_present(name) {
        return None;
    }
    match matches.value_of(name) {
        Some("off") | Some("false") => Some(false),
        _ => Some(true),
    }
}

fn redis_url_from_env() -> String {
    env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_owned())
}

fn run_daemon(matches: &ArgMatches, logger: &Logger) -> Result<()> {
    let docker = Docker::new();
    let cluster = swarm_active(&docker, logger);

    let nfagent = tri_state(matches, "nfagent").unwrap_or(cluster);
    let redis_url = if matches.is_present("redis") {
        match matches.value_of("redis") {
            Some("off") | Some("false") => None,
            Some("on") | Some("true") | None => Some(redis_url_from_env()),
            Some(url) => Some(url.to_owned()),
        }
    } else if cluster {
        Some(redis_url_from_env())
    } else {
        None
    };

    let mode = match (nfagent, redis_url.is_some()) {
        (true, true) => "cluster (redis + nfagent)",
        (true, false) => "local + nfagent",
        (false, true) => "redis",
        (false, false) => "local",
    };
    info!(logger, "Starting firewhale"; o!("mode" => mode));

    // Producers block when the dispatcher falls behind.
    let (queue_tx, queue_rx) = bounded(1024);

    let transport: Arc<dyn NftTransport> = if nfagent {
        let path = PathBuf::from(
            matches
                .value_of("socket-path")
                .unwrap_or(DEFAULT_SOCKET_PATH),
        );
        let connect_tx = queue_tx.clone();
        SocketTransport::bind(
            &path,
            Box::new(move || {
                let _ = connect_tx.send(WorkItem::TransportConnected);
            }),
            logger,
        )?
    } else {
        // The in-process transport is attached from the start; enqueueing
        // the connected event here makes cold start and agent reattach share
        // one reconcile path.
        let transport = Arc::new(LocalTransport::new(logger));
        let _ = queue_tx.send(WorkItem::TransportConnected);
        transport
    };

    let directory: Box<dyn IpDirectory> = match &redis_url {
        Some(url) => {
            url::Url::parse(url).map_err(|e| format_err!("invalid redis URL '{}': {}", url, e))?;
            let node = node_id();
            info!(logger, "Using shared IP directory"; o!("node" => node.clone()));
            let delta_tx = queue_tx.clone();
            let reconnect_tx = queue_tx.clone();
            Box::new(RedisDirectory::new(
                url,
                Arc::clone(&transport),
                &node,
                Box::new(move |service, ip| {
                    let _ = delta_tx.send(WorkItem::ServiceDelta { service, ip });
                }),
                Box::new(move || {
                    let _ = reconnect_tx.send(WorkItem::StoreReconnected);
                }),
                logger,
            )?)
        }
        None => Box::new(LocalDirectory::new(Arc::clone(&transport), logger)),
    };

    let signals =
        signal_hook::iterator::Signals::new(&[signal_hook::SIGINT, signal_hook::SIGTERM])?;
    let signal_tx = queue_tx.clone();
    thread::spawn(move || {
        if signals.forever().next().is_some() {
            let _ = signal_tx.send(WorkItem::Stop);
        }
    });

    spawn_event_thread(
        docker.clone(),
        queue_tx.clone(),
        logger.new(o!("thread" => "docker-events")),
    )?;
    info!(logger, "Subscribed to container lifecycle events");

    let source = DockerSource::new(docker, logger);
    let mut controller = Controller::new(
        Box::new(source),
        transport,
        directory,
        queue_rx,
        logger,
    );
    controller.prime_directory()?;
    controller.run()
}
