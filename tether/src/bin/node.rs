//! Tether node.
//!
//! Runs a runtime with one `main` dispatch loop hosting a heartbeat
//! component that pings every loop on a timer. Useful to check IPC settings
//! and watchdog behavior on a target.
//!
//! # Usage
//!
//! ```sh
//! tether-node process_id=100 ipc_application_port=5000 \
//!     peer=200@127.0.0.1:5001 ping_ms=500 run_for=10
//! ```
//!
//! Every `key=value` parameter not listed below goes to
//! [`RuntimeConfig::from_params`].
//!
//! - `peer=PID@ADDR:PORT`: a known peer process, may repeat
//! - `ping_ms=N`: heartbeat period (default 1000)
//! - `run_for=SECS`: exit after this long (default: run until killed)

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tether::net::Endpoint;
use tether::{
    Component, ComponentFactory, ConfigError, Context, Dispatcher, ProcessId, Runtime,
    RuntimeConfig, ShutdownBlocker, ThreadSpec, Timer, TimerCount,
};

const DEFAULT_PING_MS: u64 = 1000;

#[derive(Debug, thiserror::Error)]
enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Runtime(#[from] tether::RuntimeError),
    #[error(transparent)]
    Send(#[from] tether::SendError),
}

struct NodeArgs {
    config: RuntimeConfig,
    peers: Vec<(ProcessId, Endpoint)>,
    ping: Duration,
    run_for: Option<Duration>,
}

struct Heartbeat {
    timer: Rc<Timer>,
    period: Duration,
}

impl Component for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn is_root(&self) -> bool {
        true
    }

    fn boot(&self, message: &str) {
        eprintln!("tether-node: boot ({message})");
        if let Err(e) = self.timer.start(self.period, TimerCount::Continuous) {
            eprintln!("tether-node: heartbeat not started: {e}");
        }
    }

    fn shutdown(&self, _message: &str, _blocker: ShutdownBlocker) {
        let _ = self.timer.stop();
    }
}

fn heartbeat(period: Duration) -> ComponentFactory {
    Arc::new(move |dispatcher: &Dispatcher| {
        let runtime = dispatcher.runtime().clone();
        let timer = Timer::new(dispatcher, "heartbeat", move |_| {
            let _ = runtime.ping(Context::BROADCAST, "heartbeat");
        });
        Rc::new(Heartbeat { timer, period }) as Rc<dyn Component>
    })
}

fn main() {
    tether::init_tracing();
    if let Err(e) = run() {
        eprintln!("tether-node: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), NodeError> {
    let args = parse_args(std::env::args().skip(1))?;

    let runtime = Runtime::builder(args.config)
        .thread(ThreadSpec::new("main").component(heartbeat(args.ping)))
        .build()?;
    runtime.start()?;
    for (pid, endpoint) in args.peers {
        runtime.add_peer(pid, endpoint)?;
    }
    eprintln!(
        "tether-node: process {} ready, ipc {:?}",
        runtime.process_id(),
        runtime.ipc_endpoint()
    );
    runtime.boot("tether-node")?;

    match args.run_for {
        Some(duration) => {
            std::thread::sleep(duration);
            eprintln!("tether-node: shutting down...");
            runtime.shutdown("run_for elapsed")?;
        }
        None => loop {
            std::thread::sleep(Duration::from_secs(3600));
        },
    }
    runtime.wait();
    eprintln!("tether-node: stopped");
    Ok(())
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<NodeArgs, ConfigError> {
    let mut params = Vec::new();
    let mut peers = Vec::new();
    let mut ping = Duration::from_millis(DEFAULT_PING_MS);
    let mut run_for = None;

    for arg in args {
        let Some((key, value)) = arg.trim_start_matches('-').split_once('=') else {
            params.push(arg);
            continue;
        };
        let invalid = || ConfigError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
        };
        match key {
            "peer" => {
                let (pid, endpoint) = value.split_once('@').ok_or_else(invalid)?;
                let pid = pid.parse().map_err(|_| invalid())?;
                let endpoint: Endpoint = endpoint.parse().map_err(|_| invalid())?;
                peers.push((ProcessId(pid), endpoint));
            }
            "ping_ms" => ping = Duration::from_millis(value.parse().map_err(|_| invalid())?),
            "run_for" => run_for = Some(Duration::from_secs(value.parse().map_err(|_| invalid())?)),
            _ => params.push(arg.clone()),
        }
    }

    Ok(NodeArgs {
        config: RuntimeConfig::from_params(params)?,
        peers,
        ping,
        run_for,
    })
}
