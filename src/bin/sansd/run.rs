// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Implements the `run` command (i.e., running the forwarder).

use std::fmt::Write;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use env_logger::Env;
use log::{error, info};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio::runtime::{self, Runtime};

use sans::forward::{Forwarder, Upstream};
use sans::io::{TokioIoProvider, TokioShutdownController};
use sans::listener::{Listener, Probing};
use sans::route::RouteTable;

use crate::args::RunArgs;
use crate::config::{self, Config};

/// Runs the forwarder.
pub fn run(args: RunArgs) {
    let default_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::init_from_env(Env::new().default_filter_or(default_filter));

    if let Err(e) = try_running(args) {
        let mut message = String::from("Failed to run:");
        for (i, cause) in e.chain().enumerate() {
            write!(message, "\n[{}] {}", i + 1, cause).unwrap();
        }
        message.push_str("\nExiting with failure.");
        error!("{}", message);
        process::exit(1);
    }
    info!("Exiting with success.");
}

fn try_running(run_args: RunArgs) -> Result<()> {
    info!(
        "Sans daemon v{}.{}.{} starting.",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR"),
        env!("CARGO_PKG_VERSION_PATCH"),
    );

    // Get the configuration, either from the file system or from the
    // command line arguments, as appropriate.
    let config = if let Some(ref config_path) = run_args.config {
        info!("Loading the configuration from {}.", config_path.display());
        config::load_from_path(config_path).context("failed to load the configuration")?
    } else {
        info!("Loading the configuration from the command line.");
        config::load_from_args(run_args).context("failed to load the configuration")?
    };

    let runtime = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the Tokio runtime")?;

    // Set up signal handling.
    let mut signals = set_up_signal_handling().context("failed to set up signal handling")?;

    let (listener, controller) = start(&runtime, &config)?;
    info!("Set-up is complete; forwarding queries.");

    // Process incoming signals.
    for signal in signals.forever() {
        match signal {
            s @ (SIGINT | SIGTERM) => {
                let name = match s {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    _ => unreachable!(),
                };
                info!("Received {}; shutting down.", name);
                break;
            }
            SIGHUP => {
                info!(
                    "Received SIGHUP; statistics: {}.",
                    listener.forwarder().stats().snapshot(),
                );
            }
            _ => unreachable!(),
        }
    }

    // Shut down the forwarder. Queries in flight are answered first.
    runtime.block_on(controller.shut_down());
    info!(
        "Shutdown complete; statistics: {}.",
        listener.forwarder().stats().snapshot(),
    );
    Ok(())
}

/// Binds every socket and starts the I/O provider on `runtime`.
fn start(runtime: &Runtime, config: &Config) -> Result<(Arc<Listener>, TokioShutdownController)> {
    runtime.block_on(async {
        let forwarder = Forwarder::bind((&config.forwarding).into(), (&config.validation).into())
            .await
            .context("failed to bind the upstream sockets")?;

        let mut listener = Listener::new(forwarder, (&config.upstreams).into());
        listener.set_timeout_policy(config.forwarding.timeout_policy.into());
        if let Some(ref probe) = config.probe {
            listener.set_probing(Probing {
                upstream: Upstream::udp(probe.address),
                routes: RouteTable::new(probe.route_table_size),
            });
        }
        let listener = Arc::new(listener);

        let mut io_provider = TokioIoProvider::bind([config.bind], [config.bind])
            .await
            .context("failed to bind sockets")?;
        io_provider.set_sweep_interval(config.forwarding.sweep_interval());
        let controller = io_provider.start(&listener);
        Ok((listener, controller))
    })
}

fn set_up_signal_handling() -> Result<Signals> {
    let all_signals = &[SIGHUP, SIGINT, SIGTERM];
    let term_signals = &[SIGINT, SIGTERM];
    let already_terminating = Arc::new(AtomicBool::new(false));

    // This sets up signal handlers to exit immediately if a second
    // termination signal arrives before the process finishes shutting
    // down gracefully.
    for sig in term_signals {
        signal_hook::flag::register_conditional_shutdown(*sig, 1, already_terminating.clone())?;
        signal_hook::flag::register(*sig, already_terminating.clone())?;
    }

    Signals::new(all_signals).map_err(Into::into)
}
