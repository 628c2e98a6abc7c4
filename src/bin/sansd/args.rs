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

//! Implements command-line argument parsing.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

use sans::forward::Upstream;

/// Parses the command line arguments.
pub fn parse() -> Args {
    Args::parse()
}

/// The sans anti-spoofing DNS forwarder
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the forwarder
    Run(RunArgs),
}

#[derive(Debug, Parser)]
#[clap(group(ArgGroup::new("required").required(true).args(&["config", "upstream"])))]
pub struct RunArgs {
    /// Set the configuration file to use
    #[clap(
        long,
        conflicts_with_all = &["bind", "upstream", "secondary", "probe"],
        value_name = "FILE"
    )]
    pub config: Option<PathBuf>,

    /// Set the IP address and port to listen on
    #[clap(long, value_name = "IP:PORT")]
    pub bind: Option<SocketAddr>,

    /// Set the upstream server queries are forwarded to
    #[clap(long, value_name = "IP:PORT[/udp|/tcp]")]
    pub upstream: Option<Upstream>,

    /// Set the secondary upstream server, used for retries and for
    /// polluted names
    #[clap(long, value_name = "IP:PORT[/udp|/tcp]")]
    pub secondary: Option<Upstream>,

    /// Probe names for pollution against this server
    #[clap(long, value_name = "IP:PORT")]
    pub probe: Option<SocketAddr>,

    /// Log debugging information (unless RUST_LOG says otherwise)
    #[clap(short, long)]
    pub verbose: bool,
}
