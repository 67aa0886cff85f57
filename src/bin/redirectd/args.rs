// Copyright 2022 Matthew Ingwersen.
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

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Parses the command line arguments.
pub fn parse() -> Args {
    Args::parse()
}

/// An HTTP redirector configured through DNS TXT records
#[derive(Debug, Parser)]
#[command(author, version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server
    Run(RunArgs),

    /// Show how the redirect records of a hostname are interpreted
    Check(CheckArgs),
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Set the configuration file to use
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Set the server bind IP address
    #[arg(long, value_name = "IP")]
    pub ip: Option<IpAddr>,

    /// Set the server port
    #[arg(long, env = "PORT", value_name = "PORT")]
    pub port: Option<u16>,

    /// Set where to send requests that cannot be redirected
    #[arg(long, env = "FALLBACK_URL", value_name = "URL")]
    pub fallback_url: Option<String>,

    /// Set the directory in which certificates are stored
    #[arg(long, env = "CERT_DIR", value_name = "DIR")]
    pub cert_dir: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
pub struct CheckArgs {
    /// Take DNS options from this configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Also look for a stored certificate in this directory
    #[arg(long, env = "CERT_DIR", value_name = "DIR")]
    pub cert_dir: Option<PathBuf>,

    /// The hostname to check
    pub host: String,

    /// Also resolve the redirect for this request path
    pub path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_parses() {
        let args = Args::try_parse_from([
            "redirectd",
            "run",
            "--ip",
            "127.0.0.1",
            "--port",
            "9000",
            "--fallback-url",
            "https://fallback.test/",
            "--cert-dir",
            "/var/lib/redirectd/certs",
        ])
        .unwrap();
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.ip, Some("127.0.0.1".parse().unwrap()));
                assert_eq!(run.port, Some(9000));
                assert_eq!(run.fallback_url.as_deref(), Some("https://fallback.test/"));
                assert_eq!(
                    run.cert_dir,
                    Some(PathBuf::from("/var/lib/redirectd/certs"))
                );
            }
            _ => panic!("expected the run command"),
        }

        let args = Args::try_parse_from(["redirectd", "check", "go.example.com", "/docs/"]).unwrap();
        match args.command {
            Command::Check(check) => {
                assert_eq!(check.host, "go.example.com");
                assert_eq!(check.path.as_deref(), Some("/docs/"));
            }
            _ => panic!("expected the check command"),
        }
    }
}
