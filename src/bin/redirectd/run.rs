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

//! Implements the `run` command (i.e., running the server).

use std::fmt::Write;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use env_logger::Env;
use log::{error, info, warn};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use redirect_name::cert::CERTIFICATES_PER_WEEK;
use redirect_name::lookup::{DnsLookup, DnsLookupConfig};
use redirect_name::thread::ThreadGroup;

use crate::args::RunArgs;
use crate::config;

/// The specific [`Server`](redirect_name::server::Server) type we use.
pub type Server = redirect_name::server::Server<DnsLookup>;

/// Runs the server.
pub fn run(args: RunArgs) {
    env_logger::init_from_env(Env::new().default_filter_or("info"));

    if let Err(e) = try_running(args) {
        error!("{}", describe_failure("Failed to run:", &e));
        process::exit(1);
    }
    info!("Exiting with success.");
}

/// Formats an error and its chain of causes, one numbered line each.
pub fn describe_failure(heading: &str, e: &anyhow::Error) -> String {
    let mut message = String::from(heading);
    for (i, cause) in e.chain().enumerate() {
        write!(message, "\n[{}] {}", i + 1, cause).unwrap();
    }
    message.push_str("\nExiting with failure.");
    message
}

fn try_running(run_args: RunArgs) -> Result<()> {
    info!(
        "redirectd v{}.{}.{} starting.",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR"),
        env!("CARGO_PKG_VERSION_PATCH"),
    );

    match run_args.config {
        Some(ref path) => info!("Loading the configuration from {}.", path.display()),
        None => info!("Loading the configuration from the command line."),
    }
    let config = config::load(&run_args).context("failed to load the configuration")?;
    if let Some(store) = config.certificate_store()? {
        info!(
            "Certificate store is {} (at most {} new certificates per registered domain per week).",
            store.inner().dir().display(),
            CERTIFICATES_PER_WEEK,
        );
    }

    // Bind before anything else so that a taken port fails fast.
    let io_provider = config
        .io
        .bind_provider(config.bind)
        .context("failed to bind sockets")?;
    let lookup_config = DnsLookupConfig::from(&config.dns);
    let lookup = DnsLookup::new(&lookup_config).context("failed to set up the DNS resolver")?;
    let server = Arc::new(
        Server::new(lookup, config.fallback_url.clone())
            .with_lookup_timeout(lookup_config.deadline()),
    );

    let mut signals = set_up_signal_handling().context("failed to set up signal handling")?;

    info!(
        "Set-up is complete; redirecting from {} with fallback {}.",
        config.bind, config.fallback_url
    );
    let thread_group = ThreadGroup::new();
    let graceful_shutdown = io_provider.supports_graceful_shutdown();
    io_provider
        .start(&server, &thread_group)
        .context("failed to start the I/O provider")?;

    // Block until told to terminate.
    if let Some(signal) = signals.forever().next() {
        let name = if signal == SIGINT { "SIGINT" } else { "SIGTERM" };
        info!("Received {}; shutting down.", name);
    }

    if graceful_shutdown {
        thread_group.shut_down();
        let grace = config.shutdown_grace();
        if thread_group.await_shutdown_timeout(grace) {
            info!("Shutdown complete.");
        } else {
            warn!(
                "{} threads still busy after the {} s grace period; exiting anyway.",
                thread_group.thread_count(),
                grace.as_secs(),
            );
        }
    }
    Ok(())
}

fn set_up_signal_handling() -> Result<Signals> {
    let term_signals = &[SIGINT, SIGTERM];
    let already_terminating = Arc::new(AtomicBool::new(false));

    // A second termination signal arriving before graceful shutdown
    // finishes exits immediately.
    for sig in term_signals {
        signal_hook::flag::register_conditional_shutdown(*sig, 1, already_terminating.clone())?;
        signal_hook::flag::register(*sig, already_terminating.clone())?;
    }

    Signals::new(term_signals).map_err(Into::into)
}
