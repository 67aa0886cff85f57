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

//! Implements the `check` command, which shows how the redirect records
//! of a hostname are read.

use std::process;
use std::time::Instant;

use anyhow::{Context, Result};
use env_logger::Env;
use log::error;

use redirect_name::cert::{self, apex_domain, Cache, DirCache};
use redirect_name::lookup::{self, redirect_name, DnsLookup, DnsLookupConfig, TxtLookup};
use redirect_name::policy::HostPolicy;
use redirect_name::resolve::resolve;
use redirect_name::rule;

use crate::args::CheckArgs;
use crate::config::{self, Config};
use crate::run::describe_failure;

/// Runs the check.
pub fn check(args: CheckArgs) {
    env_logger::init_from_env(Env::new().default_filter_or("warn"));

    if let Err(e) = try_checking(args) {
        error!("{}", describe_failure("Failed to check:", &e));
        process::exit(1);
    }
}

fn try_checking(args: CheckArgs) -> Result<()> {
    let config = match args.config {
        Some(ref path) => config::load_from_path(path)?,
        None => Config::default(),
    };
    let lookup_config = DnsLookupConfig::from(&config.dns);
    let lookup = DnsLookup::new(&lookup_config).context("failed to set up the DNS resolver")?;

    let name = redirect_name(&args.host);
    let records = lookup
        .lookup_txt_with_deadline(&name, Instant::now() + lookup_config.deadline())
        .with_context(|| format!("failed to look up the TXT records at {}", name))?;

    println!("{}: {} TXT record(s)", name, records.len());
    for (i, record) in records.iter().enumerate() {
        println!("  [{}] {:?}", i + 1, record);
        match rule::parse(record) {
            Some(rule) => println!("      {}", rule),
            None => println!("      not a redirect rule"),
        }
    }

    // Reuse the records we already have rather than querying again.
    let policy = HostPolicy::new(|_: &str| -> Result<Vec<String>, lookup::Error> {
        Ok(records.clone())
    });
    match policy.check(&args.host) {
        Ok(()) => println!("Certificate issuance: allowed"),
        Err(denial) => println!("Certificate issuance: denied ({})", denial),
    }
    match apex_domain(&args.host) {
        Some(apex) => println!("Certificate quota: shared with {}", apex),
        None => println!("Certificate quota: none (not a registrable name)"),
    }

    // Read the directory directly; a check should not create it.
    if let Some(dir) = args.cert_dir.as_deref().or(config.cert_dir.as_deref()) {
        match DirCache::new(dir).get(&args.host) {
            Ok(data) => println!(
                "Stored certificate: {} bytes in {}",
                data.len(),
                dir.display()
            ),
            Err(cert::Error::CacheMiss) => println!("Stored certificate: none in {}", dir.display()),
            Err(e) => return Err(e).context("failed to read the certificate store"),
        }
    }

    if let Some(ref path) = args.path {
        match resolve(&records, path) {
            Ok(redirect) => println!(
                "{} -> {} {}",
                path,
                redirect.status.as_u16(),
                redirect.location
            ),
            Err(e) => println!("{} -> fallback ({})", path, e),
        }
    }
    Ok(())
}
