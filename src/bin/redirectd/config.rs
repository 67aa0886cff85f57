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

//! Implements the server configuration file.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::Level::Debug;
use log::{debug, log_enabled};
use serde::Deserialize;
use url::Url;

use redirect_name::cert::{DirCache, RateLimitedCache};
use redirect_name::lookup::{DnsLookupConfig, Upstream};
use redirect_name::server::DEFAULT_FALLBACK_URL;
use redirect_name::thread::{self, ThreadGroup};

use crate::args::RunArgs;
use crate::run::Server;

////////////////////////////////////////////////////////////////////////
// CONFIGURATION LOADING                                              //
////////////////////////////////////////////////////////////////////////

/// Loads the configuration file given by `path`, without validating
/// it.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let raw_config = fs::read(path.as_ref()).context("failed to read the configuration file")?;
    toml::from_slice(&raw_config).context("failed to parse the configuration file")
}

/// Loads the server configuration for the `run` command: the
/// configuration file, if one was given, with the command-line (and
/// environment) overrides applied on top.
pub fn load(args: &RunArgs) -> Result<Config> {
    let mut config = match args.config {
        Some(ref path) => load_from_path(path)?,
        None => Config::default(),
    };
    config.apply_overrides(args);
    config.validate()?;
    log_config_summary(&config);
    Ok(config)
}

/// Summarizes the configuration in the log, if the debug log level is
/// enabled.
fn log_config_summary(config: &Config) {
    if !log_enabled!(Debug) {
        return;
    }
    debug!(
        "Configuration loaded:\n\
         Bind address:   {}\n\
         Fallback URL:   {}\n\
         Shutdown grace: {} s\n\
         Cert directory: {}\n\
         I/O provider:   {}\n\
         DNS upstream:   {:?} (timeout {} s, {} attempts)",
        config.bind,
        config.fallback_url,
        config.shutdown_grace,
        config
            .cert_dir
            .as_deref()
            .map_or_else(|| "(none)".to_owned(), |dir| dir.display().to_string()),
        config.io.name(),
        config.dns.upstream.0,
        config.dns.timeout,
        config.dns.attempts,
    );
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION FILE STRUCTURE                                       //
////////////////////////////////////////////////////////////////////////

/// The complete configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default = "default_fallback_url")]
    pub fallback_url: String,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    #[serde(default)]
    pub cert_dir: Option<PathBuf>,
    #[serde(default = "default_io_provider_config")]
    pub io: IoProviderConfig,
    #[serde(default)]
    pub dns: DnsConfig,
}

const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
const DEFAULT_BIND_PORT: u16 = 8081;

fn default_bind() -> SocketAddr {
    SocketAddr::new(DEFAULT_BIND_IP, DEFAULT_BIND_PORT)
}

fn default_fallback_url() -> String {
    DEFAULT_FALLBACK_URL.to_owned()
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            fallback_url: default_fallback_url(),
            shutdown_grace: default_shutdown_grace(),
            cert_dir: None,
            io: default_io_provider_config(),
            dns: DnsConfig::default(),
        }
    }
}

impl Config {
    fn apply_overrides(&mut self, args: &RunArgs) {
        if let Some(ip) = args.ip {
            self.bind.set_ip(ip);
        }
        if let Some(port) = args.port {
            self.bind.set_port(port);
        }
        if let Some(ref fallback_url) = args.fallback_url {
            self.fallback_url = fallback_url.clone();
        }
        if let Some(ref cert_dir) = args.cert_dir {
            self.cert_dir = Some(cert_dir.clone());
        }
    }

    /// Checks the values that deserialization cannot.
    fn validate(&self) -> Result<()> {
        let fallback = Url::parse(&self.fallback_url)
            .with_context(|| format!("invalid fallback URL {:?}", self.fallback_url))?;
        if fallback.fragment().is_some() {
            return Err(anyhow!(
                "the fallback URL {:?} must not have a fragment",
                self.fallback_url
            ));
        }
        if self.dns.attempts == 0 {
            return Err(anyhow!("dns.attempts must be at least 1"));
        }
        Ok(())
    }

    /// Returns the shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }

    /// Opens the rate-limited certificate store in `cert_dir`, creating
    /// the directory if needed. Returns [`None`] if no directory is
    /// configured.
    pub fn certificate_store(&self) -> Result<Option<CertificateStore>> {
        self.cert_dir
            .as_deref()
            .map(open_certificate_store)
            .transpose()
    }
}

/// The certificate store: certificates are kept in a directory, at most
/// [`CERTIFICATES_PER_WEEK`](redirect_name::cert::CERTIFICATES_PER_WEEK)
/// per registrable domain each week.
pub type CertificateStore = RateLimitedCache<DirCache>;

/// Opens the [`CertificateStore`] in `dir`.
pub fn open_certificate_store(dir: &Path) -> Result<CertificateStore> {
    let cache = DirCache::open(dir).with_context(|| {
        format!(
            "failed to create the certificate directory {}",
            dir.display()
        )
    })?;
    Ok(RateLimitedCache::new(cache))
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: I/O PROVIDERS                               //
////////////////////////////////////////////////////////////////////////

/// An abstraction over all supported I/O providers.
pub trait IoProvider {
    fn supports_graceful_shutdown(&self) -> bool;
    fn start(
        self: Box<Self>,
        server: &Arc<Server>,
        group: &Arc<ThreadGroup>,
    ) -> Result<(), thread::Error>;
}

/// The selection of I/O provider and its configuration.
#[derive(Debug, Deserialize)]
#[serde(tag = "provider")]
pub enum IoProviderConfig {
    #[serde(rename = "blocking")]
    Blocking(blocking_io::Config),
}

impl IoProviderConfig {
    /// Returns the name of the selected I/O provider.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Blocking(_) => "blocking",
        }
    }

    /// Creates the selected I/O provider with this configuration and
    /// binds it to the provided address.
    pub fn bind_provider(&self, addr: SocketAddr) -> io::Result<Box<dyn IoProvider>> {
        match self {
            Self::Blocking(config) => {
                let io_provider =
                    redirect_name::io::BlockingIoProvider::bind(config.into(), [addr])?;
                Ok(Box::new(io_provider))
            }
        }
    }
}

/// Support for the
/// [`BlockingIoProvider`](redirect_name::io::BlockingIoProvider).
mod blocking_io {
    use super::*;
    use redirect_name::io::{BlockingIoConfig, BlockingIoProvider};

    impl IoProvider for BlockingIoProvider {
        fn supports_graceful_shutdown(&self) -> bool {
            BlockingIoProvider::SUPPORTS_GRACEFUL_SHUTDOWN
        }

        fn start(
            self: Box<Self>,
            server: &Arc<Server>,
            group: &Arc<ThreadGroup>,
        ) -> Result<(), thread::Error> {
            BlockingIoProvider::start(*self, server, group)
        }
    }

    /// Deserializable mirror of [`BlockingIoConfig`]. Timeouts are in
    /// seconds.
    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct Config {
        #[serde(default = "default_base_workers")]
        pub base_workers: usize,
        #[serde(default = "default_max_auxiliary_workers")]
        pub max_auxiliary_workers: usize,
        #[serde(default = "default_timeout")]
        pub read_timeout: u64,
        #[serde(default = "default_timeout")]
        pub write_timeout: u64,
    }

    fn default_base_workers() -> usize {
        BlockingIoConfig::default().base_workers
    }

    fn default_max_auxiliary_workers() -> usize {
        BlockingIoConfig::default().max_auxiliary_workers
    }

    fn default_timeout() -> u64 {
        5
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                base_workers: default_base_workers(),
                max_auxiliary_workers: default_max_auxiliary_workers(),
                read_timeout: default_timeout(),
                write_timeout: default_timeout(),
            }
        }
    }

    impl From<&Config> for BlockingIoConfig {
        fn from(toml_config: &Config) -> Self {
            Self {
                base_workers: toml_config.base_workers,
                max_auxiliary_workers: toml_config.max_auxiliary_workers,
                read_timeout: Duration::from_secs(toml_config.read_timeout.max(1)),
                write_timeout: Duration::from_secs(toml_config.write_timeout.max(1)),
            }
        }
    }
}

fn default_io_provider_config() -> IoProviderConfig {
    IoProviderConfig::Blocking(blocking_io::Config::default())
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: DNS                                         //
////////////////////////////////////////////////////////////////////////

/// How TXT records are looked up. The timeout is in seconds.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    #[serde(default)]
    pub upstream: ConfigUpstream,
    #[serde(default = "default_dns_timeout")]
    pub timeout: u64,
    #[serde(default = "default_dns_attempts")]
    pub attempts: usize,
}

fn default_dns_timeout() -> u64 {
    DnsLookupConfig::default().timeout.as_secs()
}

fn default_dns_attempts() -> usize {
    DnsLookupConfig::default().attempts
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            upstream: ConfigUpstream::default(),
            timeout: default_dns_timeout(),
            attempts: default_dns_attempts(),
        }
    }
}

impl From<&DnsConfig> for DnsLookupConfig {
    fn from(config: &DnsConfig) -> Self {
        Self {
            upstream: config.upstream.0,
            timeout: Duration::from_secs(config.timeout.max(1)),
            attempts: config.attempts,
        }
    }
}

/// A deserializable wrapper over [`Upstream`].
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(from = "UpstreamName")]
pub struct ConfigUpstream(pub Upstream);

impl Default for ConfigUpstream {
    fn default() -> Self {
        Self(Upstream::System)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum UpstreamName {
    System,
    Cloudflare,
    Google,
    Quad9,
}

impl From<UpstreamName> for ConfigUpstream {
    fn from(name: UpstreamName) -> Self {
        Self(match name {
            UpstreamName::System => Upstream::System,
            UpstreamName::Cloudflare => Upstream::Cloudflare,
            UpstreamName::Google => Upstream::Google,
            UpstreamName::Quad9 => Upstream::Quad9,
        })
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args() -> RunArgs {
        RunArgs {
            config: None,
            ip: None,
            port: None,
            fallback_url: None,
            cert_dir: None,
        }
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.bind, "0.0.0.0:8081".parse().unwrap());
        assert_eq!(config.fallback_url, "http://redirect.name/");
        assert_eq!(config.shutdown_grace(), Duration::from_secs(10));
        assert_eq!(config.io.name(), "blocking");
        assert!(matches!(config.dns.upstream.0, Upstream::System));
        assert!(config.validate().is_ok());
        assert!(config.cert_dir.is_none());
        assert!(config.certificate_store().unwrap().is_none());
    }

    #[test]
    fn full_file_parses() {
        let config: Config = toml::from_str(
            r#"
            bind = "[::1]:8080"
            fallback_url = "https://example.com/unknown"
            shutdown_grace = 3
            cert_dir = "/var/lib/redirectd/certs"

            [io]
            provider = "blocking"
            base_workers = 2
            max_auxiliary_workers = 16
            read_timeout = 1
            write_timeout = 2

            [dns]
            upstream = "quad9"
            timeout = 4
            attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.bind, "[::1]:8080".parse().unwrap());
        assert_eq!(config.shutdown_grace, 3);
        assert_eq!(
            config.cert_dir.as_deref(),
            Some(Path::new("/var/lib/redirectd/certs"))
        );
        let IoProviderConfig::Blocking(ref io) = config.io;
        assert_eq!(io.base_workers, 2);
        assert_eq!(io.max_auxiliary_workers, 16);

        let lookup_config = DnsLookupConfig::from(&config.dns);
        assert_eq!(lookup_config.upstream, Upstream::Quad9);
        assert_eq!(lookup_config.timeout, Duration::from_secs(4));
        assert_eq!(lookup_config.attempts, 3);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("bnd = \"[::1]:80\"").is_err());
        assert!(toml::from_str::<Config>("[dns]\nupstream = \"opendns\"").is_err());
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config: Config =
            toml::from_str("bind = \"127.0.0.1:80\"\nfallback_url = \"https://a.test/\"").unwrap();
        let args = RunArgs {
            port: Some(9000),
            fallback_url: Some("https://b.test/".to_owned()),
            cert_dir: Some(PathBuf::from("/tmp/certs")),
            ..run_args()
        };
        config.apply_overrides(&args);
        assert_eq!(config.bind, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.fallback_url, "https://b.test/");
        assert_eq!(config.cert_dir.as_deref(), Some(Path::new("/tmp/certs")));
    }

    #[test]
    fn cert_dir_opens_a_rate_limited_store() {
        use redirect_name::cert::{Cache, Error, CERTIFICATES_PER_WEEK};

        let temp = tempfile::tempdir().unwrap();
        let config = Config {
            cert_dir: Some(temp.path().join("certs")),
            ..Config::default()
        };
        let store = config.certificate_store().unwrap().unwrap();
        assert!(temp.path().join("certs").is_dir());

        for i in 0..CERTIFICATES_PER_WEEK {
            store.put(&format!("host{}.example.com", i), b"cert").unwrap();
        }
        assert!(matches!(
            store.put("another.example.com", b"cert"),
            Err(Error::RateLimited { .. })
        ));
        assert_eq!(store.inner().get("host0.example.com").unwrap(), b"cert");
    }

    #[test]
    fn validation_rejects_bad_fallback_urls() {
        for url in ["not a url", "https://a.test/#frag"] {
            let config = Config {
                fallback_url: url.to_owned(),
                ..Config::default()
            };
            assert!(config.validate().is_err(), "{} was accepted", url);
        }
    }
}
