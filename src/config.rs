//! The configuration surface the excluded CLI layer would populate.
//!
//! Flag parsing itself is out of scope (spec §1); this module is the
//! contract the core consumes from whatever does that parsing — see
//! spec §6 "CLI surface (worker inputs)".

use crate::error::{FetchError, Result};
use crate::url::{Scheme, Url};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Address-family preference for name resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Any,
    V4Only,
    V6Only,
}

/// TLS verification suboptions, parsed from the comma-separated string
/// described in spec §6 (`cafile=`, `capath=`, `ciphers=`, `dont`,
/// `depth=`, `protocols=`, `muststaple`, `noverifytime`).
///
/// Only `cafile` and `dont`/`noverifytime` currently change rustls
/// behavior (see DESIGN.md); the rest are stored for completeness.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    pub ca_file: Option<String>,
    pub ca_path: Option<String>,
    pub ciphers: Option<String>,
    pub dont_verify: bool,
    pub verify_depth: Option<u32>,
    pub protocols: Option<String>,
    pub must_staple: bool,
    pub no_verify_time: bool,
}

impl TlsOptions {
    /// Parses the `-S` suboption string, e.g. `"cafile=/etc/ca.pem,dont"`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut opts = TlsOptions::default();
        if s.is_empty() {
            return Ok(opts);
        }
        for item in s.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, val) = match item.split_once('=') {
                Some((k, v)) => (k, Some(v.to_string())),
                None => (item, None),
            };
            match key {
                "cafile" => {
                    opts.ca_file =
                        Some(val.ok_or_else(|| FetchError::Input("missing CA file".into()))?)
                }
                "capath" => {
                    opts.ca_path =
                        Some(val.ok_or_else(|| FetchError::Input("missing ca path".into()))?)
                }
                "ciphers" => {
                    opts.ciphers =
                        Some(val.ok_or_else(|| FetchError::Input("missing cipher list".into()))?)
                }
                "dont" => opts.dont_verify = true,
                "depth" => {
                    let v = val.ok_or_else(|| FetchError::Input("missing depth".into()))?;
                    opts.verify_depth = Some(
                        v.parse()
                            .map_err(|_| FetchError::Input(format!("invalid depth: {v}")))?,
                    );
                }
                "protocols" => opts.protocols = val,
                "muststaple" => opts.must_staple = true,
                "noverifytime" => opts.no_verify_time = true,
                other => {
                    return Err(FetchError::Input(format!(
                        "Unknown -S suboption `{other}'"
                    )));
                }
            }
        }
        Ok(opts)
    }
}

/// The mutable passive/active fallback cell described in spec §5. Every
/// other field on the worker's configuration is immutable after init.
#[derive(Debug, Default)]
pub struct PassiveMode(AtomicBool);

impl PassiveMode {
    pub fn new(active_by_default: bool) -> Self {
        Self(AtomicBool::new(!active_by_default))
    }

    pub fn is_passive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Called when EPSV fails: falls back to active mode for the rest of
    /// the session (spec §4.4).
    pub fn fall_back_to_active(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Process-wide, immutable-after-init configuration threaded explicitly
/// into each request (Design Notes §9: avoid true global mutability).
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub resume: bool,
    pub output: Option<String>,
    pub verbose: bool,
    pub progress: bool,
    pub tls: TlsOptions,
    pub user_agent: String,
    pub connect_timeout: Option<Duration>,
    pub address_family: AddressFamily,
    pub active_mode: bool,
    pub http_proxy: Option<Url>,
    pub ftp_proxy: Option<Url>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            resume: false,
            output: None,
            verbose: false,
            progress: false,
            tls: TlsOptions::default(),
            user_agent: default_user_agent().to_string(),
            connect_timeout: None,
            address_family: AddressFamily::Any,
            active_mode: false,
            http_proxy: None,
            ftp_proxy: None,
        }
    }
}

pub fn default_user_agent() -> &'static str {
    concat!("fetchcore/", env!("CARGO_PKG_VERSION"))
}

/// Parses an `http_proxy`/`ftp_proxy`-style environment value into a
/// `Url`, mirroring `proxy_parse()` in `original_source/main.c`: an empty
/// string means "unset", and the proxy's scheme must be HTTP. Reading the
/// environment itself is left to the caller — only the env *value* is
/// handled here, since env-var reading is an excluded external collaborator
/// concern (spec §1).
pub fn parse_proxy_env(value: &str) -> Result<Option<Url>> {
    if value.is_empty() {
        return Ok(None);
    }
    let proxy = Url::parse(value)?;
    if proxy.scheme != Scheme::Http {
        return Err(FetchError::Input(format!(
            "Malformed proxy URL: {value}"
        )));
    }
    Ok(Some(proxy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_options_parse_combo() {
        let o = TlsOptions::parse("cafile=/etc/ssl/cert.pem,dont,depth=3").unwrap();
        assert_eq!(o.ca_file.as_deref(), Some("/etc/ssl/cert.pem"));
        assert!(o.dont_verify);
        assert_eq!(o.verify_depth, Some(3));
    }

    #[test]
    fn tls_options_unknown_suboption_errors() {
        assert!(TlsOptions::parse("bogus").is_err());
    }

    #[test]
    fn proxy_env_empty_is_none() {
        assert!(parse_proxy_env("").unwrap().is_none());
    }

    #[test]
    fn proxy_env_rejects_non_http() {
        assert!(parse_proxy_env("ftp://proxy.example/").is_err());
    }

    #[test]
    fn proxy_env_accepts_http() {
        let p = parse_proxy_env("http://proxy.example:8080").unwrap().unwrap();
        assert_eq!(p.host, "proxy.example");
        assert_eq!(p.port, "8080");
    }

    #[test]
    fn passive_mode_falls_back() {
        let pm = PassiveMode::new(false);
        assert!(pm.is_passive());
        pm.fall_back_to_active();
        assert!(!pm.is_passive());
    }
}
