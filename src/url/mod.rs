//! URL parsing, rendering, percent-encoding, and redirect resolution.
//!
//! Grounded on `url_parse`/`url_str`/`url_encode` in
//! `examples/original_source/url.c`. The grammar is deliberately narrower
//! than `url` crate territory: four schemes, no query/fragment modeling
//! beyond what redirect resolution needs, IPv6 literals via `[...]`.

use crate::error::{FetchError, Result};
use std::fmt;

/// Bound on the authority's host component, mirroring `HOST_NAME_MAX`.
const HOST_NAME_MAX: usize = 255;
/// Bound on the port string, mirroring `NI_MAXSERV`.
const NI_MAXSERV: usize = 32;

/// The four schemes this retriever understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
    Ftp,
    File,
}

impl Scheme {
    /// Case-insensitive scheme lookup, mirroring `scheme_lookup()`.
    fn from_token(token: &str) -> Option<Scheme> {
        match token.to_ascii_lowercase().as_str() {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "ftp" => Some(Scheme::Ftp),
            "file" => Some(Scheme::File),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ftp => "ftp",
            Scheme::File => "file",
        }
    }

    /// The scheme's default port, or `None` for `file`, mirroring
    /// `port_str[]`.
    pub fn default_port(&self) -> Option<&'static str> {
        match self {
            Scheme::Http => Some("80"),
            Scheme::Https => Some("443"),
            Scheme::Ftp => Some("21"),
            Scheme::File => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed URL. See spec's Data Model §3: scheme is always set; for
/// non-`file` schemes, `host` and `port` are non-empty after defaulting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Url {
    pub scheme: Scheme,
    pub host: String,
    pub port: String,
    /// Path including the leading `/`, or empty if none was present on
    /// the wire (rendered as `/` but preserved empty in the parsed form).
    pub path: String,
    /// `true` if the host was written as a bracketed IPv6 literal.
    pub ipliteral: bool,
    /// The local output filename, set by the caller after parsing (not
    /// part of the wire grammar) and carried across redirects.
    pub fname: Option<String>,
}

impl Url {
    /// Parses a URL string per spec §4.1 / `url_parse()`.
    pub fn parse(input: &str) -> Result<Url> {
        let trimmed = input.trim_start();

        let colon = trimmed
            .find(':')
            .ok_or_else(|| FetchError::Input(format!("scheme missing: {input}")))?;
        let scheme = Scheme::from_token(&trimmed[..colon])
            .ok_or_else(|| FetchError::Input(format!("invalid scheme: {input}")))?;

        let mut rest = &trimmed[colon + 1..];
        if !rest.starts_with("//") {
            if scheme == Scheme::File {
                return Ok(Url {
                    scheme,
                    host: String::new(),
                    port: String::new(),
                    path: rest.to_string(),
                    ipliteral: false,
                    fname: None,
                });
            }
            return Err(FetchError::Input(format!("invalid url: {input}")));
        }
        rest = &rest[2..];

        if let Some(at) = rest.find('@') {
            log::warn!("ignoring deprecated userinfo");
            rest = &rest[at + 1..];
        }

        let (authority, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], rest[slash..].to_string()),
            None => (rest, String::new()),
        };

        let (mut host, mut port, ipliteral) = if authority.starts_with('[') {
            let (h, p) = parse_ipv6_authority(authority)?;
            (h, p, true)
        } else {
            let (h, p) = parse_plain_authority(authority);
            (h, p, false)
        };

        if host.len() > HOST_NAME_MAX {
            return Err(FetchError::Input("host name too long".into()));
        }
        if port.as_ref().map(|p| p.len()).unwrap_or(0) > NI_MAXSERV {
            return Err(FetchError::Input("port string too long".into()));
        }

        if host.is_empty() && scheme != Scheme::File {
            return Err(FetchError::Input(format!("empty host: {input}")));
        }

        if port.is_none() && scheme != Scheme::File {
            port = scheme.default_port().map(|s| s.to_string());
        }

        Ok(Url {
            scheme,
            host: std::mem::take(&mut host),
            port: port.unwrap_or_default(),
            path,
            ipliteral,
            fname: None,
        })
    }

    /// Renders the URL as `scheme://host[:port]path`, bracketing IPv6 and
    /// eliding the default port, per `url_str()`.
    pub fn render(&self) -> String {
        let host = if self.ipliteral {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        let custom_port = self.scheme.default_port().as_deref() != Some(self.port.as_str());
        let path = if self.path.is_empty() { "/" } else { &self.path };

        if custom_port && !self.port.is_empty() {
            format!("{}://{}:{}{}", self.scheme, host, self.port, path)
        } else {
            format!("{}://{}{}", self.scheme, host, path)
        }
    }

    /// Resolves a `Location` header against this URL, per spec §4.1.
    /// Fragment components are stripped from both before comparison.
    pub fn resolve_redirect(&self, location: &str) -> Result<Url> {
        let base_path = strip_fragment(&self.path);
        let location = strip_fragment(location);

        let lower = location.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let mut target = Url::parse(location)?;
            if self.scheme == Scheme::Https && target.scheme == Scheme::Http {
                return Err(FetchError::Protocol(
                    "refusing to follow HTTPS -> HTTP redirect".into(),
                ));
            }
            target.fname = self.fname.clone();
            return Ok(target);
        }

        if let Some(rest) = location.strip_prefix('/') {
            return Ok(Url {
                scheme: self.scheme,
                host: self.host.clone(),
                port: self.port.clone(),
                path: format!("/{rest}"),
                ipliteral: self.ipliteral,
                fname: self.fname.clone(),
            });
        }

        let dir = match base_path.rfind('/') {
            Some(slash) => &base_path[..=slash],
            None => "/",
        };
        Ok(Url {
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port.clone(),
            path: format!("{dir}{location}"),
            ipliteral: self.ipliteral,
            fname: self.fname.clone(),
        })
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn strip_fragment(s: &str) -> &str {
    match s.find('#') {
        Some(i) => &s[..i],
        None => s,
    }
}

fn parse_ipv6_authority(s: &str) -> Result<(String, Option<String>)> {
    let close = s
        .find(']')
        .ok_or_else(|| FetchError::Input(format!("invalid IPv6 address: {s}")))?;
    let host = s[1..close].to_string();
    let rest = &s[close + 1..];
    if rest.is_empty() {
        return Ok((host, None));
    }
    let port = rest
        .strip_prefix(':')
        .ok_or_else(|| FetchError::Input(format!("invalid port: {rest}")))?;
    Ok((
        host,
        if port.is_empty() {
            None
        } else {
            Some(port.to_string())
        },
    ))
}

/// Splits on the rightmost `:`, per spec §4.1 (the retrieved C source uses
/// the first `:` via `strchr`; the specification explicitly redefines this
/// to the rightmost occurrence, so that behavior is followed here).
fn parse_plain_authority(s: &str) -> (String, Option<String>) {
    match s.rsplit_once(':') {
        Some((h, p)) => (
            h.to_string(),
            if p.is_empty() { None } else { Some(p.to_string()) },
        ),
        None => (s.to_string(), None),
    }
}

/// Percent-encodes `path` per RFC 1738, mirroring `url_encode()`/
/// `unsafe_char()` byte-for-byte.
pub fn percent_encode(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if is_unsafe_char(bytes, i) {
            out.push_str(&format!("%{:02x}", bytes[i]));
        } else {
            out.push(bytes[i] as char);
        }
        i += 1;
    }
    out
}

const UNSAFE_CHARS: &[u8] = b" <>\"#{}|\\^~[]`";

fn is_unsafe_char(bytes: &[u8], i: usize) -> bool {
    let c = bytes[i];
    if !c.is_ascii() || c.is_ascii_control() {
        return true;
    }
    if UNSAFE_CHARS.contains(&c) {
        return true;
    }
    if c == b'%' {
        let h1 = bytes.get(i + 1).copied();
        let h2 = bytes.get(i + 2).copied();
        let valid = h1.map(|b| b.is_ascii_hexdigit()).unwrap_or(false)
            && h2.map(|b| b.is_ascii_hexdigit()).unwrap_or(false);
        return !valid;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_http() {
        let u = Url::parse("http://example.com/a.txt").unwrap();
        assert_eq!(u.scheme, Scheme::Http);
        assert_eq!(u.host, "example.com");
        assert_eq!(u.port, "80");
        assert_eq!(u.path, "/a.txt");
        assert!(!u.ipliteral);
    }

    #[test]
    fn parse_ipv6_no_port() {
        let u = Url::parse("http://[::1]/x").unwrap();
        assert_eq!(u.host, "::1");
        assert_eq!(u.port, "80");
        assert!(u.ipliteral);
        assert_eq!(u.path, "/x");
    }

    #[test]
    fn parse_ipv6_with_port() {
        let u = Url::parse("http://[::1]:8080/x").unwrap();
        assert_eq!(u.host, "::1");
        assert_eq!(u.port, "8080");
    }

    #[test]
    fn parse_empty_path_is_empty_not_slash() {
        let u = Url::parse("http://example.com").unwrap();
        assert_eq!(u.path, "");
        assert_eq!(u.render(), "http://example.com/");
    }

    #[test]
    fn parse_rejects_missing_scheme() {
        assert!(Url::parse("example.com/a").is_err());
    }

    #[test]
    fn parse_rejects_empty_host() {
        assert!(Url::parse("http:///a").is_err());
    }

    #[test]
    fn parse_file_without_authority() {
        let u = Url::parse("file:/etc/passwd").unwrap();
        assert_eq!(u.scheme, Scheme::File);
        assert_eq!(u.path, "/etc/passwd");
        assert_eq!(u.host, "");
    }

    #[test]
    fn render_elides_default_port() {
        let u = Url::parse("http://example.com:80/x").unwrap();
        assert_eq!(u.render(), "http://example.com/x");
    }

    #[test]
    fn render_keeps_custom_port() {
        let u = Url::parse("http://example.com:8080/x").unwrap();
        assert_eq!(u.render(), "http://example.com:8080/x");
    }

    #[test]
    fn render_brackets_ipv6() {
        let u = Url::parse("http://[::1]:8080/x").unwrap();
        assert_eq!(u.render(), "http://[::1]:8080/x");
    }

    #[test]
    fn parse_render_roundtrip_modulo_default_port() {
        for s in ["http://a.example/p", "https://a.example:8443/p", "ftp://a.example/p"] {
            let u = Url::parse(s).unwrap();
            assert_eq!(u.render(), s);
        }
    }

    #[test]
    fn percent_encode_is_idempotent_on_safe_strings() {
        let safe = "/pub/file-name_1.2.3.tar.gz";
        assert_eq!(percent_encode(safe), safe);
    }

    #[test]
    fn percent_encode_space_and_brackets() {
        assert_eq!(percent_encode("a b"), "a%20b");
        assert_eq!(percent_encode("[x]"), "%5bx%5d");
    }

    #[test]
    fn percent_encode_preserves_valid_percent_escape() {
        assert_eq!(percent_encode("a%20b"), "a%20b");
    }

    #[test]
    fn percent_encode_escapes_bare_percent() {
        assert_eq!(percent_encode("a%b"), "a%25b");
    }

    #[test]
    fn redirect_absolute_same_scheme() {
        let base = Url::parse("http://a/x").unwrap();
        let target = base.resolve_redirect("http://b/y").unwrap();
        assert_eq!(target.host, "b");
        assert_eq!(target.path, "/y");
    }

    #[test]
    fn redirect_refuses_https_downgrade() {
        let base = Url::parse("https://a/x").unwrap();
        assert!(base.resolve_redirect("http://a/y").is_err());
    }

    #[test]
    fn redirect_path_absolute_inherits_authority() {
        let base = Url::parse("http://a:8080/dir/x").unwrap();
        let target = base.resolve_redirect("/y").unwrap();
        assert_eq!(target.host, "a");
        assert_eq!(target.port, "8080");
        assert_eq!(target.path, "/y");
    }

    #[test]
    fn redirect_relative_appends_to_directory() {
        let base = Url::parse("http://a/dir/x").unwrap();
        let target = base.resolve_redirect("y").unwrap();
        assert_eq!(target.path, "/dir/y");
    }

    #[test]
    fn redirect_carries_filename() {
        let mut base = Url::parse("http://a/x").unwrap();
        base.fname = Some("x".to_string());
        let target = base.resolve_redirect("/y").unwrap();
        assert_eq!(target.fname.as_deref(), Some("x"));
    }

    #[test]
    fn redirect_strips_fragment() {
        let base = Url::parse("http://a/dir/x#frag").unwrap();
        let target = base.resolve_redirect("/y#other").unwrap();
        assert_eq!(target.path, "/y");
    }
}
