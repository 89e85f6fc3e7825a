//! Selects the protocol component by URL scheme and drives its
//! connect/request/save sequence. Contains no protocol knowledge of its
//! own, per Design Notes §9 ("dynamic dispatch by scheme ... a sum type
//! with a method per variant") — grounded on the `url_connect`/
//! `url_request`/`url_save` scheme switch in `examples/original_source/url.c`.

use crate::config::{PassiveMode, WorkerConfig};
use crate::error::{FetchError, Result};
use crate::http::ResumeDestination;
use crate::url::{Scheme, Url};
use std::os::unix::net::UnixStream;

/// Derives the local output filename for `url`, per spec §6: the last path
/// segment unless overridden by `explicit`.
pub fn output_filename(url: &Url, explicit: Option<&str>) -> Result<String> {
    if let Some(name) = explicit {
        return Ok(name.to_string());
    }
    let base = url.path.rsplit('/').next().unwrap_or("");
    if base.is_empty() || base == "." {
        return Err(FetchError::Input(format!("no filename in URL: {url}")));
    }
    Ok(base.to_string())
}

/// Transfers a single URL to `dst`, dispatching on scheme. `broker` is
/// `None` when the destination is standard output passed in directly by
/// the caller (no privileged open needed) and `Some` for a file URL or a
/// resumed/created local output file.
pub fn transfer<W: ResumeDestination>(
    url: &Url,
    cfg: &WorkerConfig,
    offset: u64,
    passive: &PassiveMode,
    broker: Option<&UnixStream>,
    dst: &mut W,
) -> Result<u64> {
    match url.scheme {
        Scheme::Http | Scheme::Https => Ok(crate::http::fetch(url, cfg, offset, dst)?.bytes),
        Scheme::Ftp => {
            if let Some(proxy) = &cfg.ftp_proxy {
                // Keep the FTP scheme on the URL itself: the request line
                // sent to the proxy is a literal `GET ftp://...` (spec
                // §4.4), and `http::connect`/`render`'s target logic key
                // off `url.scheme` for that.
                let mut proxy_cfg = cfg.clone();
                proxy_cfg.http_proxy = Some(proxy.clone());
                return Ok(crate::http::fetch(url, &proxy_cfg, offset, dst)?.bytes);
            }
            let mut session = crate::ftp::connect(url, cfg)?;
            let control_peer = session.peer_addr()?;
            let (_size, data) = crate::ftp::retrieve(&mut session, control_peer, url, offset, passive)?;
            let n = crate::ftp::save(data, dst)?;
            if session.read_completion()? != crate::ftp::ReplyClass::Ok {
                return Err(FetchError::Protocol("FTP transfer did not complete successfully".into()));
            }
            session.quit()?;
            Ok(n)
        }
        Scheme::File => {
            let sock = broker.ok_or_else(|| FetchError::Protocol("file transfer requires a broker socket".into()))?;
            crate::file::fetch(sock, url, offset, dst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_filename_from_path() {
        let url = Url::parse("http://a/dir/file.txt").unwrap();
        assert_eq!(output_filename(&url, None).unwrap(), "file.txt");
    }

    #[test]
    fn output_filename_explicit_wins() {
        let url = Url::parse("http://a/dir/file.txt").unwrap();
        assert_eq!(output_filename(&url, Some("-")).unwrap(), "-");
    }

    #[test]
    fn output_filename_empty_path_errors() {
        let url = Url::parse("http://a").unwrap();
        assert!(output_filename(&url, None).is_err());
    }
}
