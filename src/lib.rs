//! `fetchcore`: the networked retrieval core behind a privilege-separated
//! HTTP/HTTPS/FTP/file retriever. See `SPEC_FULL.md` for the full module
//! breakdown; this crate implements everything below the excluded CLI,
//! line editor, progress meter, and sandboxing layers.

extern crate chrono;
extern crate log;
extern crate rustls;
extern crate rustls_pki_types;

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod file;
pub mod ftp;
pub mod http;
pub mod logging;
pub mod transport;
pub mod url;

pub use error::{FetchError, Result};
