//! Error types for the retriever core.
//!
//! Errors are grouped into the four kinds described by the transfer-error
//! model: malformed input is fatal to the affected URL only, connect
//! failures are fatal to the URL, protocol violations are fatal to the
//! whole process (a misbehaving peer can't be trusted to frame bytes
//! correctly from here on), and transfer errors (short reads, failed
//! writes) are fatal to the URL.

/// Everything that can go wrong while resolving, connecting to, or
/// transferring a single URL.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    /// Malformed URL, unsupported scheme, or a filename that can't be
    /// derived from the URL. Fatal to the affected URL; the caller should
    /// continue with the next one.
    #[error("{0}")]
    Input(String),

    /// Name resolution or `connect()` failed, or the connect-timeout
    /// watchdog fired. `phase` names which step failed (`"resolve"`,
    /// `"socket"`, or `"connect"`), matching the granularity
    /// `examples/original_source/util.c`'s `tcp_connect` gives its own
    /// diagnostics.
    #[error("{phase} to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: String,
        phase: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A protocol violation: a malformed status line, a broken chunked
    /// stream, a mismatched multi-line FTP reply, a malformed EPSV reply.
    /// These are fatal to the whole process.
    #[error("{0}")]
    Protocol(String),

    /// A short read or a failed write to the destination.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The broker reported failure through its auxiliary `errno` field.
    #[error("broker request failed: {0}")]
    Broker(std::io::Error),

    /// Transparent passthrough for ordinary I/O errors that don't fit one
    /// of the categories above.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// `true` if this error should abort the whole process rather than
    /// just the current URL (spec §7: protocol errors only).
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(self, FetchError::Protocol(_))
    }

    /// The process exit code this error implies, per the contract in
    /// spec §6 (0 success, 1 generic error, 2 connect timeout). This enum
    /// never constructs the timeout case directly — the timeout watchdog
    /// calls `std::process::exit(2)` itself before unwinding ever happens —
    /// so every variant reachable here maps to 1.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
