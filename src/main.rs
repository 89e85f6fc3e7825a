//! Minimal positional-argument driver and the `fork()`/`socketpair()` role
//! split described in spec.md §4.6/§5 and SPEC_FULL.md §0.
//!
//! Flag parsing, the line editor, the progress meter, and environment
//! reading proper are out of scope (spec.md §1); this is just enough of a
//! stand-in for those to drive `fetchcore` end to end — one `WorkerConfig`
//! built from bare `std::env::args()`, and the env lookups for
//! `http_proxy`/`ftp_proxy` handed to `fetchcore::config::parse_proxy_env`.
//! Grounded on `examples/original_source/main.c`'s `main`/`parent`/`child`,
//! adapted to a plain `fork()` instead of a re-exec.

use fetchcore::broker::{self, open_flags};
use fetchcore::config::{AddressFamily, PassiveMode, WorkerConfig};
use fetchcore::url::Url;
use fetchcore::{dispatch, logging};
use std::os::unix::net::UnixStream;
use std::process;
use std::time::Duration;

fn parse_args() -> (Vec<String>, WorkerConfig) {
    let mut cfg = WorkerConfig::default();
    let mut urls = Vec::new();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-o" => cfg.output = args.next(),
            "-A" => match args.next().as_deref() {
                Some("inet") => cfg.address_family = AddressFamily::V4Only,
                Some("inet6") => cfg.address_family = AddressFamily::V6Only,
                Some(other) => {
                    eprintln!("fetchcore: unknown address family `{other}'");
                    process::exit(1);
                }
                None => {
                    eprintln!("fetchcore: -A requires an argument");
                    process::exit(1);
                }
            },
            "-C" => cfg.resume = true,
            "-v" => cfg.verbose = true,
            "-w" => match args.next().and_then(|s| s.parse::<u64>().ok()) {
                Some(0) | None => {}
                Some(secs) => cfg.connect_timeout = Some(Duration::from_secs(secs)),
            },
            other => urls.push(other.to_string()),
        }
    }

    (urls, cfg)
}

fn resolve_proxies(cfg: &mut WorkerConfig) {
    for (name, field) in [
        ("http_proxy", &mut cfg.http_proxy),
        ("ftp_proxy", &mut cfg.ftp_proxy),
    ] {
        if let Ok(value) = std::env::var(name) {
            match fetchcore::config::parse_proxy_env(&value) {
                Ok(proxy) => *field = proxy,
                Err(e) => {
                    eprintln!("fetchcore: {name}: {e}");
                    process::exit(1);
                }
            }
        }
    }
}

/// Transfers one URL, opening its local destination through the broker
/// (the worker itself has no filesystem write access), per spec §6's
/// file-output semantics and §4.6.
fn transfer_one(
    raw: &str,
    cfg: &WorkerConfig,
    passive: &PassiveMode,
    broker_sock: &UnixStream,
) -> fetchcore::Result<u64> {
    let url = Url::parse(raw)?;
    let fname = dispatch::output_filename(&url, cfg.output.as_deref())?;

    logging::log_transfer_start(raw);

    let (offset, mut dst) = if fname == "-" {
        let f = broker::open_request(broker_sock, "-", open_flags::O_WRONLY)?;
        (0u64, f)
    } else if cfg.resume {
        let existing = broker::stat_request(broker_sock, &fname).unwrap_or(0);
        let flags = open_flags::O_WRONLY | open_flags::O_CREAT | open_flags::O_APPEND;
        let f = broker::open_request(broker_sock, &fname, flags)?;
        (existing, f)
    } else {
        let flags = open_flags::O_WRONLY | open_flags::O_CREAT | open_flags::O_TRUNC;
        let f = broker::open_request(broker_sock, &fname, flags)?;
        (0u64, f)
    };

    let n = dispatch::transfer(&url, cfg, offset, passive, Some(broker_sock), &mut dst)?;
    logging::log_transfer_end(raw, offset + n, true);
    Ok(n)
}

/// The worker role: processes every URL in sequence, per spec §5 ("the
/// worker handles each URL sequentially; no per-URL threads"). Input,
/// connect, and transfer errors are logged and the loop continues to the
/// next URL (spec §7); a protocol error aborts the whole process.
fn run_worker(urls: &[String], cfg: &WorkerConfig, broker_sock: UnixStream) -> i32 {
    logging::init(cfg.verbose);
    let passive = PassiveMode::new(cfg.active_mode);
    let mut exit_code = 0;

    for raw in urls {
        if let Err(e) = transfer_one(raw, cfg, &passive, &broker_sock) {
            logging::log_transfer_end(raw, 0, false);
            log::error!("{raw}: {e}");
            if e.is_fatal_to_process() {
                return e.exit_code();
            }
            exit_code = e.exit_code();
        }
    }
    exit_code
}

/// `WIFEXITED`/`WEXITSTATUS` aren't functions in `libc` (they're C macros);
/// these mirror glibc's definitions directly since the target is Linux.
fn wifexited(status: i32) -> bool {
    status & 0x7f == 0
}

fn wexitstatus(status: i32) -> i32 {
    (status >> 8) & 0xff
}

fn main() {
    let (urls, mut cfg) = parse_args();
    resolve_proxies(&mut cfg);

    if urls.is_empty() {
        eprintln!("usage: fetchcore [-Cv] [-o file] [-A inet|inet6] [-w secs] url ...");
        process::exit(1);
    }

    let (worker_sock, parent_sock) = match UnixStream::pair() {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("fetchcore: socketpair failed: {e}");
            process::exit(1);
        }
    };

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        eprintln!("fetchcore: fork failed: {}", std::io::Error::last_os_error());
        process::exit(1);
    }

    if pid == 0 {
        drop(parent_sock);
        let code = run_worker(&urls, &cfg, worker_sock);
        process::exit(code);
    }

    drop(worker_sock);
    broker::run_parent(&parent_sock);

    let mut status: libc::c_int = 0;
    unsafe {
        libc::waitpid(pid, &mut status, 0);
    }
    let code = if wifexited(status) { wexitstatus(status) } else { 1 };
    process::exit(code);
}
