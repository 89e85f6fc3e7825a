//! The broker protocol: a length-prefixed typed-message frame carrying an
//! auxiliary 32-bit field and at most one passed file descriptor, plus the
//! parent (privileged, filesystem-only) and worker (networking-only)
//! sides of it.
//!
//! Framing is grounded on `send_message`/`read_message`/`stat_request`/
//! `fd_request` in `examples/original_source/util.c`; the parent/worker
//! split is grounded on `parent()`/`child()` in
//! `examples/original_source/main.c`. Descriptor passing is grounded on
//! `examples/plabayo-rama/examples/tcp_listener_fd_passing.rs`'s
//! `send_fd`/`recv_fd`, since stable Rust has no safe API for `SCM_RIGHTS`
//! ancillary data.

use crate::error::{FetchError, Result};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Message type tag, per spec §4.6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    Stat = 0,
    Open = 1,
}

impl MsgType {
    fn from_u8(b: u8) -> Result<MsgType> {
        match b {
            0 => Ok(MsgType::Stat),
            1 => Ok(MsgType::Open),
            other => Err(FetchError::Protocol(format!("unknown broker message type: {other}"))),
        }
    }
}

/// POSIX-style open flags understood by [`open_request`]/the parent's
/// `OPEN` handler, mirroring `open_req.flags` in `http.h`.
pub mod open_flags {
    pub const O_RDONLY: i32 = libc::O_RDONLY;
    pub const O_WRONLY: i32 = libc::O_WRONLY;
    pub const O_CREAT: i32 = libc::O_CREAT;
    pub const O_APPEND: i32 = libc::O_APPEND;
    pub const O_TRUNC: i32 = libc::O_TRUNC;
}

const HEADER_LEN: usize = 9;
const MAX_PAYLOAD: usize = 4096 - HEADER_LEN;

/// Sends one frame: 1-byte type, 4-byte little-endian auxiliary field,
/// 4-byte little-endian payload length, payload bytes, and (if given) a
/// passed descriptor — all in a single `sendmsg(2)` call, mirroring
/// `send_message()`'s all-at-once `imsg_compose`/`imsg_flush`.
pub fn send_message(sock: &UnixStream, msg_type: MsgType, aux: i32, payload: &[u8], fd: Option<RawFd>) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FetchError::Protocol("broker payload too large".into()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(msg_type as u8);
    buf.extend_from_slice(&aux.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);

    match fd {
        Some(fd) => send_with_fd(sock.as_raw_fd(), &buf, fd).map_err(FetchError::Broker),
        None => {
            let mut iov = libc::iovec {
                iov_base: buf.as_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            };
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            let rc = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, 0) };
            if rc < 0 {
                return Err(FetchError::Broker(io::Error::last_os_error()));
            }
            Ok(())
        }
    }
}

fn send_with_fd(sock_fd: RawFd, payload: &[u8], fd: RawFd) -> io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as libc::c_uint) };
    let mut cmsg_buf = vec![0u8; cmsg_space as usize];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(io::Error::other("failed to get CMSG_FIRSTHDR"));
    }
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as libc::c_uint) as _;
        std::ptr::copy_nonoverlapping(&fd as *const RawFd, libc::CMSG_DATA(cmsg) as *mut RawFd, 1);
    }

    let rc = unsafe { libc::sendmsg(sock_fd, &msg, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A received frame.
pub struct Frame {
    pub msg_type: MsgType,
    pub aux: i32,
    pub payload: Vec<u8>,
    pub fd: Option<OwnedFd>,
}

/// Reads one frame, blocking until it arrives, mirroring `read_message()`.
pub fn read_message(sock: &UnixStream) -> Result<Frame> {
    let mut buf = vec![0u8; 4096];
    let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as libc::c_uint) };
    let mut cmsg_buf = vec![0u8; cmsg_space as usize];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(FetchError::Broker(io::Error::last_os_error()));
    }
    if (n as usize) < HEADER_LEN {
        return Err(FetchError::Broker(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "broker connection closed mid-frame",
        )));
    }

    let msg_type = MsgType::from_u8(buf[0])?;
    let aux = i32::from_le_bytes(buf[1..5].try_into().unwrap());
    let len = u32::from_le_bytes(buf[5..9].try_into().unwrap()) as usize;
    if HEADER_LEN + len > n as usize {
        return Err(FetchError::Protocol("broker frame length mismatch".into()));
    }
    let payload = buf[HEADER_LEN..HEADER_LEN + len].to_vec();

    let fd = unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            None
        } else if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
            let fd_ptr = libc::CMSG_DATA(cmsg) as *const RawFd;
            Some(OwnedFd::from_raw_fd(*fd_ptr))
        } else {
            None
        }
    };

    Ok(Frame {
        msg_type,
        aux,
        payload,
        fd,
    })
}

// ---- worker side -----------------------------------------------------

/// Sends a `STAT(path)` request and returns the remote file size, per spec
/// §4.6. The worker blocks for exactly one reply before proceeding.
pub fn stat_request(sock: &UnixStream, path: &str) -> Result<u64> {
    send_message(sock, MsgType::Stat, 0, path.as_bytes(), None)?;
    let frame = read_message(sock)?;
    if frame.aux != 0 {
        return Err(FetchError::Broker(std::io::Error::from_raw_os_error(frame.aux)));
    }
    if frame.payload.len() != 8 {
        return Err(FetchError::Protocol("malformed STAT reply payload".into()));
    }
    Ok(u64::from_le_bytes(frame.payload.try_into().unwrap()))
}

/// Sends an `OPEN(path, flags)` request and returns the passed-back
/// descriptor as a `File`, per spec §4.6.
pub fn open_request(sock: &UnixStream, path: &str, flags: i32) -> Result<File> {
    send_message(sock, MsgType::Open, flags, path.as_bytes(), None)?;
    let frame = read_message(sock)?;
    if frame.aux != 0 {
        return Err(FetchError::Broker(std::io::Error::from_raw_os_error(frame.aux)));
    }
    let fd = frame
        .fd
        .ok_or_else(|| FetchError::Protocol("OPEN reply carried no descriptor".into()))?;
    Ok(File::from(fd))
}

// ---- parent side -------------------------------------------------------

/// Serves one request on the parent side, per spec §4.6 and `parent()` in
/// `main.c`: `STAT` reads the path's size; `OPEN` creates/opens it (or
/// dups stdout for the literal filename `-`) with mode 0666. Failure to
/// open is fatal to the whole process — the parent can't keep serving a
/// worker whose output file it couldn't create — matching `main.c`'s
/// `err(1, "Can't open file %s", ...)`. `EISDIR` is just the errno that
/// shows up for an existing-directory target, not a reason to treat that
/// case as recoverable.
pub fn serve_one(sock: &UnixStream) -> Result<()> {
    let frame = read_message(sock)?;
    let path = String::from_utf8_lossy(&frame.payload).into_owned();

    match frame.msg_type {
        MsgType::Stat => {
            let (aux, size) = match std::fs::metadata(&path) {
                Ok(meta) => (0, meta.len()),
                Err(e) => (e.raw_os_error().unwrap_or(libc::EIO), 0),
            };
            send_message(sock, MsgType::Stat, aux, &size.to_le_bytes(), None)?;
        }
        MsgType::Open => {
            let flags = frame.aux;
            match open_for_broker(&path, flags) {
                Ok(file) => {
                    // SCM_RIGHTS duplicates the descriptor on receipt; `file`
                    // closes its own copy when it drops at the end of this arm.
                    send_message(sock, MsgType::Open, 0, &[], Some(file.as_raw_fd()))?;
                }
                Err(e) => {
                    let errno = e.raw_os_error().unwrap_or(libc::EIO);
                    log::error!("can't open file {path}: {e} (errno {errno})");
                    std::process::exit(1);
                }
            }
        }
    }
    Ok(())
}

fn open_for_broker(path: &str, flags: i32) -> io::Result<File> {
    if path == "-" {
        let fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        return Ok(unsafe { File::from_raw_fd(fd) });
    }

    if let Ok(meta) = std::fs::metadata(path) {
        if meta.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::EISDIR));
        }
    }

    let c_path = std::ffi::CString::new(path)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    let fd = unsafe { libc::open(c_path.as_ptr(), flags, 0o666) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Runs the parent's request loop until the worker closes its end of the
/// socket pair, per `parent()` in `main.c`.
pub fn run_parent(sock: &UnixStream) {
    loop {
        match serve_one(sock) {
            Ok(()) => continue,
            Err(FetchError::Broker(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                log::error!("broker parent error: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_roundtrip_over_socketpair() {
        let (worker, parent) = UnixStream::pair().unwrap();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut f = tmp.as_file();
        std::io::Write::write_all(&mut f, b"hello world").unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        let handle = std::thread::spawn(move || serve_one(&parent).unwrap());
        let size = stat_request(&worker, &path).unwrap();
        handle.join().unwrap();
        assert_eq!(size, 11);
    }

    #[test]
    fn stat_missing_file_reports_errno() {
        let (worker, parent) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || serve_one(&parent).unwrap());
        let result = stat_request(&worker, "/nonexistent/path/for/sure");
        handle.join().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn open_roundtrip_passes_working_descriptor() {
        let (worker, parent) = UnixStream::pair().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt").to_str().unwrap().to_string();

        let handle = std::thread::spawn(move || serve_one(&parent).unwrap());
        let mut file = open_request(
            &worker,
            &path,
            open_flags::O_WRONLY | open_flags::O_CREAT | open_flags::O_TRUNC,
        )
        .unwrap();
        handle.join().unwrap();

        use std::io::Write;
        file.write_all(b"via broker").unwrap();
        drop(file);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "via broker");
    }

    #[test]
    fn open_for_broker_directory_is_eisdir() {
        // Goes through `open_for_broker` directly rather than `serve_one`,
        // since a real OPEN failure now aborts the process (see
        // `serve_one`'s `MsgType::Open` arm).
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        let err = open_for_broker(&path, open_flags::O_RDONLY).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EISDIR));
    }
}
