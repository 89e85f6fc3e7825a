//! `file://` transport: routes the source path through the broker for a
//! privileged read descriptor, then copies its bytes to the destination.
//!
//! Grounded on `examples/original_source/file.c`'s `file_request`/
//! `file_save`, which wrap the equivalent `fd_request`/`copy_file` pair.

use crate::broker::{self, open_flags};
use crate::error::{FetchError, Result};
use crate::url::Url;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

/// Opens `url.path` for reading via the broker and copies its bytes to
/// `dst`, per spec §4.5.
pub fn fetch<W: Write>(sock: &UnixStream, url: &Url, offset: u64, dst: &mut W) -> Result<u64> {
    let mut src = broker::open_request(sock, &url.path, open_flags::O_RDONLY)?;
    if offset > 0 {
        use std::io::{Seek, SeekFrom};
        src.seek(SeekFrom::Start(offset)).map_err(FetchError::Io)?;
    }

    let mut buf = [0u8; 65536];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).map_err(FetchError::Io)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).map_err(FetchError::Io)?;
        total += n as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn fetch_copies_whole_file() {
        let (worker, parent) = UnixStream::pair().unwrap();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"file contents here").unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        let handle = std::thread::spawn(move || broker::serve_one(&parent).unwrap());
        let url = Url {
            scheme: crate::url::Scheme::File,
            host: String::new(),
            port: String::new(),
            path,
            ipliteral: false,
            fname: None,
        };
        let mut out = Vec::new();
        let n = fetch(&worker, &url, 0, &mut out).unwrap();
        handle.join().unwrap();

        assert_eq!(n, 19);
        assert_eq!(out, b"file contents here");
    }

    #[test]
    fn fetch_resumes_from_offset() {
        let (worker, parent) = UnixStream::pair().unwrap();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        let handle = std::thread::spawn(move || broker::serve_one(&parent).unwrap());
        let url = Url {
            scheme: crate::url::Scheme::File,
            host: String::new(),
            port: String::new(),
            path,
            ipliteral: false,
            fname: None,
        };
        let mut out = Vec::new();
        fetch(&worker, &url, 5, &mut out).unwrap();
        handle.join().unwrap();

        assert_eq!(out, b"56789");
    }
}
