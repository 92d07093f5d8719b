//! Scatter/gather response transmission with zero-copy file ranges
//!
//! A response is a sequence of segments: inline byte buffers (envelope and
//! per-partition headers) interleaved with file-range descriptors pointing
//! into segment `.log` files. Inline segments are written normally; file
//! ranges are resolved with `sendfile(2)` straight from the page cache to
//! the socket, falling back to positioned reads plus writes where sendfile
//! is unavailable. Either path produces identical bytes on the wire.
//!
//! A descriptor with `bytes == 0` is never handed to the OS: zero length
//! has a special meaning at the sendfile layer, so empty ranges are skipped
//! before transmission.

use crate::error::{Result, VgError};
use crate::storage::fd_cache::FdCache;
use crate::storage::segment::{pread_exact_at, FileSlice};
use bytes::Bytes;
use std::fs::File;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Chunk size for the userspace fallback path
const FALLBACK_CHUNK: usize = 64 * 1024;

/// One piece of an assembled response
#[derive(Debug, Clone)]
pub enum ResponseSegment {
    /// Encoded bytes written from memory
    Inline(Bytes),
    /// A byte range of a segment file, transferred without copying
    FileRange(FileSlice),
}

/// Write all segments to the socket in order
pub async fn write_segments(
    stream: &mut TcpStream,
    segments: &[ResponseSegment],
    fd_cache: &FdCache,
) -> Result<()> {
    for segment in segments {
        match segment {
            ResponseSegment::Inline(bytes) => {
                stream.write_all(bytes).await?;
            }
            ResponseSegment::FileRange(slice) => {
                if slice.bytes == 0 {
                    continue;
                }
                let file = fd_cache.get(&slice.path)?;
                send_file_range(stream, file, slice).await?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn send_file_range(
    stream: &mut TcpStream,
    file: Arc<File>,
    slice: &FileSlice,
) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let socket_fd = stream.as_raw_fd();
    let mut offset = slice.position;
    let mut remaining = slice.bytes as usize;

    while remaining > 0 {
        let task_file = file.clone();
        let result = tokio::task::spawn_blocking(move || {
            sendfile_once(socket_fd, &task_file, offset, remaining)
        })
        .await
        .map_err(|e| VgError::Protocol(format!("sendfile task panicked: {e}")))?;

        match result {
            Ok(0) => {
                return Err(VgError::Corrupt(format!(
                    "segment {} shrank under a fetch response",
                    slice.path.display()
                )));
            }
            Ok(sent) => {
                offset += sent as u64;
                remaining -= sent;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                stream.writable().await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) if is_sendfile_unsupported(&e) => {
                debug!(error = %e, "sendfile unavailable, using userspace copy");
                return copy_file_range(
                    stream,
                    &file,
                    offset,
                    remaining,
                )
                .await;
            }
            Err(e) => {
                warn!(
                    path = %slice.path.display(),
                    offset,
                    remaining,
                    error = %e,
                    "sendfile transfer failed"
                );
                return Err(e.into());
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn send_file_range(
    stream: &mut TcpStream,
    file: Arc<File>,
    slice: &FileSlice,
) -> Result<()> {
    copy_file_range(stream, &file, slice.position, slice.bytes as usize).await
}

/// One sendfile call; the caller loops over partial transfers
#[cfg(target_os = "linux")]
fn sendfile_once(
    socket_fd: std::os::unix::io::RawFd,
    file: &File,
    offset: u64,
    count: usize,
) -> std::io::Result<usize> {
    use std::os::unix::io::AsRawFd;

    let mut off = offset as libc::off_t;
    let result = unsafe { libc::sendfile(socket_fd, file.as_raw_fd(), &mut off, count) };
    if result < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

/// macOS sendfile takes the length in-out and the offset by value
#[cfg(target_os = "macos")]
fn sendfile_once(
    socket_fd: std::os::unix::io::RawFd,
    file: &File,
    offset: u64,
    count: usize,
) -> std::io::Result<usize> {
    use std::os::unix::io::AsRawFd;

    let mut len = count as libc::off_t;
    let result = unsafe {
        libc::sendfile(
            file.as_raw_fd(),
            socket_fd,
            offset as libc::off_t,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if result < 0 {
        let err = std::io::Error::last_os_error();
        // EAGAIN with progress still moved bytes
        if err.raw_os_error() == Some(libc::EAGAIN) && len > 0 {
            return Ok(len as usize);
        }
        Err(err)
    } else {
        Ok(len as usize)
    }
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "macos"))))]
fn sendfile_once(
    _socket_fd: std::os::unix::io::RawFd,
    _file: &File,
    _offset: u64,
    _count: usize,
) -> std::io::Result<usize> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "sendfile not supported on this platform",
    ))
}

#[cfg(unix)]
fn is_sendfile_unsupported(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ENOSYS) | Some(libc::EINVAL) | Some(libc::EOPNOTSUPP)
    ) || e.kind() == std::io::ErrorKind::Unsupported
}

/// Userspace fallback: positioned reads plus ordinary socket writes,
/// byte-for-byte identical to the sendfile path.
async fn copy_file_range(
    stream: &mut TcpStream,
    file: &File,
    mut offset: u64,
    mut remaining: usize,
) -> Result<()> {
    let mut chunk = vec![0u8; FALLBACK_CHUNK.min(remaining)];
    while remaining > 0 {
        let take = FALLBACK_CHUNK.min(remaining);
        pread_exact_at(file, &mut chunk[..take], offset)?;
        stream.write_all(&chunk[..take]).await?;
        offset += take as u64;
        remaining -= take;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_interleaved_segments_arrive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.log");
        std::fs::write(&path, b"0123456789abcdef").unwrap();

        let (mut tx, mut rx) = socket_pair().await;
        let cache = FdCache::default();

        let segments = vec![
            ResponseSegment::Inline(Bytes::from_static(b"HDR|")),
            ResponseSegment::FileRange(FileSlice {
                path: path.clone(),
                position: 4,
                bytes: 6,
            }),
            ResponseSegment::Inline(Bytes::from_static(b"|MID|")),
            // Zero-byte ranges are skipped entirely
            ResponseSegment::FileRange(FileSlice {
                path: path.clone(),
                position: 0,
                bytes: 0,
            }),
            ResponseSegment::FileRange(FileSlice {
                path,
                position: 0,
                bytes: 4,
            }),
        ];

        let writer = tokio::spawn(async move {
            write_segments(&mut tx, &segments, &cache).await.unwrap();
        });

        let mut received = vec![0u8; 19];
        rx.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"HDR|456789|MID|0123");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_large_range_survives_backpressure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let (mut tx, mut rx) = socket_pair().await;
        let cache = FdCache::default();
        let bytes = payload.len() as u64;
        let segments = vec![ResponseSegment::FileRange(FileSlice {
            path,
            position: 0,
            bytes,
        })];

        let writer = tokio::spawn(async move {
            write_segments(&mut tx, &segments, &cache).await.unwrap();
        });

        let mut received = Vec::with_capacity(payload.len());
        let mut buf = [0u8; 8192];
        while received.len() < payload.len() {
            let n = rx.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, payload);
        writer.await.unwrap();
    }
}
