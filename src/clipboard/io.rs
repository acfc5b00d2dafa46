use anyhow::{Context, Result, bail};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::{Duration, Instant};

/// Writes of at most this size never block once poll reports POLLOUT on a pipe
const PIPE_CHUNK: usize = 4096;

fn poll_timeout(timeout: Duration) -> PollTimeout {
    let ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
    PollTimeout::from(ms)
}

fn wait_for(fd: BorrowedFd<'_>, flags: PollFlags, timeout: Duration) -> Result<bool> {
    let mut fds = [PollFd::new(fd, flags)];
    match poll(&mut fds, poll_timeout(timeout)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        // A signal arrived; callers re-check their run flag and come back
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e).context("poll failed"),
    }
}

/// Block until `fd` is readable (or hung up) or `timeout` passes
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> Result<bool> {
    wait_for(fd, PollFlags::POLLIN, timeout)
}

/// Drain the read end of a transfer pipe.
///
/// The first chunk may take `first_timeout` to show up, every later one
/// `next_timeout`. Stops at end-of-file, at a timeout, or once `cap` bytes are
/// in hand. Whatever arrived before a timeout is returned; an owner that
/// never writes yields an empty buffer, which callers treat as no selection.
pub fn read_pipe(
    read: OwnedFd,
    cap: usize,
    first_timeout: Duration,
    next_timeout: Duration,
) -> Result<Vec<u8>> {
    let mut file = File::from(read);
    let mut result = Vec::new();
    let mut buf = [0u8; 8192];
    let mut timeout = first_timeout;

    loop {
        if !wait_readable(file.as_fd(), timeout)? {
            log::debug!(
                "Transfer stalled after {} bytes ({:?} without data)",
                result.len(),
                timeout
            );
            break;
        }

        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let take = n.min(cap - result.len());
                result.extend_from_slice(&buf[..take]);
                if result.len() >= cap {
                    log::debug!("Transfer reached the {} byte cap, truncating", cap);
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("error reading from pipe"),
        }

        timeout = next_timeout;
    }

    Ok(result)
}

/// Write `data` to a paste requester's fd without ever blocking longer than
/// `timeout` on a single chunk. The fd is closed on return.
pub fn write_all_bounded(fd: OwnedFd, data: &[u8], timeout: Duration) -> Result<()> {
    let mut file = File::from(fd);
    let started = Instant::now();
    let mut written = 0;

    while written < data.len() {
        if !wait_for(file.as_fd(), PollFlags::POLLOUT, timeout)? {
            bail!(
                "paste target stopped reading after {} of {} bytes ({:?})",
                written,
                data.len(),
                started.elapsed()
            );
        }

        let end = (written + PIPE_CHUNK).min(data.len());
        match file.write(&data[written..end]) {
            Ok(0) => bail!("paste target closed after {} bytes", written),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("error writing to paste target"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use pretty_assertions::assert_eq;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn test_read_pipe_until_eof() {
        let (read, write) = pipe().unwrap();
        let mut writer = File::from(write);
        writer.write_all(b"hello\nworld\x00").unwrap();
        drop(writer);

        let data = read_pipe(read, 1024, SHORT, SHORT).unwrap();
        assert_eq!(data, b"hello\nworld\x00".to_vec());
    }

    #[test]
    fn test_read_pipe_silent_owner_is_empty() {
        let (read, write) = pipe().unwrap();
        let started = Instant::now();
        let data = read_pipe(read, 1024, SHORT, SHORT).unwrap();
        assert!(data.is_empty());
        assert!(started.elapsed() >= SHORT);
        drop(write);
    }

    #[test]
    fn test_read_pipe_keeps_partial_data_on_stall() {
        let (read, write) = pipe().unwrap();
        let mut writer = File::from(write);
        writer.write_all(b"partial").unwrap();

        let data = read_pipe(read, 1024, SHORT, SHORT).unwrap();
        assert_eq!(data, b"partial".to_vec());
        drop(writer);
    }

    #[test]
    fn test_read_pipe_truncates_at_cap() {
        let (read, write) = pipe().unwrap();
        let mut writer = File::from(write);
        writer.write_all(&[b'z'; 10_000]).unwrap();
        drop(writer);

        let data = read_pipe(read, 4000, SHORT, SHORT).unwrap();
        assert_eq!(data.len(), 4000);
    }

    #[test]
    fn test_write_all_bounded_delivers_everything() {
        let (read, write) = pipe().unwrap();
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

        let reader = std::thread::spawn(move || {
            let mut out = Vec::new();
            File::from(read).read_to_end(&mut out).unwrap();
            out
        });

        write_all_bounded(write, &payload, Duration::from_secs(5)).unwrap();
        assert_eq!(reader.join().unwrap(), payload);
    }

    #[test]
    fn test_write_all_bounded_gives_up_on_stalled_reader() {
        let (read, write) = pipe().unwrap();
        // Far more than a pipe buffer, nobody reading
        let payload = vec![0u8; 1 << 20];
        assert!(write_all_bounded(write, &payload, SHORT).is_err());
        drop(read);
    }

    #[test]
    fn test_wait_readable_times_out() {
        let (read, _write) = pipe().unwrap();
        assert!(!wait_readable(read.as_fd(), Duration::from_millis(10)).unwrap());
    }
}
