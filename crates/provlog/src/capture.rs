//! Tee capture of the process's stdout and stderr.
//!
//! Each stream's fd is replaced with the write end of a pipe; a tee thread
//! drains the pipe and writes every chunk to both the saved original fd and
//! a capture file, so the console and the archive observe the same bytes.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("stream capture is already active in this process")]
    AlreadyActive,
}

// fd redirection is process-global state; two captures would fight over
// fd 1 and fd 2.
static CAPTURE_ACTIVE: AtomicBool = AtomicBool::new(false);

pub struct StreamCapture {
    stdout: TeeHandle,
    stderr: TeeHandle,
}

impl StreamCapture {
    /// Redirect stdout and stderr through tee threads writing into the two
    /// capture files. Stays in effect until [`StreamCapture::disarm`] or
    /// drop.
    pub fn arm(stdout_path: &Path, stderr_path: &Path) -> Result<Self> {
        if CAPTURE_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::AlreadyActive.into());
        }
        let stdout = match TeeHandle::arm(libc::STDOUT_FILENO, stdout_path) {
            Ok(handle) => handle,
            Err(e) => {
                CAPTURE_ACTIVE.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let stderr = match TeeHandle::arm(libc::STDERR_FILENO, stderr_path) {
            Ok(handle) => handle,
            Err(e) => {
                let mut stdout = stdout;
                stdout.finish();
                CAPTURE_ACTIVE.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        Ok(Self { stdout, stderr })
    }

    /// Restore the original fds, wait for the tee threads to drain, and
    /// release the process-wide capture slot.
    pub fn disarm(mut self) {
        self.stdout.finish();
        self.stderr.finish();
        // Drop clears CAPTURE_ACTIVE.
    }
}

impl Drop for StreamCapture {
    fn drop(&mut self) {
        self.stdout.finish();
        self.stderr.finish();
        CAPTURE_ACTIVE.store(false, Ordering::SeqCst);
    }
}

struct TeeHandle {
    target: RawFd,
    saved: Option<OwnedFd>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl TeeHandle {
    fn arm(target: RawFd, capture_path: &Path) -> Result<Self> {
        let capture = File::create(capture_path)
            .with_context(|| format!("cannot create capture file: {}", capture_path.display()))?;
        flush_std(target);

        let saved = dup(target).context("cannot duplicate stream fd")?;
        let echo = saved.try_clone().context("cannot clone saved stream fd")?;
        let (read_end, write_end) = pipe().context("cannot create capture pipe")?;
        dup2(write_end.as_raw_fd(), target).context("cannot redirect stream fd")?;
        // `target` is now the only write end we keep; restoring it later
        // closes the pipe and lets the tee thread see EOF.
        drop(write_end);

        let source = File::from(read_end);
        let echo = File::from(echo);
        let thread = match std::thread::Builder::new()
            .name(format!("provlog-tee-{}", target))
            .spawn(move || tee_loop(source, echo, capture))
        {
            Ok(thread) => thread,
            Err(e) => {
                // Put the stream back before reporting; a redirected fd
                // with no drain would block the whole process.
                let _ = dup2(saved.as_raw_fd(), target);
                return Err(anyhow::Error::new(e).context("cannot spawn tee thread"));
            }
        };

        Ok(Self {
            target,
            saved: Some(saved),
            thread: Some(thread),
        })
    }

    /// Idempotent teardown: put the saved fd back and join the tee thread.
    fn finish(&mut self) {
        if let Some(saved) = self.saved.take() {
            flush_std(self.target);
            if let Err(e) = dup2(saved.as_raw_fd(), self.target) {
                warn!("cannot restore stream fd {}: {}", self.target, e);
            }
        }
        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("tee thread for fd {} failed: {}", self.target, e),
                Err(_) => warn!("tee thread for fd {} panicked", self.target),
            }
        }
    }
}

fn tee_loop(mut source: File, mut echo: File, mut capture: File) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        echo.write_all(&buf[..n])?;
        capture.write_all(&buf[..n])?;
    }
    capture.sync_all()?;
    Ok(())
}

/// Push any Rust-level buffered output through the current fd before it is
/// rewired or restored.
fn flush_std(target: RawFd) {
    if target == libc::STDOUT_FILENO {
        let _ = io::stdout().lock().flush();
    } else if target == libc::STDERR_FILENO {
        let _ = io::stderr().lock().flush();
    }
}

fn dup(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: dup returns a fresh descriptor we immediately take ownership of.
    let rc = unsafe { libc::dup(fd) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(rc) })
}

fn dup2(src: RawFd, dst: RawFd) -> io::Result<()> {
    // SAFETY: both descriptors are owned by this process for the call's duration.
    let rc = unsafe { libc::dup2(src, dst) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds points at a valid two-element array for the call.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: on success both descriptors are fresh and unowned elsewhere.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}
