//! Process session: the child process and its duplexed byte stream.
//!
//! Two transports, selected once at startup:
//!
//! - **Pty** — the child runs attached to a pseudo-terminal of fixed
//!   dimensions (via `portable-pty`), so it believes it is on a real
//!   terminal and its own formatting passes through verbatim.
//! - **Raw** — plain stdin/stdout/stderr pipes, for builds of the target
//!   that write GBK to pipes; the proxy decodes and colorizes that output
//!   itself (see `decode`).
//!
//! Either way the session exposes one ordered chunk channel fed by a
//! dedicated blocking reader thread, a writer for forwarded input, and an
//! exit-wait. A pending blocking read cannot be cancelled cooperatively;
//! closing the session's handles is what unblocks it.

use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, PtySize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::types::{OutputChunk, ProxyError, ProxyOptions, Transport};

/// Buffered chunks between the reader thread and the proxy loop.
const CHUNK_CHANNEL_CAPACITY: usize = 64;
const READ_BUF_SIZE: usize = 4096;

enum ChildHandle {
    Pty(Box<dyn portable_pty::Child + Send + Sync>),
    Raw(std::process::Child),
}

impl ChildHandle {
    /// Blocking wait for child exit. Returns the exit code and whether the
    /// child exited cleanly.
    fn wait_blocking(self) -> std::io::Result<(bool, i64)> {
        match self {
            ChildHandle::Pty(mut child) => {
                let status = child.wait()?;
                Ok((status.success(), i64::from(status.exit_code())))
            }
            ChildHandle::Raw(mut child) => {
                let status = child.wait()?;
                Ok((status.success(), i64::from(status.code().unwrap_or(-1))))
            }
        }
    }
}

/// A live target process with its duplexed byte channel.
pub struct Session {
    writer: Option<Box<dyn Write + Send>>,
    output: Option<mpsc::Receiver<OutputChunk>>,
    child: Option<ChildHandle>,
    /// PTY master, held so `close` can release it and unblock a pending
    /// read. `None` for the raw transport.
    master: Option<Box<dyn portable_pty::MasterPty + Send>>,
    /// Kill handle usable after the child moved into the wait thread.
    killer: Option<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Launch the target and wire up its duplex channel.
    pub fn spawn(path: &str, options: &ProxyOptions) -> Result<Self, ProxyError> {
        if path.trim().is_empty() {
            return Err(ProxyError::Launch("target path is empty".into()));
        }
        match options.transport {
            Transport::Pty => Self::spawn_pty(path, options),
            Transport::Raw => Self::spawn_raw(path),
        }
    }

    fn spawn_pty(path: &str, options: &ProxyOptions) -> Result<Self, ProxyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProxyError::Launch(format!("openpty failed: {e}")))?;

        // CommandBuilder starts with an empty environment; copy the parent's
        // so the target behaves as if launched directly.
        let mut cmd = CommandBuilder::new(path);
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ProxyError::Launch(format!("spawn failed: {e}")))?;
        let pid = child.process_id();
        let killer = child.clone_killer();
        info!(pid, path, "target spawned on pty");

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ProxyError::Launch(format!("pty writer unavailable: {e}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProxyError::Launch(format!("pty reader unavailable: {e}")))?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        spawn_reader("pty-reader", reader, tx, None);

        Ok(Self {
            writer: Some(writer),
            output: Some(rx),
            child: Some(ChildHandle::Pty(child)),
            master: Some(pair.master),
            killer: Some(killer),
            pid,
        })
    }

    fn spawn_raw(path: &str) -> Result<Self, ProxyError> {
        let mut child = std::process::Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProxyError::Launch(format!("spawn failed: {e}")))?;
        let pid = child.id();
        info!(pid, path, "target spawned on raw pipes");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Launch("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Launch("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProxyError::Launch("child stderr unavailable".into()))?;

        // Both pipes feed one ordered channel; the combined stream is closed
        // only once the last pipe reaches end-of-stream.
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let open_pipes = Arc::new(AtomicUsize::new(2));
        spawn_reader("stdout-reader", stdout, tx.clone(), Some(open_pipes.clone()));
        spawn_reader("stderr-reader", stderr, tx, Some(open_pipes));

        Ok(Self {
            writer: Some(Box::new(stdin)),
            output: Some(rx),
            child: Some(ChildHandle::Raw(child)),
            master: None,
            killer: None,
            pid: Some(pid),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the ordered output chunk channel. Yields each chunk exactly once,
    /// ending with a single `Closed`.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputChunk>> {
        self.output.take()
    }

    /// Take the writer for the child's input. At most one writer exists, so
    /// forwarded lines can never interleave.
    pub fn take_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        self.writer.take()
    }

    /// Split off the exit waiter so it can run as its own task while the
    /// session keeps the kill handle. `None` once taken.
    pub fn take_exit(&mut self) -> Option<ExitWait> {
        self.child.take().map(|child| ExitWait { child })
    }

    /// Wait in place for the child to exit or for the shutdown signal.
    pub async fn wait(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), ProxyError> {
        match self.take_exit() {
            Some(exit) => exit.wait(shutdown).await,
            None => Ok(()),
        }
    }

    /// Release every handle: kill the child if it is still running and drop
    /// the writer and PTY master, which unblocks any pending read. Safe to
    /// call on every exit path; idempotent.
    pub fn close(&mut self) {
        if let Some(mut killer) = self.killer.take() {
            if let Err(e) = killer.kill() {
                // Already-exited children report an error here; nothing to do.
                debug!(error = %e, "kill on close");
            }
        }
        if let Some(ChildHandle::Raw(mut child)) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(error = %e, "kill on close");
            }
        }
        self.writer = None;
        self.master = None;
        self.output = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// The exit-wait half of a session.
pub struct ExitWait {
    child: ChildHandle,
}

impl ExitWait {
    /// Wait for the child to exit or for the shutdown signal.
    ///
    /// Abnormal exit is an `Exit` error; cancellation returns `Ok` and the
    /// caller is expected to `close` the session, which is what ends the
    /// detached wait thread.
    pub async fn wait(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ProxyError> {
        let wait_task = tokio::task::spawn_blocking(move || self.child.wait_blocking());
        tokio::select! {
            result = wait_task => {
                let (success, code) = result
                    .map_err(|e| ProxyError::Exit(format!("wait task failed: {e}")))?
                    .map_err(|e| ProxyError::Exit(format!("wait failed: {e}")))?;
                if success {
                    debug!("target exited cleanly");
                    Ok(())
                } else {
                    Err(ProxyError::Exit(format!("exit code {code}")))
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                debug!("exit wait cancelled");
                Ok(())
            }
        }
    }
}

/// Blocking reader thread: forwards chunks in read order, then reports the
/// terminal condition. `open_pipes` merges several pipes into one stream;
/// only the last pipe to finish emits the clean `Closed`.
fn spawn_reader(
    name: &str,
    mut reader: impl Read + Send + 'static,
    tx: mpsc::Sender<OutputChunk>,
    open_pipes: Option<Arc<AtomicUsize>>,
) {
    let builder = thread::Builder::new().name(name.to_string());
    let spawned = builder.spawn(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    let last = open_pipes
                        .as_ref()
                        .map_or(true, |n| n.fetch_sub(1, Ordering::SeqCst) == 1);
                    if last {
                        let _ = tx.blocking_send(OutputChunk::Closed(None));
                    }
                    return;
                }
                Ok(n) => {
                    if tx.blocking_send(OutputChunk::Data(buf[..n].to_vec())).is_err() {
                        // Proxy loop is gone; stop reading.
                        return;
                    }
                }
                Err(e) => {
                    if let Some(n) = open_pipes.as_ref() {
                        n.fetch_sub(1, Ordering::SeqCst);
                    }
                    let _ = tx.blocking_send(OutputChunk::Closed(Some(e)));
                    return;
                }
            }
        }
    });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn reader thread");
    }
}
