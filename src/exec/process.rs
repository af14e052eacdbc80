//! Handles to running external processes.
//!
//! Every process is spawned with separate piped stdout and stderr. Stdout is pumped
//! into an unbounded channel in chunks of at most [`READ_CHUNK`] bytes so a caller can
//! take bounded, non-blocking reads without the child ever stalling on a full pipe.
//! Stderr is collected in the background and handed back once the process is reaped.

use std::borrow::Cow;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use super::error::ProcessError;

/// Maximum size of a single stdout chunk.
pub const READ_CHUNK: usize = 1024;

/// How long a terminated process gets to exit before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long the output streams may stay open after the process has exited.
pub const STREAM_GRACE: Duration = Duration::from_secs(5);

/// Arguments whose following value must never reach the logs.
const SECRET_FLAGS: &[&str] = &["--pass", "--password"];

/// An executable plus its ordered arguments.
///
/// Ordering is derived so that the shared task queue can break priority ties
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandSpec {
    pub executable: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The last argument, which identifies the target for every command this crate
    /// builds (the data file for imports, the target directory for extraction, the
    /// script or statement for SQL).
    pub fn target(&self) -> &str {
        self.args.last().map(String::as_str).unwrap_or(&self.executable)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable)?;
        let mut hide_next = false;
        for arg in &self.args {
            if hide_next {
                write!(f, " ***")?;
                hide_next = false;
            } else if SECRET_FLAGS.contains(&arg.as_str()) {
                write!(f, " {}", arg)?;
                hide_next = true;
            } else {
                write!(f, " {}", abbreviate(&redact_conninfo(arg)))?;
            }
        }
        Ok(())
    }
}

/// Longest argument shown in full by [`CommandSpec`]'s `Display`.
const MAX_SHOWN: usize = 120;

/// Shortens multi-line or very long text to its first line for log output.
pub fn abbreviate(text: &str) -> Cow<'_, str> {
    let first = text.lines().next().unwrap_or("");
    if first.len() == text.len() && text.len() <= MAX_SHOWN {
        return Cow::Borrowed(text);
    }
    let mut end = first.len().min(MAX_SHOWN);
    while !first.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}...", &first[..end]))
}

/// Masks `password=...` inside a libpq connection string.
fn redact_conninfo(arg: &str) -> String {
    if !arg.contains("password=") {
        return arg.to_string();
    }
    arg.split(' ')
        .map(|part| {
            if part.starts_with("password=") {
                "password=***"
            } else {
                part
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Everything a finished process produced.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Counts processes that have been spawned but not yet reaped.
#[derive(Debug, Default)]
pub struct ProcessTracker {
    live: AtomicUsize,
    peak: AtomicUsize,
    spawned: AtomicUsize,
}

impl ProcessTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Processes currently spawned and not yet reaped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live processes seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Total processes spawned.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn acquire(self: &Arc<Self>) -> LiveGuard {
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.spawned.fetch_add(1, Ordering::SeqCst);
        LiveGuard(Arc::clone(self))
    }
}

struct LiveGuard(Arc<ProcessTracker>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A running external process.
pub struct ProcessHandle {
    spec: CommandSpec,
    child: Child,
    stdout: mpsc::UnboundedReceiver<Vec<u8>>,
    stdout_closed: bool,
    stdout_pump: JoinHandle<()>,
    stderr: JoinHandle<Vec<u8>>,
    _live: LiveGuard,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("spec", &self.spec.to_string())
            .field("pid", &self.child.id())
            .finish()
    }
}

impl ProcessHandle {
    /// Launches `spec` with captured stdout and stderr.
    pub fn spawn(spec: &CommandSpec, tracker: &Arc<ProcessTracker>) -> Result<Self, ProcessError> {
        let mut child = Command::new(&spec.executable)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Launch {
                program: spec.executable.clone(),
                source,
            })?;
        let live = tracker.acquire();
        debug!("Spawned pid {:?}: {}", child.id(), spec);

        let (tx, rx) = mpsc::unbounded_channel();
        let out = child.stdout.take();
        let stdout_pump = tokio::spawn(async move {
            let Some(mut out) = out else { return };
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match out.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let err = child.stderr.take();
        let stderr = tokio::spawn(async move {
            let mut bytes = Vec::new();
            if let Some(mut err) = err {
                let _ = err.read_to_end(&mut bytes).await;
            }
            bytes
        });

        Ok(Self {
            spec: spec.clone(),
            child,
            stdout: rx,
            stdout_closed: false,
            stdout_pump,
            stderr,
            _live: live,
        })
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether stdout has reached end of file.
    pub fn output_closed(&self) -> bool {
        self.stdout_closed
    }

    /// Reads the next chunk of stdout, waiting at most `wait`.
    ///
    /// Returns `Ok(None)` once stdout is closed and
    /// [`ProcessError::OutputTimeout`] if nothing arrived in time.
    pub async fn read_output(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, ProcessError> {
        if self.stdout_closed {
            return Ok(None);
        }
        match timeout(wait, self.stdout.recv()).await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.stdout_closed = true;
                Ok(None)
            }
            Err(_) => Err(ProcessError::OutputTimeout(wait)),
        }
    }

    /// Exit status if the process has terminated, without blocking.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        Ok(self.child.try_wait()?)
    }

    /// Waits for the process to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        Ok(self.child.wait().await?)
    }

    /// Reads everything stdout has produced so far, waiting at most `wait` for the
    /// first chunk.
    ///
    /// Same results as [`read_output`](Self::read_output), except that all chunks
    /// already buffered are returned together.
    pub async fn read_available(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, ProcessError> {
        let Some(mut bytes) = self.read_output(wait).await? else {
            return Ok(None);
        };
        loop {
            match self.stdout.try_recv() {
                Ok(chunk) => bytes.extend_from_slice(&chunk),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.stdout_closed = true;
                    break;
                }
            }
        }
        Ok(Some(bytes))
    }

    /// Waits for exit and drains everything left on stdout and stderr.
    pub async fn finish(self) -> Result<ProcessOutput, ProcessError> {
        self.finish_within(STREAM_GRACE).await
    }

    /// Like [`finish`](Self::finish), but gives up on streams still open `grace`
    /// after exit. A descendant that inherited the pipes can hold them open
    /// indefinitely; whatever arrived until then is kept.
    pub async fn finish_within(mut self, grace: Duration) -> Result<ProcessOutput, ProcessError> {
        let status = self.child.wait().await?;
        let deadline = Instant::now() + grace;

        let mut stdout = Vec::new();
        loop {
            match timeout_at(deadline, self.stdout.recv()).await {
                Ok(Some(chunk)) => stdout.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(_) => {
                    warn!("stdout of {} still open after exit, not waiting for it", self.spec);
                    self.stdout_pump.abort();
                    break;
                }
            }
        }
        let stderr = match timeout_at(deadline, &mut self.stderr).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => {
                warn!("stderr of {} still open after exit, not waiting for it", self.spec);
                self.stderr.abort();
                Vec::new()
            }
        };
        Ok(ProcessOutput {
            status,
            stdout,
            stderr,
        })
    }

    /// Asks the process to stop, kills it if it does not, and reaps it.
    pub async fn terminate(mut self) -> Result<(), ProcessError> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        debug!("Terminating pid {:?}: {}", self.child.id(), self.spec);
        if !send_sigterm(&mut self.child) {
            let _ = self.child.start_kill();
        }
        if timeout(TERMINATE_GRACE, self.child.wait()).await.is_err() {
            let _ = self.child.start_kill();
            self.child.wait().await?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) -> bool {
    match child.id() {
        // SAFETY: the pid belongs to a child we have not reaped yet.
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) -> bool {
    child.start_kill().is_ok()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn test_display_redacts_secrets() {
        let spec = CommandSpec::new("pgfutter")
            .args(["--user", "postgres", "--pass", "hunter2", "csv", "/data/a.csv"]);
        let shown = spec.to_string();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("--pass ***"));

        let psql = CommandSpec::new("psql").arg("host=db password=hunter2 user=me");
        assert_eq!(psql.to_string(), "psql host=db password=*** user=me");
    }

    #[test]
    fn test_display_abbreviates_long_arguments() {
        let script = format!("-- header\n{}", "SELECT 1;\n".repeat(50));
        let spec = CommandSpec::new("psql").arg("-c").arg(script);
        assert_eq!(spec.to_string(), "psql -c -- header...");

        let long = "x".repeat(200);
        assert_eq!(abbreviate(&long).len(), MAX_SHOWN + 3);
        assert_eq!(abbreviate("short"), "short");
    }

    #[test]
    fn test_target_is_last_argument() {
        let spec = CommandSpec::new("unzip").args(["-o", "/a.zip", "-d", "/a"]);
        assert_eq!(spec.target(), "/a");
        assert_eq!(CommandSpec::new("true").target(), "true");
    }

    #[test]
    fn test_specs_order_by_executable_then_args() {
        let a = CommandSpec::new("a").arg("2");
        let b = CommandSpec::new("a").arg("10");
        let c = CommandSpec::new("b");
        assert!(b < a);
        assert!(a < c);
    }

    #[tokio::test]
    async fn test_finish_collects_both_streams() {
        let tracker = ProcessTracker::new();
        let handle = ProcessHandle::spawn(&sh("echo out; echo err >&2"), &tracker).unwrap();
        assert_eq!(tracker.live(), 1);

        let output = handle.finish().await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout_text(), "out\n");
        assert_eq!(output.stderr_text(), "err\n");
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn test_finish_gives_up_on_inherited_pipes() {
        let tracker = ProcessTracker::new();
        let handle =
            ProcessHandle::spawn(&sh("echo early; sleep 3 & echo late"), &tracker).unwrap();

        let started = std::time::Instant::now();
        let output = handle
            .finish_within(Duration::from_millis(200))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(output.success());
        assert!(output.stdout_text().starts_with("early\n"));
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn test_read_available_returns_everything_buffered() {
        let tracker = ProcessTracker::new();
        let mut handle = ProcessHandle::spawn(
            &sh("for i in 1 2 3 4; do printf '%1500s' x; done; sleep 5"),
            &tracker,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let bytes = handle
            .read_available(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes.len(), 6000);
        assert!(!handle.output_closed());
        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_output_times_out_without_data() {
        let tracker = ProcessTracker::new();
        let mut handle = ProcessHandle::spawn(&sh("sleep 5"), &tracker).unwrap();

        let err = handle
            .read_output(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::OutputTimeout(_)));

        handle.terminate().await.unwrap();
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn test_read_output_reports_closed_stream() {
        let tracker = ProcessTracker::new();
        let mut handle = ProcessHandle::spawn(&sh("printf hello"), &tracker).unwrap();

        let mut seen = Vec::new();
        while let Some(chunk) = handle.read_output(Duration::from_secs(5)).await.unwrap() {
            seen.extend(chunk);
        }
        assert_eq!(seen, b"hello");
        assert!(handle.output_closed());
        assert!(handle.finish().await.unwrap().stdout.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_stops_long_running_process() {
        let tracker = ProcessTracker::new();
        let mut handle = ProcessHandle::spawn(&sh("sleep 30"), &tracker).unwrap();
        assert!(handle.try_status().unwrap().is_none());

        handle.terminate().await.unwrap();
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.spawned(), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_names_program() {
        let tracker = ProcessTracker::new();
        let err = ProcessHandle::spawn(&CommandSpec::new("/nonexistent/tool"), &tracker).unwrap_err();
        match err {
            ProcessError::Launch { program, .. } => assert_eq!(program, "/nonexistent/tool"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tracker.spawned(), 0);
    }
}
