//! Child MCP server processes.
//!
//! A [`ChildSpawner`] starts a process and returns its raw pipes as
//! [`RawChildIo`]. [`ChildHandle::start`] then wires the background tasks:
//!
//! - a stdin writer fed by an unbounded queue, so writes land in call order
//!   without the caller awaiting;
//! - a stdout reader that runs the [`MessageFramer`] and hands envelopes to
//!   the single attached listener, if any;
//! - a stderr reader that logs each line;
//! - an exit waiter that publishes [`ChildState::Exited`] once the process is
//!   gone and the reader has drained.
//!
//! Dropping the last [`ChildHandle`] kills the process.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mcp_gateway_core::{Envelope, MessageFramer, write_newline_delimited};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader, DuplexStream};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::GatewayError;

const READ_CHUNK: usize = 64 * 1024;

/// How long the exit waiter lets the stdout reader drain after exit.
const STDOUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Conventional signal number reported for a killed in-memory child.
const SIGKILL: i32 = 9;

/// A structured child command line. Never re-tokenized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ChildCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Build from an argv array. Returns `None` for an empty array.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        Some(Self::new(program.clone()).args(rest.iter().cloned()))
    }

    /// Run `line` through the platform shell.
    pub fn shell(line: &str) -> Self {
        if cfg!(windows) {
            Self::new("cmd").arg("/C").arg(line)
        } else {
            Self::new("sh").arg("-c").arg(line)
        }
    }
}

impl fmt::Display for ChildCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    fn killed() -> Self {
        Self {
            code: None,
            signal: Some(SIGKILL),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code={code}"),
            (None, Some(signal)) => write!(f, "signal={signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Lifecycle of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Spawning,
    Idle,
    Active,
    Exited(ExitInfo),
}

/// What an attached listener receives.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    Message(Envelope),
    Exited(ExitInfo),
}

/// The process side of a freshly spawned child.
pub enum ChildProcess {
    Os(tokio::process::Child),
    /// Resolves when the in-memory peer exits; a dropped sender counts as exit.
    InMemory(oneshot::Receiver<ExitInfo>),
}

/// Raw I/O handles produced by a successful [`ChildSpawner::spawn`].
pub struct RawChildIo {
    pub pid: Option<u32>,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub process: ChildProcess,
}

/// Starts child processes.
///
/// `spawn` is synchronous so that the pool can check capacity and spawn
/// without a suspension point in between.
pub trait ChildSpawner: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// Returns [`GatewayError::Spawn`] if the process cannot be started.
    fn spawn(&self) -> Result<RawChildIo, GatewayError>;

    /// Human-readable command, for logs.
    fn describe(&self) -> String;
}

/// Spawns an OS process with piped stdio.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    command: ChildCommand,
}

impl CommandSpawner {
    pub fn new(command: ChildCommand) -> Self {
        Self { command }
    }
}

impl ChildSpawner for CommandSpawner {
    fn spawn(&self) -> Result<RawChildIo, GatewayError> {
        let spawn_error = |source| GatewayError::Spawn {
            command: self.command.to_string(),
            source,
        };

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .envs(self.command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(spawn_error)?;
        let pid = child.id();
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(spawn_error(std::io::Error::other("child stdio was not piped")));
        };

        tracing::debug!(command = %self.command, ?pid, "spawned child process");
        Ok(RawChildIo {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            process: ChildProcess::Os(child),
        })
    }

    fn describe(&self) -> String {
        self.command.to_string()
    }
}

/// Spawns in-memory children whose other end is handed out as a
/// [`MemoryPeer`]. Lets pool and bridge logic run without real processes.
#[derive(Debug)]
pub struct MemorySpawner {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    fail: AtomicBool,
}

impl MemorySpawner {
    /// Returns the spawner and the stream of peers, one per spawn.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                fail: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Make subsequent spawns fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl ChildSpawner for MemorySpawner {
    fn spawn(&self) -> Result<RawChildIo, GatewayError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Spawn {
                command: self.describe(),
                source: std::io::Error::other("spawning disabled"),
            });
        }
        let (gateway_stdin, peer_stdin) = tokio::io::duplex(READ_CHUNK);
        let (peer_stdout, gateway_stdout) = tokio::io::duplex(READ_CHUNK);
        let (exit_tx, exit_rx) = oneshot::channel();
        let _ = self.peers.send(MemoryPeer {
            stdin: BufReader::new(peer_stdin),
            stdout: peer_stdout,
            exit: exit_tx,
        });
        Ok(RawChildIo {
            pid: None,
            stdin: Box::new(gateway_stdin),
            stdout: Box::new(gateway_stdout),
            stderr: None,
            process: ChildProcess::InMemory(exit_rx),
        })
    }

    fn describe(&self) -> String {
        "<in-memory>".to_string()
    }
}

/// The child side of an in-memory spawn.
pub struct MemoryPeer {
    stdin: BufReader<DuplexStream>,
    stdout: DuplexStream,
    exit: oneshot::Sender<ExitInfo>,
}

impl MemoryPeer {
    /// Next line the gateway wrote to this child's stdin, decoded.
    /// Returns `None` once stdin is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        let mut line = String::new();
        loop {
            line.clear();
            match self.stdin.read_line(&mut line).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim()) {
                        if let Ok(env) = Envelope::from_value(value) {
                            return Some(env);
                        }
                    }
                }
            }
        }
    }

    pub async fn send(&mut self, envelope: &Envelope) -> std::io::Result<()> {
        write_newline_delimited(&mut self.stdout, &envelope.to_line()).await
    }

    /// Write arbitrary text to the child's stdout.
    pub async fn write_raw(&mut self, text: &str) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.stdout.write_all(text.as_bytes()).await?;
        self.stdout.flush().await
    }

    /// Exit with `code`, closing stdout.
    pub fn exit(self, code: i32) {
        let _ = self.exit.send(ExitInfo::code(code));
    }
}

type ListenerSlot = Mutex<Option<mpsc::UnboundedSender<ChildEvent>>>;

fn deliver(slot: &ListenerSlot, event: ChildEvent) {
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    match guard.as_ref() {
        Some(tx) => {
            if tx.send(event).is_err() {
                *guard = None;
            }
        }
        None => {
            if let ChildEvent::Message(env) = event {
                tracing::debug!(method = ?env.method(), "no listener attached; dropping child message");
            }
        }
    }
}

struct Inner {
    id: u64,
    pid: Option<u32>,
    stdin: mpsc::UnboundedSender<String>,
    listener: Arc<ListenerSlot>,
    state: Arc<watch::Sender<ChildState>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    span: tracing::Span,
}

/// Shared handle to a running child.
#[derive(Clone)]
pub struct ChildHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for ChildHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildHandle")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl ChildHandle {
    /// Wire the background tasks for a freshly spawned child.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(id: u64, io: RawChildIo) -> Self {
        let span = tracing::info_span!("child", id, pid = ?io.pid);
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ChildState::Spawning);
        let state = Arc::new(state_tx);
        let listener: Arc<ListenerSlot> = Arc::new(Mutex::new(None));
        let (kill_tx, kill_rx) = oneshot::channel();
        let in_memory = matches!(io.process, ChildProcess::InMemory(_));

        tokio::spawn(write_stdin(io.stdin, stdin_rx).instrument(span.clone()));
        let reader = tokio::spawn(read_stdout(io.stdout, Arc::clone(&listener)).instrument(span.clone()));
        if let Some(stderr) = io.stderr {
            tokio::spawn(log_stderr(stderr).instrument(span.clone()));
        }
        tokio::spawn(
            wait_exit(
                io.process,
                kill_rx,
                reader,
                Arc::clone(&state),
                Arc::clone(&listener),
                in_memory,
            )
            .instrument(span.clone()),
        );

        state.send_if_modified(|s| {
            if *s == ChildState::Spawning {
                *s = ChildState::Idle;
                true
            } else {
                false
            }
        });

        Self {
            inner: Arc::new(Inner {
                id,
                pid: io.pid,
                stdin: stdin_tx,
                listener,
                state,
                kill: Mutex::new(Some(kill_tx)),
                span,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn span(&self) -> &tracing::Span {
        &self.inner.span
    }

    pub fn state(&self) -> ChildState {
        *self.inner.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state(), ChildState::Exited(_))
    }

    /// Queue one envelope for the child's stdin.
    ///
    /// # Errors
    ///
    /// [`GatewayError::ChildGone`] after exit, [`GatewayError::StdinClosed`]
    /// if the writer task has stopped.
    pub fn send(&self, envelope: &Envelope) -> Result<(), GatewayError> {
        if !self.is_alive() {
            return Err(GatewayError::ChildGone { id: self.inner.id });
        }
        self.inner
            .stdin
            .send(envelope.to_line())
            .map_err(|_| GatewayError::StdinClosed { id: self.inner.id })
    }

    /// Become the only recipient of this child's output, replacing any
    /// previous listener. An already exited child reports exit immediately.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<ChildEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = self.inner.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if let ChildState::Exited(info) = self.state() {
            let _ = tx.send(ChildEvent::Exited(info));
        }
        *slot = Some(tx);
        rx
    }

    /// Stop delivering output to the current listener. Takes effect before
    /// this call returns.
    pub fn detach(&self) {
        *self.inner.listener.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn subscribe(&self) -> watch::Receiver<ChildState> {
        self.inner.state.subscribe()
    }

    /// Resolve once the child has exited.
    pub async fn exited(&self) -> ExitInfo {
        wait_for_exit(self.subscribe()).await
    }

    /// Ask the child to terminate. Idempotent.
    pub fn kill(&self) {
        if let Some(tx) = self.inner.kill.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
    }

    pub(crate) fn mark(&self, next: ChildState) {
        self.inner.state.send_if_modified(|s| {
            if matches!(s, ChildState::Exited(_)) || *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
    }
}

/// Wait on a state receiver until it reports exit.
pub async fn wait_for_exit(mut rx: watch::Receiver<ChildState>) -> ExitInfo {
    match rx.wait_for(|s| matches!(s, ChildState::Exited(_))).await {
        Ok(state) => match *state {
            ChildState::Exited(info) => info,
            _ => ExitInfo::default(),
        },
        Err(_) => ExitInfo::default(),
    }
}

async fn write_stdin(mut stdin: Box<dyn AsyncWrite + Send + Unpin>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = write_newline_delimited(&mut stdin, &line).await {
            tracing::warn!(error = %e, "failed to write to child stdin");
            break;
        }
    }
}

async fn read_stdout(mut stdout: Box<dyn AsyncRead + Send + Unpin>, listener: Arc<ListenerSlot>) {
    let mut framer = MessageFramer::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read child stdout");
                break;
            }
        };
        dispatch(framer.push_bytes(&buf[..n]), &listener);
    }
    dispatch(framer.flush(), &listener);
}

fn dispatch(frames: Vec<Result<Envelope, mcp_gateway_core::FrameError>>, listener: &ListenerSlot) {
    for frame in frames {
        match frame {
            Ok(envelope) => deliver(listener, ChildEvent::Message(envelope)),
            Err(e) => tracing::error!(raw = %e.raw_prefix, "{e}"),
        }
    }
}

async fn log_stderr(stderr: Box<dyn AsyncRead + Send + Unpin>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::error!("child stderr: {line}");
        }
    }
}

async fn wait_exit(
    process: ChildProcess,
    mut kill_rx: oneshot::Receiver<()>,
    mut reader: JoinHandle<()>,
    state: Arc<watch::Sender<ChildState>>,
    listener: Arc<ListenerSlot>,
    in_memory: bool,
) {
    // A dropped kill sender means every handle is gone: kill as well.
    let (info, grace) = match process {
        ChildProcess::Os(mut child) => {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    tracing::error!(error = %e, "failed to wait for child");
                    ExitInfo::default()
                }
            };
            (info, STDOUT_DRAIN_GRACE)
        }
        ChildProcess::InMemory(exit_rx) => tokio::select! {
            exit = exit_rx => (exit.unwrap_or_default(), STDOUT_DRAIN_GRACE),
            _ = &mut kill_rx => (ExitInfo::killed(), Duration::ZERO),
        },
    };

    if tokio::time::timeout(grace, &mut reader).await.is_err() {
        reader.abort();
        if !in_memory {
            tracing::debug!("stdout still open after exit; stopped reading");
        }
    }

    if info.success() {
        tracing::info!(code = ?info.code, signal = ?info.signal, "child exited");
    } else {
        tracing::warn!(code = ?info.code, signal = ?info.signal, "child exited");
    }
    state.send_replace(ChildState::Exited(info));
    deliver(&listener, ChildEvent::Exited(info));
}


#[cfg(test)]
mod tests {
    use super::*;
    use mcp_gateway_core::RequestId;
    use serde_json::json;

    async fn memory_child(id: u64) -> (ChildHandle, MemoryPeer) {
        let (spawner, mut peers) = MemorySpawner::new();
        let handle = ChildHandle::start(id, spawner.spawn().unwrap());
        let peer = peers.recv().await.unwrap();
        (handle, peer)
    }

    #[tokio::test]
    async fn writes_arrive_in_call_order() {
        let (child, mut peer) = memory_child(1).await;
        for i in 0..5 {
            child.send(&Envelope::request(i, "ping", None)).unwrap();
        }
        for i in 0..5 {
            let env = peer.recv().await.unwrap();
            assert_eq!(env.id(), Some(&RequestId::from(i)));
        }
    }

    #[tokio::test]
    async fn output_reaches_attached_listener_only() {
        let (child, mut peer) = memory_child(2).await;
        let mut events = child.attach();
        peer.write_raw("booting...\n").await.unwrap();
        peer.send(&Envelope::success(1.into(), json!({}))).await.unwrap();
        match events.recv().await.unwrap() {
            ChildEvent::Message(env) => assert!(env.is_response()),
            other => panic!("unexpected {other:?}"),
        }

        child.detach();
        peer.send(&Envelope::success(2.into(), json!({}))).await.unwrap();
        // Re-attaching must not see the message sent while detached.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut events = child.attach();
        peer.send(&Envelope::success(3.into(), json!({}))).await.unwrap();
        match events.recv().await.unwrap() {
            ChildEvent::Message(env) => assert_eq!(env.id(), Some(&RequestId::from(3))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn exit_is_reported_after_final_output() {
        let (child, mut peer) = memory_child(3).await;
        let mut events = child.attach();
        peer.send(&Envelope::notification("notifications/message", None)).await.unwrap();
        peer.exit(2);
        assert!(matches!(events.recv().await, Some(ChildEvent::Message(_))));
        assert_eq!(events.recv().await, Some(ChildEvent::Exited(ExitInfo::code(2))));
        assert_eq!(child.exited().await, ExitInfo::code(2));
        assert!(!child.is_alive());
        assert!(matches!(
            child.send(&Envelope::request(1, "ping", None)),
            Err(GatewayError::ChildGone { id: 3 })
        ));
    }

    #[tokio::test]
    async fn kill_reports_signal_exit() {
        let (child, _peer) = memory_child(4).await;
        child.kill();
        child.kill();
        let info = child.exited().await;
        assert_eq!(info.signal, Some(SIGKILL));
        let mut events = child.attach();
        assert_eq!(events.recv().await, Some(ChildEvent::Exited(info)));
    }

    #[tokio::test]
    async fn mark_never_overrides_exit() {
        let (child, peer) = memory_child(5).await;
        assert_eq!(child.state(), ChildState::Idle);
        child.mark(ChildState::Active);
        assert_eq!(child.state(), ChildState::Active);
        peer.exit(0);
        child.exited().await;
        child.mark(ChildState::Idle);
        assert!(matches!(child.state(), ChildState::Exited(_)));
    }

    #[test]
    fn command_display_and_argv() {
        let cmd = ChildCommand::from_argv(&["npx".into(), "-y".into(), "server".into()]).unwrap();
        assert_eq!(cmd.to_string(), "npx -y server");
        assert!(ChildCommand::from_argv(&[]).is_none());
        let shell = ChildCommand::shell("echo hi | cat");
        assert_eq!(shell.args.last().map(String::as_str), Some("echo hi | cat"));
    }

    #[test]
    fn exit_info_display() {
        assert_eq!(ExitInfo::code(1).to_string(), "code=1");
        assert_eq!(ExitInfo::killed().to_string(), "signal=9");
        assert_eq!(ExitInfo::default().to_string(), "unknown status");
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let spawner = CommandSpawner::new(ChildCommand::new("/nonexistent/mcp-server-binary"));
        assert!(matches!(spawner.spawn(), Err(GatewayError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn os_child_echoes_through_cat() {
        let spawner = CommandSpawner::new(ChildCommand::shell("echo 'starting up'; cat"));
        let child = ChildHandle::start(6, spawner.spawn().unwrap());
        let mut events = child.attach();
        child.send(&Envelope::request(42, "tools/list", None)).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        match event {
            Some(ChildEvent::Message(env)) => {
                assert!(env.is_request());
                assert_eq!(env.id(), Some(&RequestId::from(42)));
            }
            other => panic!("unexpected {other:?}"),
        }
        child.kill();
        let info = tokio::time::timeout(Duration::from_secs(5), child.exited()).await.unwrap();
        assert!(!info.success());
    }
}
