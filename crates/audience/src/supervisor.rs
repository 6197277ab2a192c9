//! Runtime process supervisor.
//!
//! Launch sequence:
//! 1. Bind the channel listener at a fresh endpoint
//! 2. Spawn the runtime with `--channel <endpoint>` and the configured options
//! 3. Accept exactly one connection and hand it to a [`Controller`]
//!
//! An observer task owns the child for its whole life. When the child exits it
//! closes the listener, waits for the controller to close the connection, then
//! publishes the exit status.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::channel::transport::{ChannelEndpoint, ChannelListener};
use crate::config::{ConfigError, LaunchOptions};
use crate::controller::Controller;

const RUNTIME_LOG_TARGET: &str = "audience::runtime";

/// Upper bound on waiting for the event loop to finish after the runtime exits.
const CONTROLLER_CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn {program}: {source}")]
    Io { program: String, source: io::Error },
    #[error("spawn failed: {0}")]
    Other(String),
}

/// What to start. Handed to a [`RuntimeSpawner`].
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Pipe stdout/stderr so the host can relay them.
    pub capture_output: bool,
}

/// Extension point for how the runtime process gets started.
pub trait RuntimeSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<Child, SpawnError>;
}

/// Starts the runtime as a plain child process.
pub struct ProcessSpawner;

impl RuntimeSpawner for ProcessSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<Child, SpawnError> {
        let output = || {
            if request.capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };

        Command::new(&request.program)
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Io {
                program: request.program.display().to_string(),
                source,
            })
    }
}

/// How the runtime process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeExit {
    /// `None` when terminated by a signal or when the status could not be read.
    pub code: Option<i32>,
    pub success: bool,
}

impl RuntimeExit {
    fn unknown() -> Self {
        Self {
            code: None,
            success: false,
        }
    }
}

impl From<ExitStatus> for RuntimeExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

impl fmt::Display for RuntimeExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("terminated without exit code"),
        }
    }
}

/// Resolves once the runtime has exited and the channel server is closed.
#[derive(Clone)]
pub struct ExitSignal {
    rx: watch::Receiver<Option<RuntimeExit>>,
}

impl ExitSignal {
    pub async fn wait(&self) -> RuntimeExit {
        let mut rx = self.rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            // Observer vanished without publishing.
            Err(_) => None,
        };
        exit.unwrap_or_else(RuntimeExit::unknown)
    }

    pub fn try_get(&self) -> Option<RuntimeExit> {
        *self.rx.borrow()
    }

    pub fn is_exited(&self) -> bool {
        self.try_get().is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind channel at {endpoint}: {source}")]
    Bind { endpoint: String, source: io::Error },
    #[error("failed to spawn runtime: {0}")]
    Spawn(#[from] SpawnError),
    #[error("failed to accept runtime connection: {0}")]
    Accept(io::Error),
    #[error("runtime exited before connecting ({0})")]
    RuntimeExited(RuntimeExit),
    #[error("runtime did not connect within {0:?}")]
    ConnectTimeout(Duration),
}

/// A running runtime process and its connected controller.
pub struct Session {
    controller: Controller,
    exit: ExitSignal,
    kill: CancellationToken,
    endpoint: ChannelEndpoint,
}

impl Session {
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn exit_signal(&self) -> ExitSignal {
        self.exit.clone()
    }

    /// Wait for the runtime to exit.
    pub async fn wait(&self) -> RuntimeExit {
        self.exit.wait().await
    }

    /// Forcefully terminate the runtime. The exit signal still fires.
    pub fn kill(&self) {
        tracing::info!("Killing runtime process");
        self.kill.cancel();
    }

    pub fn endpoint(&self) -> &ChannelEndpoint {
        &self.endpoint
    }
}

/// Start the runtime and wait for it to connect.
pub async fn launch(options: LaunchOptions) -> Result<Session, LaunchError> {
    let program = options.resolve_runtime_path()?;
    let endpoint = options
        .endpoint
        .clone()
        .unwrap_or_else(ChannelEndpoint::generate);

    let listener = ChannelListener::bind(endpoint.clone()).map_err(|source| LaunchError::Bind {
        endpoint: endpoint.to_string(),
        source,
    })?;

    let request = SpawnRequest {
        program,
        args: options.runtime_args(&endpoint),
        capture_output: options.debug,
    };
    tracing::info!(program = %request.program.display(), args = ?request.args, "Spawning runtime");
    let mut child = options.spawner.spawn(&request)?;

    if options.debug {
        relay_output(&mut child);
    }

    let (accept_tx, accept_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = watch::channel(None);
    let kill = CancellationToken::new();
    let shutdown = CancellationToken::new();
    let exit = ExitSignal { rx: exit_rx };

    tokio::spawn(observe_runtime(
        child,
        listener,
        accept_tx,
        kill.clone(),
        shutdown.clone(),
        exit_tx,
    ));

    let accepted = match options.connect_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, accept_rx).await {
            Ok(accepted) => accepted,
            Err(_) => {
                tracing::error!(?timeout, "Runtime did not connect in time");
                kill.cancel();
                return Err(LaunchError::ConnectTimeout(timeout));
            }
        },
        None => accept_rx.await,
    };

    let controller = match accepted {
        Ok(Ok(controller)) => controller,
        Ok(Err(e)) => {
            kill.cancel();
            return Err(LaunchError::Accept(e));
        }
        // Observer gave up on accepting: the child is gone.
        Err(_) => {
            let status = exit.wait().await;
            tracing::error!(%status, "Runtime exited before connecting");
            return Err(LaunchError::RuntimeExited(status));
        }
    };

    tracing::info!(%endpoint, "Runtime connected");

    Ok(Session {
        controller,
        exit,
        kill,
        endpoint,
    })
}

enum Stop {
    Exited(io::Result<ExitStatus>),
    Kill,
}

async fn observe_runtime(
    mut child: Child,
    mut listener: ChannelListener,
    accept_tx: oneshot::Sender<io::Result<Controller>>,
    kill: CancellationToken,
    shutdown: CancellationToken,
    exit_tx: watch::Sender<Option<RuntimeExit>>,
) {
    let mut accept_tx = Some(accept_tx);
    let mut controller: Option<Controller> = None;

    let stop = loop {
        tokio::select! {
            status = child.wait() => break Stop::Exited(status),

            accepted = listener.accept(), if accept_tx.is_some() => {
                let accepted = accepted.map(|stream| {
                    let started = Controller::start(stream, shutdown.clone());
                    controller = Some(started.clone());
                    started
                });
                if let Some(tx) = accept_tx.take()
                    && tx.send(accepted).is_err()
                {
                    tracing::debug!("Launcher went away before runtime connected");
                }
            }

            _ = kill.cancelled() => break Stop::Kill,
        }
    };

    let status = match stop {
        Stop::Exited(status) => status,
        Stop::Kill => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, "Failed to kill runtime");
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => RuntimeExit::from(status),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read runtime exit status");
            RuntimeExit::unknown()
        }
    };

    if exit.success {
        tracing::info!(%exit, "Runtime exited");
    } else {
        tracing::warn!(%exit, "Runtime exited abnormally");
    }

    drop(listener);
    shutdown.cancel();
    if let Some(controller) = controller
        && tokio::time::timeout(CONTROLLER_CLOSE_GRACE, controller.closed())
            .await
            .is_err()
    {
        tracing::warn!(grace = ?CONTROLLER_CLOSE_GRACE, "Controller did not close in time");
    }
    drop(accept_tx);
    exit_tx.send_replace(Some(exit));
}

fn relay_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(relay_lines(stdout, false));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(relay_lines(stderr, true));
    }
}

async fn relay_lines<R: AsyncRead + Unpin>(source: R, is_stderr: bool) {
    let mut lines = BufReader::new(source).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => {
                tracing::warn!(target: RUNTIME_LOG_TARGET, "{}", line);
            }
            Ok(Some(line)) => {
                tracing::info!(target: RUNTIME_LOG_TARGET, "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Runtime output relay stopped");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::UnixStream;
    use tokio_util::codec::Framed;

    use crate::channel::codec::LineCodec;
    use crate::channel::protocol::{CommandResult, Message};
    use crate::config::{Nucleus, Platform};
    use crate::dispatcher::CommandError;

    /// Runs `sh -c <script>` instead of the real runtime.
    struct ScriptSpawner(&'static str);

    impl RuntimeSpawner for ScriptSpawner {
        fn spawn(&self, request: &SpawnRequest) -> Result<Child, SpawnError> {
            let mut command = Command::new("sh");
            command.args(["-c", self.0]).kill_on_drop(true);
            if request.capture_output {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            command
                .spawn()
                .map_err(|e| SpawnError::Other(e.to_string()))
        }
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<StdMutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    /// Connects an in-process fake runtime to the channel and keeps `sleep` as the child.
    #[derive(Default)]
    struct FakeRuntimeSpawner {
        args: StdMutex<Vec<OsString>>,
    }

    impl RuntimeSpawner for FakeRuntimeSpawner {
        fn spawn(&self, request: &SpawnRequest) -> Result<Child, SpawnError> {
            *self.args.lock().unwrap() = request.args.clone();

            let channel = request
                .args
                .iter()
                .position(|a| a == "--channel")
                .and_then(|i| request.args.get(i + 1))
                .cloned()
                .ok_or_else(|| SpawnError::Other("missing --channel".into()))?;

            tokio::spawn(async move {
                let stream = UnixStream::connect(channel).await.unwrap();
                let mut framed = Framed::new(stream, LineCodec::new());
                while let Some(Ok(Message::Command(command))) = framed.next().await {
                    let reply = match command.func.as_str() {
                        "window_list" => CommandResult::Succeeded {
                            id: command.id,
                            result: json!({"focused": -1, "windows": []}),
                        },
                        _ => CommandResult::Failed {
                            id: command.id,
                            reason: Some("unsupported".into()),
                        },
                    };
                    framed.send(Message::Result(reply)).await.unwrap();
                }
            });

            Command::new("sleep")
                .arg("30")
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| SpawnError::Other(e.to_string()))
        }
    }

    fn options_in(dir: &tempfile::TempDir) -> LaunchOptions {
        LaunchOptions::new()
            .with_runtime_path("/nonexistent/audience")
            .with_endpoint(ChannelEndpoint::at(dir.path().join("audience.sock")))
    }

    #[tokio::test]
    async fn runtime_exiting_before_connect_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let options = options_in(&dir).with_spawner(Arc::new(ScriptSpawner("exit 3")));

        match launch(options).await {
            Err(LaunchError::RuntimeExited(exit)) => {
                assert_eq!(exit.code, Some(3));
                assert!(!exit.success);
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("launch should fail"),
        }
        assert!(!dir.path().join("audience.sock").exists());
    }

    #[tokio::test]
    async fn missing_runtime_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let result = launch(options_in(&dir)).await;
        assert!(matches!(result, Err(LaunchError::Spawn(SpawnError::Io { .. }))));
    }

    #[tokio::test]
    async fn connect_timeout_kills_silent_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let options = options_in(&dir)
            .with_spawner(Arc::new(ScriptSpawner("sleep 30")))
            .with_connect_timeout(Duration::from_millis(100));

        assert!(matches!(
            launch(options).await,
            Err(LaunchError::ConnectTimeout(_))
        ));
    }

    #[tokio::test]
    async fn connected_session_serves_commands_until_killed() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = Arc::new(FakeRuntimeSpawner::default());
        let options = options_in(&dir)
            .with_load_order(Platform::Unix, vec![Nucleus::Webkit])
            .unwrap()
            .with_spawner(spawner.clone());

        let session = launch(options).await.unwrap();

        let args: Vec<String> = spawner
            .args
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "--channel");
        assert_eq!(&args[2..], ["--unix", "webkit"]);

        let windows = session.controller().window_list().await.unwrap();
        assert!(windows.windows.is_empty());
        assert!(matches!(
            session.controller().screen_list().await,
            Err(CommandError::Failed { reason: Some(_) })
        ));

        let signal = session.exit_signal();
        assert!(!signal.is_exited());

        session.kill();
        let exit = signal.wait().await;
        assert!(!exit.success);

        // Exit is only published after the channel server and connection are gone.
        assert!(!dir.path().join("audience.sock").exists());
        assert!(!session.controller().is_connected());
        assert!(session.controller().dispatcher().is_disconnected());
        assert!(matches!(
            session.controller().quit().await,
            Err(CommandError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn debug_mode_relays_runtime_output_to_log() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        // Current-thread runtime: the relay tasks run on this thread.
        let _guard = tracing::subscriber::set_default(subscriber);

        let dir = tempfile::tempdir().unwrap();
        let options = options_in(&dir)
            .with_debug(true)
            .with_spawner(Arc::new(ScriptSpawner("echo out; echo err >&2; exit 0")));

        match launch(options).await {
            Err(LaunchError::RuntimeExited(exit)) => {
                assert_eq!(exit.code, Some(0));
                assert!(exit.success);
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("launch should fail"),
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let text = loop {
            let text = logs.text();
            let relayed = text.contains("audience::runtime: out")
                && text.contains("audience::runtime: err");
            if relayed || tokio::time::Instant::now() >= deadline {
                break text;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        let line = |needle: &str| {
            text.lines()
                .find(|l| l.contains(needle))
                .unwrap_or_else(|| panic!("missing {needle:?} in log:\n{text}"))
                .to_string()
        };
        assert!(line("audience::runtime: out").contains("INFO"));
        assert!(line("audience::runtime: err").contains("WARN"));
    }
}
