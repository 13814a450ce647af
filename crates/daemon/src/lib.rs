use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long a child gets to exit after SIGTERM before it's killed outright.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// Events observed from a supervised child process. `Stdout` and `Stderr`
/// carry raw chunks as read from the pipes; consumers split lines as needed.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    Stdout(String),
    Stderr(String),
    Error(String),
    Close(Option<i32>),
}

/// A supervised child process: piped stdio fanned out over a channel,
/// optional respawn on unexpected exit, and graceful SIGTERM shutdown.
///
/// `Daemon` is cheaply cloneable so that a task observing its events can
/// also issue `shutdown`.
#[derive(Clone)]
pub struct Daemon {
    inner: Arc<Inner>,
}

struct Inner {
    program: String,
    args: Vec<String>,
    restart: bool,
    events: mpsc::UnboundedSender<DaemonEvent>,
    cancel: CancellationToken,
    watcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Daemon {
    /// Build a daemon for `program` with `args`. With `restart` the child is
    /// respawned whenever it exits before `shutdown` is requested.
    /// Returns the handle and the receiving side of its event channel.
    pub fn new<P: Into<String>>(
        program: P,
        args: Vec<String>,
        restart: bool,
    ) -> (Self, mpsc::UnboundedReceiver<DaemonEvent>) {
        let (events, rx) = mpsc::unbounded_channel();

        let daemon = Self {
            inner: Arc::new(Inner {
                program: program.into(),
                args,
                restart,
                events,
                cancel: CancellationToken::new(),
                watcher: Mutex::new(None),
            }),
        };
        (daemon, rx)
    }

    /// Spawn the child and begin watching it. Idempotent: a second call
    /// while the watcher is live is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let mut watcher = self.inner.watcher.lock().unwrap();
        if watcher.is_some() {
            return Ok(());
        }
        let child = self.spawn_child()?;
        tracing::info!(program = %self.inner.program, pid = child.id(), "daemon started");

        let this = self.clone();
        *watcher = Some(tokio::spawn(async move { this.watch(child).await }));
        Ok(())
    }

    /// Request a graceful stop and wait for the watcher (and so the child)
    /// to wind down. Safe to call repeatedly or before `start`.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let watcher = self.inner.watcher.lock().unwrap().take();
        if let Some(watcher) = watcher {
            if let Err(error) = watcher.await {
                tracing::error!(?error, "daemon watcher task failed");
            }
        }
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        Command::new(&self.inner.program)
            .args(&self.inner.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    fn emit(&self, event: DaemonEvent) {
        // The receiver may already be gone during unload.
        let _ = self.inner.events.send(event);
    }

    async fn watch(self, mut child: Child) {
        loop {
            let stdout = child.stdout.take().expect("stdout is piped");
            let stderr = child.stderr.take().expect("stderr is piped");
            let out = pump(stdout, &self, DaemonEvent::Stdout);
            let err = pump(stderr, &self, DaemonEvent::Stderr);

            // Ends with all borrows of `child` released, so the shutdown
            // path below may take ownership of it.
            let exited = tokio::select! {
                (status, (), ()) = async { tokio::join!(child.wait(), out, err) } => Some(status),
                _ = self.inner.cancel.cancelled() => None,
            };

            let status = match exited {
                Some(status) => status,
                None => {
                    self.terminate(child).await;
                    return;
                }
            };
            match status {
                Ok(status) => self.emit(DaemonEvent::Close(status.code())),
                Err(error) => {
                    self.emit(DaemonEvent::Error(format!("failed to reap child: {error}")));
                    return;
                }
            }
            if !self.inner.restart || self.inner.cancel.is_cancelled() {
                return;
            }
            match self.spawn_child() {
                Ok(respawned) => {
                    tracing::warn!(program = %self.inner.program, pid = respawned.id(), "daemon exited, restarted");
                    child = respawned;
                }
                Err(error) => {
                    self.emit(DaemonEvent::Error(format!("failed to restart child: {error}")));
                    return;
                }
            }
        }
    }

    /// Deliver SIGTERM and give the child a grace period before killing it.
    async fn terminate(&self, mut child: Child) {
        if let Some(pid) = child.id() {
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        }
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => tracing::debug!(?status, "daemon exited after SIGTERM"),
                Err(error) => tracing::error!(%error, "failed to wait for terminating child"),
            },
            _ = tokio::time::sleep(TERM_GRACE) => {
                tracing::warn!(program = %self.inner.program, "daemon ignored SIGTERM, killing");
                if let Err(error) = child.kill().await {
                    tracing::error!(%error, "failed to kill child");
                }
            }
        }
    }
}

async fn pump<R>(mut reader: R, daemon: &Daemon, wrap: fn(String) -> DaemonEvent)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => daemon.emit(wrap(String::from_utf8_lossy(&buf[..n]).into_owned())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Daemon, DaemonEvent};

    #[tokio::test]
    async fn test_stdout_and_clean_exit() {
        let (daemon, mut events) = Daemon::new("echo", vec!["hello".to_string()], false);
        daemon.start().unwrap();

        let mut stdout = String::new();
        let mut close = None;
        while let Some(event) = events.recv().await {
            match event {
                DaemonEvent::Stdout(chunk) => stdout.push_str(&chunk),
                DaemonEvent::Close(code) => {
                    close = Some(code);
                    break;
                }
                event => panic!("unexpected event {event:?}"),
            }
        }
        assert_eq!(stdout, "hello\n");
        assert_eq!(close, Some(Some(0)));

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_on_exit() {
        let (daemon, mut events) = Daemon::new("false", vec![], true);
        daemon.start().unwrap();

        let mut closes = 0;
        while closes < 2 {
            match events.recv().await {
                Some(DaemonEvent::Close(code)) => {
                    assert_eq!(code, Some(1));
                    closes += 1;
                }
                Some(_) => (),
                None => panic!("event channel closed before two exits"),
            }
        }
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (daemon, _events) = Daemon::new("sleep", vec!["30".to_string()], true);
        daemon.start().unwrap();
        daemon.shutdown().await;
        daemon.shutdown().await;

        // And safe without start.
        let (daemon, _events) = Daemon::new("true", vec![], false);
        daemon.shutdown().await;
    }
}
