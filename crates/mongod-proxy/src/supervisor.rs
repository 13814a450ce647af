use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use daemon::{Daemon, DaemonEvent};
use tokio::sync::{mpsc, watch};

use crate::Config;

/// Window after the most recent server error during which further errors
/// accumulate toward the fatal threshold. A quiet window resets the count.
const ERROR_COOLDOWN: Duration = Duration::from_millis(5000);
/// In-window error count at which escalation becomes fatal.
const ERROR_BUDGET: u32 = 4;

/// Operator-facing alert raised on the fatal escalation path.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Alert {
    pub title: String,
    pub category: String,
    pub icon: String,
}

/// Fire-and-forget sink for operator alerts.
pub trait Notify: Send + Sync + 'static {
    fn alert(&self, alert: Alert);
}

/// `Notify` implementation that records alerts to the log.
pub struct LogNotifier;

impl Notify for LogNotifier {
    fn alert(&self, alert: Alert) {
        tracing::error!(title = %alert.title, category = %alert.category, "operator alert");
    }
}

/// The slice of `Daemon` the monitor needs for fatal escalation.
#[async_trait]
pub trait ProcessControl: Send + Sync + 'static {
    async fn stop(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl ProcessControl for Daemon {
    async fn stop(&self) -> anyhow::Result<()> {
        self.shutdown().await;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unloaded,
    Starting,
    Running,
    ErrorBackoff,
    Fatal,
}

/// Owns the lifecycle of the external `mongod` process: start, graceful
/// shutdown, and escalating-failure handling. Restart-on-crash itself is
/// the daemon's policy; the supervisor only observes exits.
pub struct Supervisor {
    config: Config,
    notifier: Arc<dyn Notify>,
    daemon: Option<Daemon>,
    monitor: Option<tokio::task::JoinHandle<()>>,
    state: watch::Sender<State>,
}

impl Supervisor {
    pub fn new(config: Config, notifier: Arc<dyn Notify>) -> Self {
        let (state, _) = watch::channel(State::Unloaded);
        Self {
            config,
            notifier,
            daemon: None,
            monitor: None,
            state,
        }
    }

    /// Observe the supervisor state machine.
    pub fn state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Resolve filesystem paths, ensure the database directory exists,
    /// start `mongod` with its fixed argument set, and spawn the monitor.
    pub async fn load(&mut self) -> anyhow::Result<()> {
        let _ = self.state.send(State::Starting);

        let db_path = self.config.db_path();
        let log_path = self.config.log_path();
        ensure_dir(&self.config.data_dir)
            .await
            .with_context(|| format!("creating data directory {}", self.config.data_dir.display()))?;
        ensure_dir(&db_path)
            .await
            .with_context(|| format!("creating database directory {}", db_path.display()))?;

        let args = vec![
            "--journal".to_string(),
            "--logappend".to_string(),
            "--bind_ip".to_string(),
            self.config.bind_ip.clone(),
            "--port".to_string(),
            self.config.port.to_string(),
            "--dbpath".to_string(),
            db_path.display().to_string(),
            "--logpath".to_string(),
            log_path.display().to_string(),
        ];
        let (daemon, events) = Daemon::new("mongod", args, true);
        daemon.start().context("starting mongod")?;

        self.monitor = Some(tokio::spawn(monitor(
            events,
            Arc::new(daemon.clone()),
            self.notifier.clone(),
            self.state.clone(),
        )));
        self.daemon = Some(daemon);
        let _ = self.state.send(State::Running);
        Ok(())
    }

    /// Detach the monitor first, then shut the server down. A failed
    /// shutdown is logged and tolerated.
    pub async fn unload(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        if let Some(daemon) = self.daemon.take() {
            daemon.shutdown().await;
        }
        let _ = self.state.send(State::Unloaded);
    }
}

/// Create `path`, treating "already exists" as success and any other
/// failure as an error.
async fn ensure_dir(path: &Path) -> std::io::Result<()> {
    match tokio::fs::create_dir(path).await {
        Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        result => result,
    }
}

fn log_lines(event: &DaemonEvent) {
    match event {
        DaemonEvent::Stdout(chunk) => {
            for line in chunk.lines() {
                tracing::debug!("mongod: {line}");
            }
        }
        DaemonEvent::Stderr(chunk) => {
            for line in chunk.lines() {
                tracing::warn!("mongod: {line}");
            }
        }
        DaemonEvent::Close(code) => tracing::error!(?code, "mongod closed"),
        DaemonEvent::Error(error) => tracing::error!(%error, "error with mongod"),
    }
}

/// Leaky-bucket escalation: errors arriving faster than the cooldown window
/// accumulate toward the fatal threshold; errors spaced wider apart never
/// do. Crossing the threshold stops the server, raises one operator alert,
/// and ends self-recovery.
async fn monitor(
    mut events: mpsc::UnboundedReceiver<DaemonEvent>,
    control: Arc<dyn ProcessControl>,
    notifier: Arc<dyn Notify>,
    state: watch::Sender<State>,
) {
    let mut errors = 0u32;
    let mut quiet_at: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { return };
                log_lines(&event);
                if let DaemonEvent::Error(_) = event {
                    errors += 1;
                    if errors >= ERROR_BUDGET {
                        quiet_at = None;
                        if let Err(error) = control.stop().await {
                            tracing::error!(%error, "could not properly recover from a critical error");
                        }
                        notifier.alert(Alert {
                            title: "mongod has had too many critical errors. Please reboot.".to_string(),
                            category: "mongodb".to_string(),
                            icon: "icons:error".to_string(),
                        });
                        let _ = state.send(State::Fatal);
                        break;
                    }
                    if quiet_at.is_none() {
                        quiet_at = Some(tokio::time::Instant::now() + ERROR_COOLDOWN);
                        let _ = state.send(State::ErrorBackoff);
                    }
                }
            }
            _ = async { tokio::time::sleep_until(quiet_at.unwrap_or_else(tokio::time::Instant::now)).await },
                if quiet_at.is_some() =>
            {
                quiet_at = None;
                errors = 0;
                let _ = state.send(State::Running);
            }
        }
    }

    // Fatal: no further self-recovery, but keep the child's output visible.
    while let Some(event) = events.recv().await {
        log_lines(&event);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        stops: AtomicU32,
        alerts: AtomicU32,
    }

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                stops: AtomicU32::new(0),
                alerts: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ProcessControl for Counting {
        async fn stop(&self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Notify for Counting {
        fn alert(&self, _alert: Alert) {
            self.alerts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn start_monitor(
        counting: &Arc<Counting>,
    ) -> (
        mpsc::UnboundedSender<DaemonEvent>,
        watch::Receiver<State>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(State::Running);
        let handle = tokio::spawn(monitor(
            rx,
            counting.clone(),
            counting.clone(),
            state,
        ));
        (tx, state_rx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_errors_escalate_exactly_once() {
        let counting = Counting::new();
        let (tx, state, handle) = start_monitor(&counting);

        for _ in 0..4 {
            tx.send(DaemonEvent::Error("boom".to_string())).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(counting.stops.load(Ordering::SeqCst), 1);
        assert_eq!(counting.alerts.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow(), State::Fatal);

        // Further errors are logged but never re-trigger the fatal path.
        for _ in 0..4 {
            tx.send(DaemonEvent::Error("boom".to_string())).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counting.stops.load(Ordering::SeqCst), 1);
        assert_eq!(counting.alerts.load(Ordering::SeqCst), 1);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_errors_never_escalate() {
        let counting = Counting::new();
        let (tx, state, handle) = start_monitor(&counting);

        // Each error is followed by a full quiet cooldown window, so the
        // counter resets to zero every time.
        for _ in 0..8 {
            tx.send(DaemonEvent::Error("boom".to_string())).unwrap();
            tokio::time::sleep(ERROR_COOLDOWN + Duration::from_millis(100)).await;
            assert_eq!(*state.borrow(), State::Running);
        }
        assert_eq!(counting.stops.load(Ordering::SeqCst), 0);
        assert_eq!(counting.alerts.load(Ordering::SeqCst), 0);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_below_budget_are_absorbed() {
        let counting = Counting::new();
        let (tx, state, handle) = start_monitor(&counting);

        for _ in 0..3 {
            tx.send(DaemonEvent::Error("boom".to_string())).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*state.borrow(), State::ErrorBackoff);
        assert_eq!(counting.stops.load(Ordering::SeqCst), 0);

        // Quiet window passes: back to running, counter reset, so another
        // burst of three still doesn't escalate.
        tokio::time::sleep(ERROR_COOLDOWN).await;
        assert_eq!(*state.borrow(), State::Running);
        for _ in 0..3 {
            tx.send(DaemonEvent::Error("boom".to_string())).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counting.stops.load(Ordering::SeqCst), 0);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_dir_tolerates_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        ensure_dir(&path).await.unwrap();
        ensure_dir(&path).await.unwrap();
        assert!(path.is_dir());

        // Any failure other than "already exists" is surfaced.
        let nested = dir.path().join("missing").join("db");
        assert!(ensure_dir(&nested).await.is_err());
    }
}
