//! Shutdown coordination.
//!
//! ```text
//!   listener exited ─┐
//!   cancellation ────┤                    ┌─▶ listener (public)    ─┐
//!   SIGTERM/SIGINT ──┼─▶ ShutdownState ───┼─▶ listener (readiness) ─┼─▶ acks ─▶ ExitSequence
//!   /quit ───────────┘   quitting: once   └─▶ listener (internal)  ─┘
//! ```
//!
//! Whoever flips `quitting` from `false` to `true` first owns the shutdown:
//! only that caller publishes the stop-request. Every later trigger is a
//! no-op. The flip is a compare-and-swap, so simultaneous triggers from
//! different tasks or threads cannot both win.
//!
//! States: `Running` (no trigger published) → `ShutdownRequested` (trigger
//! published, listeners draining) → `Terminated` (exit function called).

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::error::Error;
use crate::log::Logger;

/// Pause before a non-zero exit so whoever is reporting the failure (a
/// `/quit` caller, a log shipper) gets a chance to finish.
pub const NON_ZERO_EXIT_DELAY: Duration = Duration::from_millis(500);

/// Receiving end of the stop-request signal.
pub type StopReceiver = watch::Receiver<Option<Trigger>>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Best-effort cleanup run once before the process exits.
pub type ShutdownFn = Arc<dyn Fn(&dyn Logger) -> Result<(), BoxError> + Send + Sync>;

/// Terminates the process with the given code. Injected so tests can record
/// instead of exiting.
pub type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

/// What started the shutdown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// A listener stopped while the service was running. Partial
    /// availability is worse than none, so the whole service goes down.
    ListenerExited { subsystem: &'static str },
    /// The caller's cancellation future resolved.
    Cancelled,
    /// SIGTERM or SIGINT.
    Signal,
    /// The internal `/quit` endpoint.
    Quit,
}

impl Trigger {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ListenerExited { .. } => 1,
            Self::Cancelled | Self::Signal | Self::Quit => 0,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenerExited { subsystem } => write!(f, "{subsystem} listener exited"),
            Self::Cancelled => f.write_str("cancellation"),
            Self::Signal => f.write_str("termination signal"),
            Self::Quit => f.write_str("quit request"),
        }
    }
}

/// The `quitting` guard plus the stop-request signal it protects.
pub struct ShutdownState {
    quitting: AtomicBool,
    stop: watch::Sender<Option<Trigger>>,
}

impl ShutdownState {
    pub fn new() -> Arc<Self> {
        let (stop, _) = watch::channel(None);
        Arc::new(Self { quitting: AtomicBool::new(false), stop })
    }

    /// Subscribe to the stop-request. A subscriber that arrives after the
    /// stop was published still observes it.
    pub fn subscribe(&self) -> StopReceiver {
        self.stop.subscribe()
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::Acquire)
    }

    /// Requests shutdown. Returns `true` only for the one call that moved the
    /// service out of `Running`; that call alone publishes the stop-request.
    pub fn trigger(&self, trigger: Trigger) -> bool {
        if self
            .quitting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.stop.send_replace(Some(trigger));
        true
    }
}

/// Resolves with the published trigger. A closed channel counts as
/// cancellation.
pub(crate) async fn stopped(stop: &mut StopReceiver) -> Trigger {
    match stop.wait_for(Option::is_some).await {
        Ok(trigger) => trigger.clone().unwrap_or(Trigger::Cancelled),
        Err(_) => Trigger::Cancelled,
    }
}

/// How a listener task ended; sent on the listener-died channel.
#[derive(Debug)]
pub struct ListenerExit {
    pub subsystem: &'static str,
    pub result: Result<(), Error>,
}

impl ListenerExit {
    /// Runs `serve` on its own task and sends how it ended on `exits`, a
    /// panic included.
    pub(crate) async fn report<F>(subsystem: &'static str, serve: F, exits: mpsc::Sender<ListenerExit>)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let result = match tokio::spawn(serve).await {
            Ok(result) => result,
            Err(e) => Err(Error::ListenerTask(e)),
        };
        let _ = exits.send(ListenerExit { subsystem, result }).await;
    }
}

/// Runs the optional shutdown callback, then calls the exit function.
pub struct ExitSequence {
    log: Arc<dyn Logger>,
    shutdown_fn: Option<ShutdownFn>,
    exit_fn: ExitFn,
    non_zero_delay: Duration,
}

impl ExitSequence {
    pub fn new(log: Arc<dyn Logger>, shutdown_fn: Option<ShutdownFn>, exit_fn: ExitFn) -> Self {
        Self { log, shutdown_fn, exit_fn, non_zero_delay: NON_ZERO_EXIT_DELAY }
    }

    pub fn with_non_zero_delay(mut self, delay: Duration) -> Self {
        self.non_zero_delay = delay;
        self
    }

    /// Never retries. A failing or panicking callback is logged and the exit
    /// proceeds.
    pub async fn run(&self, code: i32) {
        self.log.debug("ServiceExit", format_args!("performing service exit"));

        if let Some(shutdown_fn) = &self.shutdown_fn {
            self.log.debug("ShutdownFunc", format_args!("calling shutdown func"));
            let shutdown_fn = Arc::clone(shutdown_fn);
            let log = Arc::clone(&self.log);

            match tokio::task::spawn_blocking(move || shutdown_fn(&*log)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.log.error("ShutdownFunc", format_args!("shutdown func failed: {e}")),
                Err(e) => self.log.error("ShutdownFunc", format_args!("shutdown func did not complete: {e}")),
            }
        }

        if code != 0 {
            tokio::time::sleep(self.non_zero_delay).await;
        }

        self.log.debug("ServiceExit", format_args!("exiting with code {code}"));
        (self.exit_fn)(code);
    }
}

/// The default [`ExitFn`]: `std::process::exit`.
pub fn process_exit() -> ExitFn {
    Arc::new(|code: i32| std::process::exit(code))
}

/// Arbitrates between termination triggers and drives the exit sequence
/// exactly once.
pub struct Coordinator {
    state: Arc<ShutdownState>,
    exit: ExitSequence,
    log: Arc<dyn Logger>,
    cohort: usize,
    ack_timeout: Duration,
}

impl Coordinator {
    /// `cohort` is the number of listeners that will report on the exit
    /// channel; `ack_timeout` bounds how long the coordinator waits for them
    /// after the stop-request.
    pub fn new(
        state: Arc<ShutdownState>,
        exit: ExitSequence,
        log: Arc<dyn Logger>,
        cohort: usize,
        ack_timeout: Duration,
    ) -> Self {
        Self { state, exit, log, cohort, ack_timeout }
    }

    /// Waits for the first trigger, publishes the stop-request (unless some
    /// other caller already did), waits for the listeners to acknowledge and
    /// runs the exit sequence. Returns the code passed to the exit function.
    pub async fn run<C, S>(
        self,
        mut exits: mpsc::Receiver<ListenerExit>,
        cancel: C,
        signal: S,
    ) -> i32
    where
        C: Future<Output = ()>,
        S: Future<Output = ()>,
    {
        let mut stop = self.state.subscribe();
        let mut acked = 0;

        let proposed = tokio::select! {
            Some(exit) = exits.recv() => {
                acked += 1;
                self.report(&exit);
                Trigger::ListenerExited { subsystem: exit.subsystem }
            }
            () = cancel => Trigger::Cancelled,
            () = signal => Trigger::Signal,
            // Published by someone else, e.g. the quit endpoint.
            trigger = stopped(&mut stop) => trigger,
        };

        if self.state.trigger(proposed.clone()) {
            self.log.debug("Shutdown", format_args!("shutdown requested by {proposed}"));
        }
        let winner = stopped(&mut stop).await;
        if winner != proposed {
            self.log.debug(
                "Shutdown",
                format_args!("{proposed} ignored, shutdown already requested by {winner}"),
            );
        }

        let waited = tokio::time::timeout(self.ack_timeout, async {
            while acked < self.cohort {
                match exits.recv().await {
                    Some(exit) => {
                        acked += 1;
                        self.report(&exit);
                    }
                    None => break,
                }
            }
        })
        .await;
        if waited.is_err() {
            self.log.warn(
                "Shutdown",
                format_args!(
                    "{} listener(s) still running after {:?}, exiting anyway",
                    self.cohort.saturating_sub(acked),
                    self.ack_timeout
                ),
            );
        }

        let code = winner.exit_code();
        self.exit.run(code).await;
        code
    }

    fn report(&self, exit: &ListenerExit) {
        match (&exit.result, self.state.is_quitting()) {
            (Err(e), _) => self.log.error("Listener", format_args!("{} listener failed: {e}", exit.subsystem)),
            (Ok(()), true) => self.log.debug("Listener", format_args!("{} listener stopped", exit.subsystem)),
            (Ok(()), false) => self.log.warn(
                "Listener",
                format_args!("{} listener stopped unexpectedly", exit.subsystem),
            ),
        }
    }
}

/// Resolves on the first SIGTERM or SIGINT (Ctrl-C on every platform).
///
/// A signal that cannot be listened for is logged and never fires.
pub async fn os_signal(log: Arc<dyn Logger>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log.error("Signals", format_args!("cannot listen for Ctrl-C: {e}"));
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log.error("Signals", format_args!("cannot listen for SIGTERM: {e}"));
                std::future::pending::<()>().await;
            }
        }
    };

    // `pending()` never resolves; on non-Unix platforms the SIGTERM arm is
    // effectively disabled.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use tracing::Level;

    use super::*;
    use crate::test_utils::RecordingLogger;

    #[derive(Default)]
    struct ExitRecorder {
        codes: Mutex<Vec<i32>>,
    }

    impl ExitRecorder {
        fn exit_fn(self: &Arc<Self>) -> ExitFn {
            let me = Arc::clone(self);
            Arc::new(move |code: i32| me.codes.lock().unwrap().push(code))
        }

        fn codes(&self) -> Vec<i32> {
            self.codes.lock().unwrap().clone()
        }
    }

    fn coordinator(
        state: &Arc<ShutdownState>,
        log: &Arc<RecordingLogger>,
        exits: &Arc<ExitRecorder>,
        cohort: usize,
    ) -> Coordinator {
        let exit = ExitSequence::new(log.clone(), None, exits.exit_fn())
            .with_non_zero_delay(Duration::from_millis(1));
        Coordinator::new(Arc::clone(state), exit, log.clone(), cohort, Duration::from_millis(200))
    }

    #[test]
    fn only_the_first_trigger_wins() {
        let state = ShutdownState::new();
        let mut rx = state.subscribe();

        assert!(!state.is_quitting());
        assert!(state.trigger(Trigger::Signal));
        assert!(state.is_quitting());
        assert_eq!(*rx.borrow_and_update(), Some(Trigger::Signal));

        assert!(!state.trigger(Trigger::Quit));
        assert!(!state.trigger(Trigger::ListenerExited { subsystem: "public" }));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(*rx.borrow(), Some(Trigger::Signal));
    }

    #[test]
    fn concurrent_triggers_have_exactly_one_winner() {
        for _ in 0..50 {
            let state = ShutdownState::new();
            let wins = AtomicUsize::new(0);

            std::thread::scope(|s| {
                for i in 0..16 {
                    let state = &state;
                    let wins = &wins;
                    s.spawn(move || {
                        let trigger = if i % 2 == 0 { Trigger::Signal } else { Trigger::Cancelled };
                        if state.trigger(trigger) {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
            });

            assert_eq!(wins.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn late_subscriber_still_sees_stop() {
        let state = ShutdownState::new();
        state.trigger(Trigger::Quit);
        let mut rx = state.subscribe();
        assert_eq!(stopped(&mut rx).await, Trigger::Quit);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Trigger::ListenerExited { subsystem: "public" }.exit_code(), 1);
        assert_eq!(Trigger::Cancelled.exit_code(), 0);
        assert_eq!(Trigger::Signal.exit_code(), 0);
        assert_eq!(Trigger::Quit.exit_code(), 0);
    }

    #[tokio::test]
    async fn cancellation_exits_zero_once() {
        let state = ShutdownState::new();
        let log = RecordingLogger::new();
        let recorder = Arc::new(ExitRecorder::default());
        let (_tx, rx) = mpsc::channel(3);

        let code = coordinator(&state, &log, &recorder, 0)
            .run(rx, async {}, std::future::pending())
            .await;

        assert_eq!(code, 0);
        assert_eq!(recorder.codes(), vec![0]);
        assert!(state.is_quitting());
    }

    #[tokio::test]
    async fn listener_failure_exits_non_zero_and_waits_for_cohort() {
        let state = ShutdownState::new();
        let log = RecordingLogger::new();
        let recorder = Arc::new(ExitRecorder::default());
        let (tx, rx) = mpsc::channel(3);

        // The other two listeners acknowledge once they see the stop.
        for subsystem in ["readiness", "internal"] {
            let tx = tx.clone();
            let mut stop = state.subscribe();
            tokio::spawn(async move {
                stopped(&mut stop).await;
                let _ = tx.send(ListenerExit { subsystem, result: Ok(()) }).await;
            });
        }
        tx.send(ListenerExit {
            subsystem: "public",
            result: Err(Error::Io(std::io::Error::other("bind failed"))),
        })
        .await
        .unwrap();

        let code = coordinator(&state, &log, &recorder, 3)
            .run(rx, std::future::pending(), std::future::pending())
            .await;

        assert_eq!(code, 1);
        assert_eq!(recorder.codes(), vec![1]);
        assert_eq!(log.count(Level::ERROR), 1);
        assert_eq!(log.count(Level::WARN), 0);
    }

    #[tokio::test]
    async fn signal_and_listener_fault_together_exit_once() {
        let state = ShutdownState::new();
        let log = RecordingLogger::new();
        let recorder = Arc::new(ExitRecorder::default());
        let (tx, rx) = mpsc::channel(3);
        tx.send(ListenerExit { subsystem: "internal", result: Ok(()) }).await.unwrap();

        let code = coordinator(&state, &log, &recorder, 1)
            .run(rx, std::future::pending(), async {})
            .await;

        assert_eq!(recorder.codes().len(), 1);
        assert_eq!(recorder.codes(), vec![code]);
    }

    #[tokio::test]
    async fn external_trigger_is_honoured() {
        let state = ShutdownState::new();
        let log = RecordingLogger::new();
        let recorder = Arc::new(ExitRecorder::default());
        let (_tx, rx) = mpsc::channel(3);

        let quitter = Arc::clone(&state);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            quitter.trigger(Trigger::Quit);
        });

        let code = coordinator(&state, &log, &recorder, 0)
            .run(rx, std::future::pending(), std::future::pending())
            .await;

        assert_eq!(code, 0);
        assert_eq!(recorder.codes(), vec![0]);
    }

    #[tokio::test]
    async fn missing_acks_do_not_block_exit() {
        let state = ShutdownState::new();
        let log = RecordingLogger::new();
        let recorder = Arc::new(ExitRecorder::default());
        let (_tx, rx) = mpsc::channel(3);

        let code = coordinator(&state, &log, &recorder, 2)
            .run(rx, async {}, std::future::pending())
            .await;

        assert_eq!(code, 0);
        assert_eq!(log.count(Level::WARN), 1);
        assert_eq!(recorder.codes(), vec![0]);
    }

    #[tokio::test]
    async fn failing_shutdown_fn_is_logged_and_exit_proceeds() {
        let log = RecordingLogger::new();
        let recorder = Arc::new(ExitRecorder::default());
        let shutdown_fn: ShutdownFn = Arc::new(|_log: &dyn Logger| -> Result<(), BoxError> {
            Err("database still busy".into())
        });

        ExitSequence::new(log.clone(), Some(shutdown_fn), recorder.exit_fn())
            .run(0)
            .await;

        assert_eq!(recorder.codes(), vec![0]);
        assert!(log.messages(Level::ERROR)[0].contains("database still busy"));
    }

    #[tokio::test]
    async fn panicking_shutdown_fn_is_logged_and_exit_proceeds() {
        let log = RecordingLogger::new();
        let recorder = Arc::new(ExitRecorder::default());
        let shutdown_fn: ShutdownFn = Arc::new(|_log: &dyn Logger| -> Result<(), BoxError> {
            panic!("cleanup exploded")
        });

        ExitSequence::new(log.clone(), Some(shutdown_fn), recorder.exit_fn())
            .with_non_zero_delay(Duration::from_millis(1))
            .run(3)
            .await;

        assert_eq!(recorder.codes(), vec![3]);
        assert_eq!(log.count(Level::ERROR), 1);
    }

    #[tokio::test]
    async fn shutdown_fn_receives_logger() {
        let log = RecordingLogger::new();
        let recorder = Arc::new(ExitRecorder::default());
        let shutdown_fn: ShutdownFn = Arc::new(|log: &dyn Logger| -> Result<(), BoxError> {
            log.info("Cleanup", format_args!("flushed"));
            Ok(())
        });

        ExitSequence::new(log.clone(), Some(shutdown_fn), recorder.exit_fn())
            .run(0)
            .await;

        assert!(log.messages(Level::INFO).iter().any(|m| m == "Cleanup: flushed"));
    }

    async fn faulty_serve() -> Result<(), Error> {
        panic!("listener fault");
    }

    #[tokio::test]
    async fn panicking_listener_task_is_still_reported() {
        let (tx, mut rx) = mpsc::channel(1);

        ListenerExit::report("public", faulty_serve(), tx).await;

        let exit = rx.recv().await.unwrap();
        assert_eq!(exit.subsystem, "public");
        assert!(matches!(exit.result, Err(Error::ListenerTask(ref e)) if e.is_panic()));
    }

    #[tokio::test]
    async fn listener_result_is_forwarded() {
        let (tx, mut rx) = mpsc::channel(1);

        ListenerExit::report("internal", async { Ok::<(), Error>(()) }, tx).await;

        let exit = rx.recv().await.unwrap();
        assert_eq!(exit.subsystem, "internal");
        assert!(exit.result.is_ok());
    }
}
