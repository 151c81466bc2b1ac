//! Daemon implementation for the GPU fan daemon
//!
//! [`FanDaemon`] starts one control task per configured GPU and waits for a
//! termination signal or the first fatal loop error. Either way it stops the
//! loops and hands every fan back to the driver through the
//! [`ShutdownGuard`], which makes sure that restoration happens only once.

pub mod control_loop;

use crate::backend::{DeviceBackend, DeviceId};
use crate::config::DaemonConfig;
use crate::errors::{FanControlError, Result};
use control_loop::DeviceController;
use log::{debug, error, info};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, PoisonError, RwLock};
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tokio::task::{spawn_blocking, JoinError, JoinSet};
use tokio::time::timeout;

/// How long stopped control loops get to finish their current tick
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Hand every fan of every device back to the vendor policy.
///
/// Best effort: failures are logged and the remaining fans are still
/// restored. Returns the number of fans restored.
pub fn restore_default_fans(backend: &dyn DeviceBackend) -> usize {
    let count = match backend.device_count() {
        Ok(count) => count,
        Err(e) => {
            error!("Can't enumerate devices for restore: {}", e);
            return 0;
        }
    };

    let mut restored = 0;
    for device in 0..count {
        info!("GPU {}: setting fans to default mode", device);
        let fans = match backend.num_fans(device) {
            Ok(fans) => fans,
            Err(e) => {
                error!("GPU {}: unable to get fan count: {}", device, e);
                continue;
            }
        };
        for fan in 0..fans {
            match backend.restore_default_fan_speed(device, fan) {
                Ok(()) => {
                    debug!("GPU {}: default fan control restored on fan {}", device, fan);
                    restored += 1;
                }
                Err(e) => error!("GPU {}: error resetting fan {}: {}", device, fan, e),
            }
        }
    }
    restored
}

/// One-shot latch around [`restore_default_fans`].
///
/// Any number of callers may race to trigger it (signal, fatal error, the
/// restore command); the restoration runs once and later callers return
/// after it has finished. Fan writes go through [`ShutdownGuard::while_open`],
/// so none can land after the restoration started.
#[derive(Debug)]
pub struct ShutdownGuard {
    once: Once,
    fired: AtomicBool,
    closed: RwLock<bool>,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self {
            once: Once::new(),
            fired: AtomicBool::new(false),
            closed: RwLock::new(false),
        }
    }

    /// Run `write` unless the fans were handed back. Holds off the
    /// restoration until `write` returns.
    pub fn while_open<T>(&self, write: impl FnOnce() -> T) -> Option<T> {
        let closed = self.closed.read().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            None
        } else {
            Some(write())
        }
    }

    /// Restore default fan control unless that already happened.
    /// Returns true for the one call that performed the restoration.
    pub fn restore(&self, backend: &dyn DeviceBackend) -> bool {
        let mut performed = false;
        self.once.call_once(|| {
            // Waits for writes in progress; later ones see the gate closed
            *self.closed.write().unwrap_or_else(PoisonError::into_inner) = true;
            info!("Restoring default fan controls");
            let restored = restore_default_fans(backend);
            info!("Default fan control restored on {} fans", restored);
            self.fired.store(true, Ordering::SeqCst);
            performed = true;
        });
        performed
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// SIGINT, SIGHUP and SIGTERM listeners
pub struct TerminationSignals {
    interrupt: Signal,
    hangup: Signal,
    terminate: Signal,
}

impl TerminationSignals {
    /// Register the handlers. Needs a running tokio runtime.
    pub fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the first termination signal and return its name
    pub async fn recv(mut self) -> &'static str {
        let sig = tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.hangup.recv() => "SIGHUP",
            _ = self.terminate.recv() => "SIGTERM",
        };
        info!("caught signal: {}", sig);
        sig
    }
}

/// Why the daemon stopped controlling the fans
#[derive(Debug)]
pub enum DaemonExit {
    /// A termination request, e.g. a signal name
    Requested(&'static str),
    /// A control loop failed
    Fatal {
        device: DeviceId,
        error: FanControlError,
    },
    /// Reading device limits failed before any loop started
    StartFailed(FanControlError),
    /// A control task panicked or was cancelled
    TaskLost(String),
}

impl DaemonExit {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Requested(_) => 0,
            Self::Fatal { .. } | Self::StartFailed(_) | Self::TaskLost(_) => 1,
        }
    }
}

/// Running control loops, and the devices they drive
#[derive(Default)]
pub struct ControlTasks {
    tasks: JoinSet<(DeviceId, Result<()>)>,
    running: BTreeSet<DeviceId>,
}

impl ControlTasks {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Devices whose loop has not ended yet
    pub fn running(&self) -> &BTreeSet<DeviceId> {
        &self.running
    }

    /// Next loop to end; `None` once all have ended
    async fn join_next(&mut self) -> Option<std::result::Result<(DeviceId, Result<()>), JoinError>> {
        let joined = self.tasks.join_next().await;
        if let Some(Ok((device, _))) = &joined {
            self.running.remove(device);
        }
        joined
    }
}

/// Control supervisor
pub struct FanDaemon {
    config: Arc<DaemonConfig>,
    backend: Arc<dyn DeviceBackend>,
    guard: Arc<ShutdownGuard>,
    stop: watch::Sender<bool>,
    stop_grace: Duration,
}

impl FanDaemon {
    pub fn new(config: Arc<DaemonConfig>, backend: Arc<dyn DeviceBackend>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            backend,
            guard: Arc::new(ShutdownGuard::new()),
            stop,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Bound the wait for loops stuck in a backend call at shutdown
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Latch shared with anyone else who may need to restore the fans
    pub fn guard(&self) -> Arc<ShutdownGuard> {
        self.guard.clone()
    }

    /// Spawn one control task per configured device.
    ///
    /// Devices missing from the configuration are left alone. Cards with a
    /// configuration anomaly are logged and skipped. A failure reading the
    /// device limits is fatal, and no task is started in that case.
    pub fn spawn_controllers(&self) -> Result<ControlTasks> {
        debug!("Cards configuration: {:?}", self.config.cards);
        let count = self.backend.device_count()?;
        let mut controllers = Vec::new();

        for device in 0..count {
            let Some(card) = self.config.card(device) else {
                info!("GPU {}: not found in config, skipping", device);
                continue;
            };
            let policy = match card.policy() {
                Ok(policy) => policy,
                Err(e) => {
                    error!("GPU {}: wrong card configuration, leaving it uncontrolled: {}", device, e);
                    continue;
                }
            };

            info!("GPU {}: taking fan control", device);
            controllers.push(DeviceController::initialize(self.backend.as_ref(), device, &policy)?);
        }

        for device in self.config.cards.keys().filter(|d| **d >= count) {
            error!("GPU {}: configured but not present", device);
        }

        let period = self.config.period();
        let mut tasks = ControlTasks::default();
        for controller in controllers {
            let device = controller.device();
            let run = controller.run(self.backend.clone(), self.guard.clone(), period, self.stop.subscribe());
            tasks.tasks.spawn(async move { (device, run.await) });
            tasks.running.insert(device);
        }
        Ok(tasks)
    }

    /// Control until `shutdown` resolves or a loop fails, then restore the
    /// default fan policy.
    pub async fn run_until<F>(self, shutdown: F) -> DaemonExit
    where
        F: Future<Output = &'static str>,
    {
        info!("Starting fan control");
        let mut tasks = match self.spawn_controllers() {
            Ok(tasks) => tasks,
            Err(error) => {
                error!("Fan control could not start: {}", error);
                self.restore().await;
                return DaemonExit::StartFailed(error);
            }
        };
        info!("Controlling {} GPU(s)", tasks.len());

        let outcome = tokio::select! {
            reason = shutdown => DaemonExit::Requested(reason),
            exit = first_failure(&mut tasks) => exit,
        };

        match &outcome {
            DaemonExit::Requested(reason) => info!("Shutting down fan control ({})", reason),
            DaemonExit::Fatal { device, error } => error!("GPU {}: fatal control error: {}", device, error),
            DaemonExit::TaskLost(reason) => error!("Control task lost: {}", reason),
            DaemonExit::StartFailed(_) => {}
        }

        self.stop_loops(tasks).await;
        self.restore().await;
        outcome
    }

    /// Ask every loop to stop and wait for them, at most `stop_grace`.
    /// A loop stuck in a backend call is left behind; the guard keeps it
    /// from writing once the fans are restored.
    async fn stop_loops(&self, mut tasks: ControlTasks) {
        self.stop.send_replace(true);
        let drained = timeout(self.stop_grace, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((device, result)) => {
                        if let Err(e) = result {
                            debug!("GPU {}: loop ended with {} while stopping", device, e);
                        }
                    }
                    Err(e) => debug!("Control task ended abnormally while stopping: {}", e),
                }
            }
        })
        .await;

        if drained.is_err() {
            let stuck: Vec<String> = tasks.running().iter().map(|d| d.to_string()).collect();
            error!(
                "Control loop for GPU {} did not stop within {:?}, restoring anyway",
                stuck.join(", "),
                self.stop_grace
            );
            tasks.tasks.abort_all();
        }
    }

    /// Guarded restore, off the async worker threads
    async fn restore(&self) {
        let guard = self.guard.clone();
        let backend = self.backend.clone();
        if let Err(e) = spawn_blocking(move || guard.restore(backend.as_ref())).await {
            error!("Fan restore task failed: {}", e);
        }
    }

    /// Control until SIGINT/SIGHUP/SIGTERM or a fatal loop error
    pub async fn run(self) -> Result<DaemonExit> {
        let signals = TerminationSignals::install()?;
        Ok(self.run_until(signals.recv()).await)
    }
}

/// Resolve with the first task that failed; pend forever when there are none.
async fn first_failure(tasks: &mut ControlTasks) -> DaemonExit {
    loop {
        match tasks.join_next().await {
            Some(Ok((device, Err(error)))) => return DaemonExit::Fatal { device, error },
            Some(Ok((device, Ok(())))) => debug!("GPU {}: control loop ended", device),
            Some(Err(e)) => return DaemonExit::TaskLost(e.to_string()),
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{BackendCall, SimDeviceSpec, SimulatedBackend};
    use std::time::Duration;

    fn config(json: &str) -> Arc<DaemonConfig> {
        Arc::new(DaemonConfig::from_json(json).unwrap())
    }

    fn two_gpus() -> Arc<SimulatedBackend> {
        Arc::new(SimulatedBackend::from_specs(vec![
            SimDeviceSpec::default(),
            SimDeviceSpec {
                fans: 1,
                ..SimDeviceSpec::default()
            },
        ]))
    }

    #[test]
    fn test_guard_restores_once() {
        let backend = two_gpus();
        let guard = ShutdownGuard::new();

        assert!(!guard.has_fired());
        assert!(guard.restore(backend.as_ref()));
        assert!(!guard.restore(backend.as_ref()));
        assert!(guard.has_fired());
        assert_eq!(backend.restore_calls().len(), 3);
    }

    #[test]
    fn test_guard_restores_once_under_concurrent_triggers() {
        let backend = two_gpus();
        let guard = Arc::new(ShutdownGuard::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = guard.clone();
                let backend = backend.clone();
                std::thread::spawn(move || guard.restore(backend.as_ref()))
            })
            .collect();
        let performed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|performed| *performed)
            .count();

        assert_eq!(performed, 1);
        assert_eq!(backend.restore_calls().len(), 3);
    }

    #[test]
    fn test_restore_continues_past_failures() {
        let backend = two_gpus();
        backend.fail_writes(0, true);

        assert_eq!(restore_default_fans(backend.as_ref()), 1);
        assert_eq!(backend.restore_calls(), vec![BackendCall::RestoreDefault { device: 1, fan: 0 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_stops_loops_and_restores() {
        let backend = two_gpus();
        backend.pin_temperature(0, 70);
        backend.pin_temperature(1, 70);
        let daemon = FanDaemon::new(
            config(r#"{ "period": 1, "cards": { "1": { "mode": "curve", "curve": [[60, 30], [75, 100]] } } }"#),
            backend.clone(),
        );
        let guard = daemon.guard();

        let exit = daemon
            .run_until(async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "test"
            })
            .await;

        assert!(matches!(exit, DaemonExit::Requested("test")));
        assert_eq!(exit.exit_code(), 0);
        assert!(guard.has_fired());

        // GPU 0 is not configured and never receives a fan command
        let calls = backend.calls();
        assert!(calls
            .iter()
            .all(|c| !matches!(c, BackendCall::SetFanSpeed { device: 0, .. })));
        assert_eq!(
            calls.iter().filter(|c| matches!(c, BackendCall::SetFanSpeed { device: 1, .. })).count(),
            1
        );
        // The restore is the last thing that happened, on all three fans
        assert_eq!(backend.restore_calls().len(), 3);
        assert!(matches!(calls.last(), Some(BackendCall::RestoreDefault { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_is_fatal_for_all_devices() {
        let backend = two_gpus();
        backend.pin_temperature(0, 70);
        backend.pin_temperature(1, 70);
        backend.fail_writes(1, true);
        let daemon = FanDaemon::new(
            config(
                r#"{ "cards": {
                    "0": { "mode": "target", "target": 60, "pid": [5.0, 0.1, 0.0] },
                    "1": { "mode": "curve", "curve": [[60, 30], [75, 100]] }
                } }"#,
            ),
            backend.clone(),
        );

        let exit = daemon.run_until(std::future::pending()).await;
        assert!(matches!(
            exit,
            DaemonExit::Fatal {
                device: 1,
                error: FanControlError::FanWrite { .. }
            }
        ));
        assert_eq!(exit.exit_code(), 1);
        // GPU 1 rejects the restore too; GPU 0 is still handed back
        assert_eq!(
            backend.restore_calls(),
            vec![
                BackendCall::RestoreDefault { device: 0, fan: 0 },
                BackendCall::RestoreDefault { device: 0, fan: 1 },
            ]
        );
    }

    const BOTH_CURVES: &str = r#"{ "cards": {
        "0": { "mode": "curve", "curve": [[60, 30], [75, 100]] },
        "1": { "mode": "curve", "curve": [[60, 30], [75, 100]] }
    } }"#;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_backend_call_does_not_block_restore() {
        let backend = two_gpus();
        backend.pin_temperature(0, 70);
        backend.pin_temperature(1, 90);
        backend.delay_reads(1, Some(Duration::from_millis(1500)));
        let daemon =
            FanDaemon::new(config(BOTH_CURVES), backend.clone()).with_stop_grace(Duration::from_millis(100));
        let guard = daemon.guard();

        let started = std::time::Instant::now();
        let exit = daemon
            .run_until(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                "SIGTERM"
            })
            .await;

        assert!(started.elapsed() < Duration::from_millis(1000));
        assert!(matches!(exit, DaemonExit::Requested("SIGTERM")));
        assert!(guard.has_fired());
        assert_eq!(backend.restore_calls().len(), 3);

        // The hung read returns after the restore; its duty is dropped
        tokio::time::sleep(Duration::from_millis(2000)).await;
        let calls = backend.calls();
        assert!(calls
            .iter()
            .all(|c| !matches!(c, BackendCall::SetFanSpeed { device: 1, .. })));
        assert!(matches!(calls.last(), Some(BackendCall::RestoreDefault { .. })));
        assert!(!backend.is_manual(1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_loop_is_reported_and_fans_restored() {
        let backend = two_gpus();
        backend.pin_temperature(0, 70);
        backend.pin_temperature(1, 70);
        backend.panic_on_read(1, true);
        let daemon = FanDaemon::new(config(BOTH_CURVES), backend.clone());

        let exit = daemon.run_until(std::future::pending()).await;

        assert!(matches!(exit, DaemonExit::TaskLost(_)));
        assert_eq!(exit.exit_code(), 1);
        assert_eq!(
            backend.restore_calls(),
            vec![
                BackendCall::RestoreDefault { device: 0, fan: 0 },
                BackendCall::RestoreDefault { device: 0, fan: 1 },
                BackendCall::RestoreDefault { device: 1, fan: 0 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_restores_and_reports() {
        let backend = Arc::new(SimulatedBackend::from_specs(vec![SimDeviceSpec {
            min_fan_speed: 90,
            max_fan_speed: 20,
            ..SimDeviceSpec::default()
        }]));
        let daemon = FanDaemon::new(
            config(r#"{ "cards": { "0": { "mode": "curve", "curve": [[60, 30], [75, 100]] } } }"#),
            backend.clone(),
        );

        let exit = daemon.run_until(std::future::pending()).await;
        assert!(matches!(exit, DaemonExit::StartFailed(FanControlError::Backend { device: 0, .. })));
        assert_eq!(exit.exit_code(), 1);
        assert!(backend.set_calls().is_empty());
        assert_eq!(backend.restore_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_mode_leaves_device_uncontrolled() {
        let backend = two_gpus();
        let daemon = FanDaemon::new(
            config(r#"{ "cards": { "0": { "mode": "turbo" }, "1": { "mode": "curve", "curve": [] } } }"#),
            backend.clone(),
        );

        let tasks = daemon.spawn_controllers().unwrap();
        assert!(tasks.is_empty());
        assert!(backend.set_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_controlled_devices_waits_for_shutdown() {
        let backend = two_gpus();
        let daemon = FanDaemon::new(config(r#"{ "cards": {} }"#), backend.clone());

        let exit = daemon
            .run_until(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                "SIGTERM"
            })
            .await;
        assert!(matches!(exit, DaemonExit::Requested("SIGTERM")));
        assert!(backend.set_calls().is_empty());
        assert_eq!(backend.restore_calls().len(), 3);
    }
}
