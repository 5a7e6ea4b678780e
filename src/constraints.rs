//! The gentle-update constraint waiter. Install requests blocked on device
//! or app state park here until their predicates hold or their deadline
//! expires; each request completes exactly once, on a dedicated worker that
//! owns all pending state and timers.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use enumflags2::BitFlags;
use log::{debug, warn};

use airlock_api::{
    constraints::{ConstraintsResult, InstallConstraint},
    error::{AirlockError, ConstraintError, InternalError, ReportError},
};

use crate::platform::Platform;

/// Requests never outlive a week, whatever the caller asked for.
const MAX_WAIT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How long after enqueueing a check the worker re-evaluates on its own.
/// Idle-gated requests are never allowed a shorter deadline than this.
const IDLE_PROBE_INTERVAL: Duration = Duration::from_secs(10);

enum WaiterMsg {
    Check {
        packages: Vec<String>,
        constraints: BitFlags<InstallConstraint>,
        deadline: Instant,
        reply: SyncSender<ConstraintsResult>,
    },
    IdleReached,
    Shutdown,
}

/// One-shot handle to a pending constraint check.
pub struct ConstraintFuture {
    rx: Receiver<ConstraintsResult>,
}

impl ConstraintFuture {
    /// Block until the check completes. The worker guarantees completion by
    /// the request's deadline.
    pub fn wait(self) -> ConstraintsResult {
        self.rx
            .recv()
            .unwrap_or(ConstraintsResult { satisfied: false })
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ConstraintsResult> {
        self.rx.recv_timeout(timeout).ok()
    }
}

pub struct ConstraintWaiter {
    tx: Sender<WaiterMsg>,
    handle: Option<JoinHandle<()>>,
}

impl ConstraintWaiter {
    pub fn spawn(platform: Platform) -> Result<Self, AirlockError> {
        Self::spawn_with_probe_interval(platform, IDLE_PROBE_INTERVAL)
    }

    fn spawn_with_probe_interval(
        platform: Platform,
        probe_interval: Duration,
    ) -> Result<Self, AirlockError> {
        let (tx, rx) = mpsc::channel();
        let worker = Worker {
            platform,
            probe_interval,
            tx: tx.clone(),
            pending: HashMap::new(),
            timers: BinaryHeap::new(),
            next_handle: 0,
        };
        let handle = thread::Builder::new()
            .name("airlock-constraints".to_owned())
            .spawn(move || worker.run(rx))
            .structured(InternalError::Internal(
                "failed to spawn constraint worker",
            ))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Submit a constraint check. Completes once the constraints are first
    /// observed satisfied, or at the deadline with whatever holds then.
    pub fn check_constraints(
        &self,
        packages: &[String],
        constraints: BitFlags<InstallConstraint>,
        timeout_ms: i64,
    ) -> Result<ConstraintFuture, AirlockError> {
        if packages.is_empty() {
            return Err(AirlockError::new(ConstraintError::EmptyPackageList));
        }
        if timeout_ms < 0 {
            return Err(AirlockError::new(ConstraintError::NegativeTimeout));
        }

        let timeout = effective_timeout(constraints, timeout_ms);
        let (reply, rx) = mpsc::sync_channel(1);
        let _ = self.tx.send(WaiterMsg::Check {
            packages: packages.to_vec(),
            constraints,
            deadline: Instant::now() + timeout,
            reply,
        });
        Ok(ConstraintFuture { rx })
    }
}

impl Drop for ConstraintWaiter {
    fn drop(&mut self) {
        let _ = self.tx.send(WaiterMsg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Clamp the caller's timeout, and never give an idle-gated check a shorter
/// window than one idle probe.
fn effective_timeout(constraints: BitFlags<InstallConstraint>, timeout_ms: i64) -> Duration {
    let timeout = Duration::from_millis(timeout_ms as u64).min(MAX_WAIT);
    if constraints.contains(InstallConstraint::RequireDeviceIdle)
        && timeout < IDLE_PROBE_INTERVAL
    {
        IDLE_PROBE_INTERVAL
    } else {
        timeout
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum Timer {
    IdleProbe,
    Deadline(u64),
}

struct PendingCheck {
    packages: Vec<String>,
    constraints: BitFlags<InstallConstraint>,
    reply: SyncSender<ConstraintsResult>,
}

struct Worker {
    platform: Platform,
    probe_interval: Duration,
    tx: Sender<WaiterMsg>,
    pending: HashMap<u64, PendingCheck>,
    timers: BinaryHeap<Reverse<(Instant, u64, Timer)>>,
    next_handle: u64,
}

impl Worker {
    fn run(mut self, rx: Receiver<WaiterMsg>) {
        loop {
            self.fire_due_timers();

            let msg = match self.timers.peek() {
                Some(Reverse((at, _, _))) => {
                    let timeout = at.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(timeout) {
                        Ok(msg) => msg,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                None => match rx.recv() {
                    Ok(msg) => msg,
                    Err(_) => return,
                },
            };

            match msg {
                WaiterMsg::Check {
                    packages,
                    constraints,
                    deadline,
                    reply,
                } => self.on_check(packages, constraints, deadline, reply),
                WaiterMsg::IdleReached => self.evaluate_pending(true),
                WaiterMsg::Shutdown => return,
            }
        }
    }

    fn on_check(
        &mut self,
        packages: Vec<String>,
        constraints: BitFlags<InstallConstraint>,
        deadline: Instant,
        reply: SyncSender<ConstraintsResult>,
    ) {
        let effective = self.platform.registry.resolve_dependencies(&packages);
        let check = PendingCheck {
            packages: effective,
            constraints,
            reply,
        };

        let is_idle = constraints.contains(InstallConstraint::RequireDeviceIdle)
            && self.platform.device.is_idle();
        if self.evaluate(&check, is_idle) {
            complete(check, true);
            return;
        }

        let handle = self.next_handle;
        self.next_handle += 1;
        let needs_idle = check
            .constraints
            .contains(InstallConstraint::RequireDeviceIdle);
        self.pending.insert(handle, check);
        self.schedule(deadline, Timer::Deadline(handle));
        self.schedule(Instant::now() + self.probe_interval, Timer::IdleProbe);

        if needs_idle {
            // The idle notification races the delayed probe; whichever runs
            // second finds the check already resolved and is a no-op.
            let tx = self.tx.clone();
            self.platform
                .device
                .request_idle_notification(Box::new(move || {
                    let _ = tx.send(WaiterMsg::IdleReached);
                }));
        }
    }

    fn schedule(&mut self, at: Instant, timer: Timer) {
        let seq = self.next_handle;
        self.next_handle += 1;
        self.timers.push(Reverse((at, seq, timer)));
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((at, _, _))) = self.timers.peek() {
            if *at > now {
                break;
            }
            let Reverse((_, _, timer)) = self.timers.pop().unwrap();
            match timer {
                Timer::IdleProbe => {
                    self.evaluate_pending(self.platform.device.is_idle());
                    if !self.pending.is_empty() {
                        self.schedule(now + self.probe_interval, Timer::IdleProbe);
                    }
                }
                Timer::Deadline(handle) => {
                    // Completion at the deadline reports whatever holds at
                    // that moment.
                    if let Some(check) = self.pending.remove(&handle) {
                        let is_idle = check
                            .constraints
                            .contains(InstallConstraint::RequireDeviceIdle)
                            && self.platform.device.is_idle();
                        let satisfied = self.evaluate(&check, is_idle);
                        debug!("Constraint check expired, satisfied={satisfied}");
                        complete(check, satisfied);
                    }
                }
            }
        }
    }

    fn evaluate_pending(&mut self, is_idle: bool) {
        let handles: Vec<u64> = self.pending.keys().copied().collect();
        for handle in handles {
            let satisfied = self
                .pending
                .get(&handle)
                .is_some_and(|check| self.evaluate(check, is_idle));
            if satisfied {
                if let Some(check) = self.pending.remove(&handle) {
                    complete(check, true);
                }
            }
        }
    }

    /// The satisfaction predicate: the conjunction of every enabled clause.
    fn evaluate(&self, check: &PendingCheck, is_idle: bool) -> bool {
        let device = &self.platform.device;
        for constraint in check.constraints.iter() {
            let holds = match constraint {
                InstallConstraint::RequireDeviceIdle => is_idle,
                InstallConstraint::RequireAppNotForeground => {
                    !check.packages.iter().any(|p| device.is_app_foreground(p))
                }
                InstallConstraint::RequireAppNotInteracting => {
                    !check.packages.iter().any(|p| device.is_app_interacting(p))
                }
                InstallConstraint::RequireAppNotTopVisible => {
                    !check.packages.iter().any(|p| device.is_app_top_visible(p))
                }
                InstallConstraint::RequireNotInCall => !device.is_in_call(),
            };
            if !holds {
                return false;
            }
        }
        true
    }
}

/// Deliver the result. The check was removed from the pending map, so this
/// runs at most once per request; a receiver that gave up is not an error.
fn complete(check: PendingCheck, satisfied: bool) {
    if check.reply.try_send(ConstraintsResult { satisfied }).is_err() {
        warn!("Constraint check completed but nobody was waiting");
    }
}
