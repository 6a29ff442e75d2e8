//! Process control: pause, resume, terminate.
//!
//! Signal delivery goes through the [`SignalBackend`] trait so the engine
//! and tests share the same controller logic. Safety checks run before any
//! OS call: the monitor's own pid is always refused. Terminate requires the
//! caller to have collected the two-step confirmation documented in the
//! interface contract - the controller itself is unconditional once
//! invoked, and never retries a kill.
//!
//! Batch operations apply to every member of a [`SelectionSet`] and collect
//! per-member outcomes rather than aborting on the first failure.

use crate::config::ControlConfig;
use ct_common::ProcessId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Signals the controller may deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Suspend (SIGSTOP).
    Stop,
    /// Continue (SIGCONT).
    Cont,
    /// Cooperative termination request (SIGTERM).
    Term,
    /// Unconditional kill (SIGKILL).
    Kill,
}

/// Termination flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminateMode {
    /// Send a termination request and expect cooperative exit.
    Graceful,
    /// Send an unconditional kill.
    Forced,
}

/// A control operation, for the batch API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Pause,
    Resume,
    Terminate(TerminateMode),
}

/// Per-target outcome of a control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOutcome {
    /// The operation took effect (verified where verifiable).
    Success,
    /// The process was already gone - benign, not an error.
    NotFound,
    /// The OS refused the signal; surfaced to the operator, never retried.
    PermissionDenied,
    /// The state change was not observed within the verify window;
    /// reported as unknown rather than hanging the loop.
    TimedOut,
    /// Refused by a safety check before any OS call.
    Refused,
}

impl ControlOutcome {
    /// Whether the target needs operator attention.
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            ControlOutcome::PermissionDenied | ControlOutcome::TimedOut
        )
    }
}

/// Error from raw signal delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    NotFound,
    PermissionDenied,
    Other(String),
}

/// OS signal delivery and state observation.
pub trait SignalBackend {
    /// Deliver a signal to a process.
    fn send(&self, pid: u32, signal: Signal) -> Result<(), SendError>;

    /// Whether the process currently exists.
    fn exists(&self, pid: u32) -> bool;

    /// Whether the process is in the job-control stopped state, if the
    /// platform can tell.
    fn is_stopped(&self, pid: u32) -> Option<bool>;
}

/// Live libc-backed signal delivery.
#[derive(Debug, Default)]
pub struct LibcBackend;

#[cfg(unix)]
impl SignalBackend for LibcBackend {
    fn send(&self, pid: u32, signal: Signal) -> Result<(), SendError> {
        let signo = match signal {
            Signal::Stop => libc::SIGSTOP,
            Signal::Cont => libc::SIGCONT,
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let result = unsafe { libc::kill(pid as i32, signo) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Err(SendError::NotFound),
            Some(libc::EPERM) => Err(SendError::PermissionDenied),
            _ => Err(SendError::Other(err.to_string())),
        }
    }

    fn exists(&self, pid: u32) -> bool {
        let result = unsafe { libc::kill(pid as i32, 0) };
        if result == 0 {
            return true;
        }
        // EPERM means the process exists but we cannot signal it.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(target_os = "linux")]
    fn is_stopped(&self, pid: u32) -> Option<bool> {
        let content = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        let after_comm = content.get(content.rfind(')')? + 2..)?;
        let state = after_comm.chars().next()?;
        Some(state == 'T' || state == 't')
    }

    #[cfg(not(target_os = "linux"))]
    fn is_stopped(&self, _pid: u32) -> Option<bool> {
        None
    }
}

#[cfg(not(unix))]
impl SignalBackend for LibcBackend {
    fn send(&self, _pid: u32, _signal: Signal) -> Result<(), SendError> {
        Err(SendError::Other("signals not supported".to_string()))
    }

    fn exists(&self, _pid: u32) -> bool {
        false
    }

    fn is_stopped(&self, _pid: u32) -> Option<bool> {
        None
    }
}

/// Transient set of instance ids marked for batch operations.
///
/// Cleared on mode exit; never persisted.
#[derive(Debug, Clone, Default)]
pub struct SelectionSet {
    pids: BTreeSet<ProcessId>,
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toggle(&mut self, pid: ProcessId) -> bool {
        if !self.pids.remove(&pid) {
            self.pids.insert(pid);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.pids.contains(&pid)
    }

    pub fn clear(&mut self) {
        self.pids.clear();
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.pids.iter().copied()
    }
}

impl FromIterator<ProcessId> for SelectionSet {
    fn from_iter<I: IntoIterator<Item = ProcessId>>(iter: I) -> Self {
        SelectionSet {
            pids: iter.into_iter().collect(),
        }
    }
}

/// The process controller.
pub struct Controller<B: SignalBackend> {
    backend: B,
    self_pid: ProcessId,
    config: ControlConfig,
}

impl<B: SignalBackend> Controller<B> {
    pub fn new(backend: B, self_pid: ProcessId, config: ControlConfig) -> Self {
        Controller {
            backend,
            self_pid,
            config,
        }
    }

    /// Suspend a process (SIGSTOP), verifying the stop state where the
    /// platform can report it.
    pub fn pause(&self, pid: ProcessId) -> ControlOutcome {
        if pid == self.self_pid {
            return ControlOutcome::Refused;
        }
        match self.backend.send(pid.0, Signal::Stop) {
            Ok(()) => {
                let outcome = self.wait_for(pid, WaitFor::Stopped(true));
                info!(pid = pid.0, outcome = ?outcome, "pause");
                outcome
            }
            Err(e) => send_error_outcome(e),
        }
    }

    /// Resume a suspended process (SIGCONT).
    pub fn resume(&self, pid: ProcessId) -> ControlOutcome {
        if pid == self.self_pid {
            return ControlOutcome::Refused;
        }
        match self.backend.send(pid.0, Signal::Cont) {
            Ok(()) => {
                let outcome = self.wait_for(pid, WaitFor::Stopped(false));
                info!(pid = pid.0, outcome = ?outcome, "resume");
                outcome
            }
            Err(e) => send_error_outcome(e),
        }
    }

    /// Terminate a process.
    ///
    /// Graceful sends SIGTERM and expects cooperative exit within the
    /// verify window; forced sends SIGKILL. Neither is ever auto-retried.
    pub fn terminate(&self, pid: ProcessId, mode: TerminateMode) -> ControlOutcome {
        if pid == self.self_pid {
            return ControlOutcome::Refused;
        }
        let signal = match mode {
            TerminateMode::Graceful => Signal::Term,
            TerminateMode::Forced => Signal::Kill,
        };
        match self.backend.send(pid.0, signal) {
            Ok(()) => {
                let outcome = self.wait_for(pid, WaitFor::Exit);
                if outcome.needs_attention() {
                    warn!(pid = pid.0, ?mode, outcome = ?outcome, "terminate not confirmed");
                } else {
                    info!(pid = pid.0, ?mode, outcome = ?outcome, "terminate");
                }
                outcome
            }
            Err(e) => send_error_outcome(e),
        }
    }

    /// Apply one operation to every member of a selection, collecting
    /// per-member outcomes. A failure on one member never aborts the rest.
    pub fn apply_batch(
        &self,
        selection: &SelectionSet,
        op: ControlOp,
    ) -> Vec<(ProcessId, ControlOutcome)> {
        selection
            .iter()
            .map(|pid| {
                let outcome = match op {
                    ControlOp::Pause => self.pause(pid),
                    ControlOp::Resume => self.resume(pid),
                    ControlOp::Terminate(mode) => self.terminate(pid, mode),
                };
                (pid, outcome)
            })
            .collect()
    }

    fn wait_for(&self, pid: ProcessId, what: WaitFor) -> ControlOutcome {
        let timeout = Duration::from_millis(self.config.verify_timeout_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let start = Instant::now();

        loop {
            match what {
                WaitFor::Exit => {
                    if !self.backend.exists(pid.0) {
                        return ControlOutcome::Success;
                    }
                }
                WaitFor::Stopped(expected) => {
                    if !self.backend.exists(pid.0) {
                        return ControlOutcome::NotFound;
                    }
                    match self.backend.is_stopped(pid.0) {
                        Some(stopped) if stopped == expected => return ControlOutcome::Success,
                        // Platform cannot observe stop state: trust delivery.
                        None => return ControlOutcome::Success,
                        Some(_) => {}
                    }
                }
            }

            if start.elapsed() >= timeout {
                return ControlOutcome::TimedOut;
            }
            std::thread::sleep(poll);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WaitFor {
    Exit,
    Stopped(bool),
}

fn send_error_outcome(err: SendError) -> ControlOutcome {
    match err {
        SendError::NotFound => ControlOutcome::NotFound,
        SendError::PermissionDenied => ControlOutcome::PermissionDenied,
        SendError::Other(msg) => {
            warn!(error = %msg, "signal delivery failed");
            ControlOutcome::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Copy)]
    struct FakeProc {
        exists: bool,
        stopped: bool,
        deny: bool,
    }

    /// Scripted backend: signals mutate the fake table immediately.
    struct FakeBackend {
        procs: RefCell<HashMap<u32, FakeProc>>,
    }

    impl FakeBackend {
        fn with(procs: &[(u32, FakeProc)]) -> Self {
            FakeBackend {
                procs: RefCell::new(procs.iter().copied().collect()),
            }
        }
    }

    impl SignalBackend for FakeBackend {
        fn send(&self, pid: u32, signal: Signal) -> Result<(), SendError> {
            let mut procs = self.procs.borrow_mut();
            let Some(proc_) = procs.get_mut(&pid) else {
                return Err(SendError::NotFound);
            };
            if !proc_.exists {
                return Err(SendError::NotFound);
            }
            if proc_.deny {
                return Err(SendError::PermissionDenied);
            }
            match signal {
                Signal::Stop => proc_.stopped = true,
                Signal::Cont => proc_.stopped = false,
                Signal::Term | Signal::Kill => proc_.exists = false,
            }
            Ok(())
        }

        fn exists(&self, pid: u32) -> bool {
            self.procs
                .borrow()
                .get(&pid)
                .map(|p| p.exists)
                .unwrap_or(false)
        }

        fn is_stopped(&self, pid: u32) -> Option<bool> {
            self.procs.borrow().get(&pid).map(|p| p.stopped)
        }
    }

    const ALIVE: FakeProc = FakeProc {
        exists: true,
        stopped: false,
        deny: false,
    };

    fn controller(backend: FakeBackend) -> Controller<FakeBackend> {
        let config = ControlConfig {
            poll_interval_ms: 1,
            verify_timeout_ms: 20,
        };
        Controller::new(backend, ProcessId(999), config)
    }

    #[test]
    fn test_pause_resume_roundtrip() {
        let ctl = controller(FakeBackend::with(&[(100, ALIVE)]));

        assert_eq!(ctl.pause(ProcessId(100)), ControlOutcome::Success);
        assert_eq!(ctl.backend.is_stopped(100), Some(true));

        assert_eq!(ctl.resume(ProcessId(100)), ControlOutcome::Success);
        assert_eq!(ctl.backend.is_stopped(100), Some(false));
    }

    #[test]
    fn test_terminate_graceful_and_forced() {
        let ctl = controller(FakeBackend::with(&[(100, ALIVE), (101, ALIVE)]));

        assert_eq!(
            ctl.terminate(ProcessId(100), TerminateMode::Graceful),
            ControlOutcome::Success
        );
        assert!(!ctl.backend.exists(100));

        assert_eq!(
            ctl.terminate(ProcessId(101), TerminateMode::Forced),
            ControlOutcome::Success
        );
        assert!(!ctl.backend.exists(101));
    }

    #[test]
    fn test_self_pid_refused_before_any_os_call() {
        let ctl = controller(FakeBackend::with(&[(999, ALIVE)]));

        assert_eq!(ctl.pause(ProcessId(999)), ControlOutcome::Refused);
        assert_eq!(
            ctl.terminate(ProcessId(999), TerminateMode::Forced),
            ControlOutcome::Refused
        );
        // The fake process was never touched.
        assert!(ctl.backend.exists(999));
        assert_eq!(ctl.backend.is_stopped(999), Some(false));
    }

    #[test]
    fn test_gone_process_is_benign_not_found() {
        let ctl = controller(FakeBackend::with(&[]));
        assert_eq!(
            ctl.terminate(ProcessId(100), TerminateMode::Graceful),
            ControlOutcome::NotFound
        );
        assert!(!ControlOutcome::NotFound.needs_attention());
    }

    #[test]
    fn test_permission_denied_surfaced() {
        let denied = FakeProc {
            exists: true,
            stopped: false,
            deny: true,
        };
        let ctl = controller(FakeBackend::with(&[(100, denied)]));
        let outcome = ctl.pause(ProcessId(100));
        assert_eq!(outcome, ControlOutcome::PermissionDenied);
        assert!(outcome.needs_attention());
    }

    #[test]
    fn test_batch_terminate_collects_all_outcomes() {
        // Five selected, two already gone: three successes, two benign
        // not-found, and nothing aborts.
        let gone = FakeProc {
            exists: false,
            stopped: false,
            deny: false,
        };
        let ctl = controller(FakeBackend::with(&[
            (100, ALIVE),
            (101, gone),
            (102, ALIVE),
            (103, gone),
            (104, ALIVE),
        ]));

        let selection: SelectionSet =
            [100, 101, 102, 103, 104].map(ProcessId).into_iter().collect();
        let outcomes = ctl.apply_batch(
            &selection,
            ControlOp::Terminate(TerminateMode::Graceful),
        );

        assert_eq!(outcomes.len(), 5);
        let successes = outcomes
            .iter()
            .filter(|(_, o)| *o == ControlOutcome::Success)
            .count();
        let not_found = outcomes
            .iter()
            .filter(|(_, o)| *o == ControlOutcome::NotFound)
            .count();
        assert_eq!(successes, 3);
        assert_eq!(not_found, 2);
    }

    #[test]
    fn test_verify_timeout_reports_unknown() {
        /// Accepts signals but the process never changes state.
        struct StuckBackend;
        impl SignalBackend for StuckBackend {
            fn send(&self, _pid: u32, _signal: Signal) -> Result<(), SendError> {
                Ok(())
            }
            fn exists(&self, _pid: u32) -> bool {
                true
            }
            fn is_stopped(&self, _pid: u32) -> Option<bool> {
                Some(false)
            }
        }

        let config = ControlConfig {
            poll_interval_ms: 1,
            verify_timeout_ms: 10,
        };
        let ctl = Controller::new(StuckBackend, ProcessId(999), config);
        assert_eq!(ctl.pause(ProcessId(100)), ControlOutcome::TimedOut);
        assert_eq!(
            ctl.terminate(ProcessId(100), TerminateMode::Graceful),
            ControlOutcome::TimedOut
        );
    }

    #[test]
    fn test_selection_set_toggle_and_clear() {
        let mut sel = SelectionSet::new();
        assert!(sel.toggle(ProcessId(1)));
        assert!(sel.toggle(ProcessId(2)));
        assert!(sel.contains(ProcessId(1)));
        assert_eq!(sel.len(), 2);

        // Toggling again deselects.
        assert!(!sel.toggle(ProcessId(1)));
        assert!(!sel.contains(ProcessId(1)));

        sel.clear();
        assert!(sel.is_empty());
    }
}
