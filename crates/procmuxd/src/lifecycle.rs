use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::time::Instant;

/// Shutdown progression. Strictly monotone: once the supervisor leaves
/// `Run` it never accepts another spawn request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Run,
	Drain,
	HardDrain,
}

/// Tracks where the supervisor is in its shutdown and when surviving
/// children get escalated.
#[derive(Debug)]
pub struct Lifecycle {
	phase: Phase,
	deadline: Option<Instant>,
}

impl Lifecycle {
	pub fn new() -> Self {
		Self { phase: Phase::Run, deadline: None }
	}

	pub fn phase(&self) -> Phase {
		self.phase
	}

	pub fn is_running(&self) -> bool {
		self.phase == Phase::Run
	}

	/// The instant at which `Drain` escalates, while armed.
	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}

	/// Enters `Drain` and arms the grace timer. Returns false if shutdown
	/// had already begun, in which case nothing changes.
	pub fn begin_drain(&mut self, grace: Duration) -> bool {
		if self.phase != Phase::Run {
			return false;
		}
		self.phase = Phase::Drain;
		self.deadline = Some(Instant::now() + grace);
		true
	}

	/// Enters `HardDrain` and disarms the timer.
	pub fn harden(&mut self) {
		self.phase = Phase::HardDrain;
		self.deadline = None;
	}
}

impl Default for Lifecycle {
	fn default() -> Self {
		Self::new()
	}
}

/// Delivers `signal` to every pid in the list. Races with reaping are
/// expected; a vanished pid is not an error.
pub fn signal_all(pids: &[u32], signal: Signal) {
	for &pid in pids {
		if let Err(err) = kill(Pid::from_raw(pid as i32), signal) {
			tracing::debug!("kill({}, {}) failed: {}", pid, signal, err);
		}
	}
}
