use std::io;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::c_int;
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};

/// Streams for every signal that means "wind down kindly". Receipt behaves
/// like EOF on the control channel, except children are first sent the
/// signal that arrived rather than SIGTERM.
pub struct TermSignals {
	hangup: SignalStream,
	interrupt: SignalStream,
	quit: SignalStream,
	alarm: SignalStream,
	terminate: SignalStream,
	vtalarm: SignalStream,
	xcpu: SignalStream,
	xfsz: SignalStream,
	power: SignalStream,
}

impl TermSignals {
	pub fn new() -> io::Result<Self> {
		Ok(Self {
			hangup: signal(SignalKind::hangup())?,
			interrupt: signal(SignalKind::interrupt())?,
			quit: signal(SignalKind::quit())?,
			alarm: signal(SignalKind::alarm())?,
			terminate: signal(SignalKind::terminate())?,
			vtalarm: signal(SignalKind::from_raw(libc::SIGVTALRM))?,
			xcpu: signal(SignalKind::from_raw(libc::SIGXCPU))?,
			xfsz: signal(SignalKind::from_raw(libc::SIGXFSZ))?,
			power: signal(SignalKind::from_raw(libc::SIGPWR))?,
		})
	}

	/// Completes when any signal in the set arrives, yielding which one.
	pub async fn recv(&mut self) -> Signal {
		tokio::select! {
			_ = self.hangup.recv() => Signal::SIGHUP,
			_ = self.interrupt.recv() => Signal::SIGINT,
			_ = self.quit.recv() => Signal::SIGQUIT,
			_ = self.alarm.recv() => Signal::SIGALRM,
			_ = self.terminate.recv() => Signal::SIGTERM,
			_ = self.vtalarm.recv() => Signal::SIGVTALRM,
			_ = self.xcpu.recv() => Signal::SIGXCPU,
			_ = self.xfsz.recv() => Signal::SIGXFSZ,
			_ = self.power.recv() => Signal::SIGPWR,
		}
	}
}

/// Catchable signals that would otherwise terminate us and mean nothing
/// here; explicitly ignored. Stop signals behave normally.
const IGNORED_SIGNALS: [c_int; 6] = [
	libc::SIGUSR1,
	libc::SIGUSR2,
	libc::SIGPIPE,
	libc::SIGSTKFLT,
	libc::SIGPROF,
	libc::SIGIO,
];

/// Crash-class signals: children are SIGKILLed from the handler, then the
/// default action (usually a core dump) is allowed to happen.
const FATAL_SIGNALS: [c_int; 7] = [
	libc::SIGILL,
	libc::SIGABRT,
	libc::SIGFPE,
	libc::SIGBUS,
	libc::SIGSEGV,
	libc::SIGSYS,
	libc::SIGTRAP,
];

const MAX_TRACKED: usize = 1024;

// Fixed-size pid table the fatal handler can walk without allocating or
// locking. Zero marks a free slot.
static LIVE_CHILDREN: [AtomicI32; MAX_TRACKED] = [const { AtomicI32::new(0) }; MAX_TRACKED];

/// Records a live child so a crashing supervisor takes it down too.
pub fn track_child(pid: u32) {
	let pid = pid as i32;
	for slot in &LIVE_CHILDREN {
		if slot.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
			return;
		}
	}
	tracing::warn!("crash-kill table full; pid {} untracked", pid);
}

pub fn untrack_child(pid: u32) {
	let pid = pid as i32;
	for slot in &LIVE_CHILDREN {
		if slot.compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
			return;
		}
	}
}

// Runs in crash context: async-signal-safe calls only (kill, signal, raise).
extern "C" fn fatal_handler(sig: c_int) {
	for slot in &LIVE_CHILDREN {
		let pid = slot.load(Ordering::Acquire);
		if pid > 0 {
			unsafe {
				libc::kill(pid, libc::SIGKILL);
			}
		}
	}
	unsafe {
		libc::signal(sig, libc::SIG_DFL);
		libc::raise(sig);
	}
}

/// Installs the crash handler for the fatal set and the ignore set.
/// Call once during single-threaded startup.
pub fn install_process_handlers() -> io::Result<()> {
	unsafe {
		for &sig in &FATAL_SIGNALS {
			let mut sa: libc::sigaction = std::mem::zeroed();
			sa.sa_sigaction = fatal_handler as extern "C" fn(c_int) as libc::sighandler_t;
			libc::sigemptyset(&mut sa.sa_mask);
			if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
				return Err(io::Error::last_os_error());
			}
		}
		for &sig in &IGNORED_SIGNALS {
			let mut sa: libc::sigaction = std::mem::zeroed();
			sa.sa_sigaction = libc::SIG_IGN;
			libc::sigemptyset(&mut sa.sa_mask);
			if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
				return Err(io::Error::last_os_error());
			}
		}
	}
	Ok(())
}

#[cfg(test)]
fn is_tracked(pid: u32) -> bool {
	LIVE_CHILDREN.iter().any(|slot| slot.load(Ordering::Acquire) == pid as i32)
}
