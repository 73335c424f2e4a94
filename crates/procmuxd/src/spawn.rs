use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::Stdio;

use tokio::process::Child;

use procmux_core::{Disposition, SpawnRequest};

/// A child that made it through fork and exec. The pipes for any forwarded
/// streams hang off `child`.
pub struct Launched {
	pub child: Child,
	pub pid: u32,
}

/// System error while creating the process. Carries the errno the failing
/// call reported; for exec failures that is the errno from the child side.
#[derive(Debug)]
pub struct SpawnError {
	pub errno: u32,
	pub message: String,
}

impl SpawnError {
	fn from_io(context: &str, err: io::Error) -> Self {
		Self {
			errno: err.raw_os_error().unwrap_or(0) as u32,
			message: format!("{}: {}", context, err),
		}
	}
}

impl fmt::Display for SpawnError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for SpawnError {}

/// Builds and spawns the requested process.
///
/// Descriptor wiring follows the dispositions: inherited slots are left
/// alone, defaults become `/dev/null` (fd 0) or a forwarded pipe (fds 1, 2),
/// and passed descriptors are duplicated into place, so one descriptor may
/// serve several slots. Unconsumed passed descriptors are the caller's to
/// close. The child starts with default signal handlers, an empty signal
/// mask, and nothing open above fd 2 (everything the supervisor holds is
/// close-on-exec).
pub fn launch(request: &SpawnRequest, fds: &[OwnedFd]) -> Result<Launched, SpawnError> {
	let mut cmd = std::process::Command::new(&request.program);
	cmd.arg0(&request.argv[0]);
	cmd.args(&request.argv[1..]);

	if let Some(env) = &request.env {
		cmd.env_clear();
		cmd.envs(env.iter().map(|(key, value)| (key, value)));
	}

	cmd.stdin(stdio_for(request.stdin, fds, true)?);
	cmd.stdout(stdio_for(request.stdout, fds, false)?);
	cmd.stderr(stdio_for(request.stderr, fds, false)?);

	// Child side of fork: async-signal-safe calls only.
	unsafe {
		cmd.pre_exec(reset_signal_state);
	}

	let mut cmd = tokio::process::Command::from(cmd);
	let child = cmd
		.spawn()
		.map_err(|err| SpawnError::from_io("spawn failed", err))?;
	let pid = child.id().unwrap_or(0);
	Ok(Launched { child, pid })
}

fn stdio_for(disposition: Disposition, fds: &[OwnedFd], is_stdin: bool) -> Result<Stdio, SpawnError> {
	match disposition {
		Disposition::Inherit => Ok(Stdio::inherit()),
		Disposition::Default if is_stdin => Ok(Stdio::null()),
		Disposition::Default => Ok(Stdio::piped()),
		Disposition::Passed(index) => {
			// The decoder bounds-checked the index against the fd array.
			let dup = fds[index]
				.try_clone()
				.map_err(|err| SpawnError::from_io("duplicating passed descriptor", err))?;
			Ok(Stdio::from(dup))
		}
	}
}

// Exec resets caught handlers on its own, but ignored dispositions and the
// blocked mask would survive into the new program.
fn reset_signal_state() -> io::Result<()> {
	unsafe {
		for sig in 1..32 {
			libc::signal(sig, libc::SIG_DFL);
		}
		let mut empty: libc::sigset_t = std::mem::zeroed();
		libc::sigemptyset(&mut empty);
		libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
	}
	Ok(())
}
