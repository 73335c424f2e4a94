use std::os::fd::RawFd;
use std::time::Duration;

/// Runtime settings. The daemon takes no command-line arguments; everything
/// here has a documented default, and the grace period honors an
/// environment override for tests and unusual deployments.
#[derive(Debug, Clone)]
pub struct Config {
	/// Descriptor the control socket arrives on.
	pub control_fd: RawFd,
	/// How long children get between the first shutdown signal and SIGKILL.
	pub grace: Duration,
	/// Upper bound for one pipe read; one read becomes one output message.
	pub read_chunk: usize,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			control_fd: default_control_fd(),
			grace: Duration::from_secs(default_grace_secs()),
			read_chunk: default_read_chunk(),
		}
	}
}

fn default_control_fd() -> RawFd {
	3
}
fn default_grace_secs() -> u64 {
	5
}
fn default_read_chunk() -> usize {
	16 * 1024
}

impl Config {
	pub fn from_env() -> Self {
		let mut cfg = Self::default();
		if let Ok(secs) = std::env::var("PROCMUX_GRACE_SECS") {
			match secs.parse::<u64>() {
				Ok(secs) => cfg.grace = Duration::from_secs(secs),
				Err(_) => eprintln!("warning: ignoring unparseable PROCMUX_GRACE_SECS={}", secs),
			}
		}
		cfg
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		let cfg = Config::default();
		assert_eq!(cfg.control_fd, 3);
		assert_eq!(cfg.grace, Duration::from_secs(5));
		assert!(cfg.read_chunk >= 8 * 1024 && cfg.read_chunk <= 64 * 1024);
	}
}
