use std::io::{IoSlice, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::time::Duration;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use procmux_core::{FrameHeader, StatusHeader, ENVC_INHERIT, STATUS_HEADER_LEN};
use procmuxd::{supervisor, Config, ControlSocket};

const IO_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
	client: UnixStream,
	supervisor: JoinHandle<std::io::Result<()>>,
}

fn test_config() -> Config {
	Config {
		grace: Duration::from_secs(1),
		..Config::default()
	}
}

async fn start(cfg: Config) -> Harness {
	let (client, server) = StdUnixStream::pair().unwrap();
	let control = ControlSocket::from_std(server).unwrap();
	let supervisor = tokio::spawn(supervisor::run(cfg, control));
	client.set_nonblocking(true).unwrap();
	let client = UnixStream::from_std(client).unwrap();
	Harness { client, supervisor }
}

impl Harness {
	/// Sends one framed spawn request with the given descriptors attached.
	async fn send_request(&self, body: &[u8], fds: &[RawFd]) {
		let header = FrameHeader {
			data_len: body.len() as u32,
			n_fds: fds.len() as u32,
		}
		.encode();
		self.send_all(&header, &[]).await;
		self.send_all(body, fds).await;
	}

	async fn send_all(&self, buf: &[u8], fds: &[RawFd]) {
		let mut sent = 0;
		let mut fds_pending = !fds.is_empty();
		while sent < buf.len() {
			self.client.writable().await.unwrap();
			let iov = [IoSlice::new(&buf[sent..])];
			let cmsgs: Vec<ControlMessage> = if fds_pending {
				vec![ControlMessage::ScmRights(fds)]
			} else {
				Vec::new()
			};
			match sendmsg::<()>(
				self.client.as_raw_fd(),
				&iov,
				&cmsgs,
				MsgFlags::empty(),
				None,
			) {
				Ok(n) => {
					if n > 0 {
						fds_pending = false;
					}
					sent += n;
				}
				Err(nix::errno::Errno::EAGAIN) => continue,
				Err(err) => panic!("sendmsg failed: {}", err),
			}
		}
	}

	async fn recv_message(&mut self) -> (StatusHeader, Vec<u8>) {
		let mut header = [0u8; STATUS_HEADER_LEN];
		timeout(IO_TIMEOUT, self.client.read_exact(&mut header))
			.await
			.expect("timed out waiting for a status message")
			.unwrap();
		let header = StatusHeader::decode(&header);
		let mut payload = vec![0u8; header.len as usize];
		timeout(IO_TIMEOUT, self.client.read_exact(&mut payload))
			.await
			.expect("timed out waiting for a status payload")
			.unwrap();
		(header, payload)
	}

	/// Reads status-3 chunks for `stream` until the matching status-4,
	/// returning the concatenated bytes.
	async fn recv_output(&mut self, tag: u32, stream: u32) -> Vec<u8> {
		let mut collected = Vec::new();
		loop {
			let (header, payload) = self.recv_message().await;
			assert_eq!(header.tag, tag);
			assert_eq!(header.value, stream);
			match header.status {
				3 => collected.extend_from_slice(&payload),
				4 => return collected,
				other => panic!("expected output traffic, got status {}", other),
			}
		}
	}

	/// Half-closes our sending direction, which the supervisor sees as EOF.
	async fn close_control(&mut self) {
		self.client.shutdown().await.unwrap();
	}

	async fn join(self) {
		timeout(IO_TIMEOUT, self.supervisor)
			.await
			.expect("supervisor did not exit")
			.unwrap()
			.unwrap();
	}
}

fn request_body(tag: u32, disps: [u8; 3], argc: u32, envc: u32, strings: &[&[u8]]) -> Vec<u8> {
	let mut out = Vec::new();
	out.extend_from_slice(&tag.to_ne_bytes());
	out.push(0);
	out.extend_from_slice(&disps);
	out.extend_from_slice(&argc.to_ne_bytes());
	out.extend_from_slice(&envc.to_ne_bytes());
	for s in strings {
		out.extend_from_slice(s);
		out.push(0);
	}
	out
}

/// Every request must attach at least one descriptor; tests that do not
/// exercise passed descriptors attach /dev/null.
fn filler_fd() -> std::fs::File {
	std::fs::File::open("/dev/null").unwrap()
}

const DISP_DEFAULT: u8 = 0x00;
const DISP_INHERIT: u8 = 0xFF;

// --- Happy path ---

#[tokio::test]
async fn echo_reports_started_output_close_exit() {
	let mut h = start(test_config()).await;
	let filler = filler_fd();

	let body = request_body(
		7,
		[DISP_DEFAULT, DISP_DEFAULT, DISP_INHERIT],
		2,
		ENVC_INHERIT,
		&[b"/bin/echo", b"echo", b"hello"],
	);
	h.send_request(&body, &[filler.as_raw_fd()]).await;

	let (started, _) = h.recv_message().await;
	assert_eq!((started.tag, started.status), (7, 2));
	assert!(started.value > 0, "pid must be positive");

	let output = h.recv_output(7, 1).await;
	assert_eq!(output, b"hello\n");

	let (exited, _) = h.recv_message().await;
	assert_eq!((exited.tag, exited.status, exited.value), (7, 5, 0));

	h.close_control().await;
	h.join().await;
}

#[tokio::test]
async fn output_bytes_survive_chunking() {
	let mut h = start(test_config()).await;
	let filler = filler_fd();

	let script = b"i=0; while [ $i -lt 200 ]; do printf 0123456789; i=$((i+1)); done";
	let body = request_body(
		3,
		[DISP_DEFAULT, DISP_DEFAULT, DISP_INHERIT],
		3,
		ENVC_INHERIT,
		&[b"/bin/sh", b"sh", b"-c", script],
	);
	h.send_request(&body, &[filler.as_raw_fd()]).await;

	let (started, _) = h.recv_message().await;
	assert_eq!((started.tag, started.status), (3, 2));

	let output = h.recv_output(3, 1).await;
	let expected: Vec<u8> = b"0123456789".repeat(200);
	assert_eq!(output, expected);

	let (exited, _) = h.recv_message().await;
	assert_eq!((exited.tag, exited.status, exited.value), (3, 5, 0));

	h.close_control().await;
	h.join().await;
}

// --- Spawn failures ---

#[tokio::test]
async fn exec_failure_reports_errno() {
	let mut h = start(test_config()).await;
	let filler = filler_fd();

	let body = request_body(
		11,
		[DISP_DEFAULT, DISP_DEFAULT, DISP_DEFAULT],
		0,
		ENVC_INHERIT,
		&[b"/no/such/binary"],
	);
	h.send_request(&body, &[filler.as_raw_fd()]).await;

	let (failed, payload) = h.recv_message().await;
	assert_eq!((failed.tag, failed.status), (11, 1));
	assert_eq!(failed.value, libc::ENOENT as u32);
	assert!(!payload.is_empty(), "spawn errors carry a message");

	// Nothing else may follow for that tag: closing the channel must take
	// the supervisor straight to a clean exit.
	h.close_control().await;
	let mut rest = Vec::new();
	timeout(IO_TIMEOUT, h.client.read_to_end(&mut rest))
		.await
		.unwrap()
		.unwrap();
	assert!(rest.is_empty());
	h.join().await;
}

// --- Protocol errors ---

#[tokio::test]
async fn frame_without_descriptors_is_rejected() {
	let mut h = start(test_config()).await;

	let body = request_body(9, [DISP_INHERIT; 3], 0, ENVC_INHERIT, &[]);
	assert_eq!(body.len(), 16);
	h.send_request(&body, &[]).await;

	let (rejected, payload) = h.recv_message().await;
	assert_eq!((rejected.tag, rejected.status, rejected.value), (9, 0, 0));
	assert!(!payload.is_empty());

	// The channel stays usable afterwards.
	let filler = filler_fd();
	let body = request_body(
		10,
		[DISP_DEFAULT, DISP_INHERIT, DISP_INHERIT],
		0,
		ENVC_INHERIT,
		&[b"/bin/true"],
	);
	h.send_request(&body, &[filler.as_raw_fd()]).await;
	let (started, _) = h.recv_message().await;
	assert_eq!((started.tag, started.status), (10, 2));
	let (exited, _) = h.recv_message().await;
	assert_eq!((exited.tag, exited.status, exited.value), (10, 5, 0));

	h.close_control().await;
	h.join().await;
}

#[tokio::test]
async fn live_tag_cannot_be_reused() {
	let mut h = start(test_config()).await;
	let filler = filler_fd();

	let body = request_body(
		5,
		[DISP_DEFAULT, DISP_INHERIT, DISP_INHERIT],
		2,
		ENVC_INHERIT,
		&[b"/bin/sleep", b"sleep", b"30"],
	);
	h.send_request(&body, &[filler.as_raw_fd()]).await;
	let (started, _) = h.recv_message().await;
	assert_eq!((started.tag, started.status), (5, 2));

	let dup = request_body(
		5,
		[DISP_DEFAULT, DISP_INHERIT, DISP_INHERIT],
		0,
		ENVC_INHERIT,
		&[b"/bin/true"],
	);
	h.send_request(&dup, &[filler.as_raw_fd()]).await;
	let (rejected, payload) = h.recv_message().await;
	assert_eq!((rejected.tag, rejected.status), (5, 0));
	assert!(String::from_utf8_lossy(&payload).contains("live child"));

	// EOF terminates the sleeper with SIGTERM.
	h.close_control().await;
	let (exited, _) = h.recv_message().await;
	assert_eq!((exited.tag, exited.status), (5, 5));
	assert_eq!(exited.value & 0x7f, libc::SIGTERM as u32);
	h.join().await;
}

// --- argv and environment semantics ---

#[tokio::test]
async fn argc_zero_runs_with_program_as_sole_argument() {
	let mut h = start(test_config()).await;
	let filler = filler_fd();

	let body = request_body(
		21,
		[DISP_DEFAULT, DISP_DEFAULT, DISP_INHERIT],
		0,
		ENVC_INHERIT,
		&[b"/bin/echo"],
	);
	h.send_request(&body, &[filler.as_raw_fd()]).await;

	let (started, _) = h.recv_message().await;
	assert_eq!((started.tag, started.status), (21, 2));
	// echo with no arguments prints only the newline.
	assert_eq!(h.recv_output(21, 1).await, b"\n");
	let (exited, _) = h.recv_message().await;
	assert_eq!((exited.tag, exited.status, exited.value), (21, 5, 0));

	h.close_control().await;
	h.join().await;
}

#[tokio::test]
async fn explicit_environment_replaces_everything() {
	let mut h = start(test_config()).await;
	let filler = filler_fd();

	let body = request_body(
		22,
		[DISP_DEFAULT, DISP_DEFAULT, DISP_INHERIT],
		0,
		1,
		&[b"/usr/bin/env", b"PROCMUX_ONLY=1"],
	);
	h.send_request(&body, &[filler.as_raw_fd()]).await;

	let (started, _) = h.recv_message().await;
	assert_eq!((started.tag, started.status), (22, 2));
	assert_eq!(h.recv_output(22, 1).await, b"PROCMUX_ONLY=1\n");
	let (exited, _) = h.recv_message().await;
	assert_eq!((exited.tag, exited.status, exited.value), (22, 5, 0));

	h.close_control().await;
	h.join().await;
}

#[tokio::test]
async fn empty_environment_means_empty() {
	let mut h = start(test_config()).await;
	let filler = filler_fd();

	let body = request_body(
		23,
		[DISP_DEFAULT, DISP_DEFAULT, DISP_INHERIT],
		0,
		0,
		&[b"/usr/bin/env"],
	);
	h.send_request(&body, &[filler.as_raw_fd()]).await;

	let (started, _) = h.recv_message().await;
	assert_eq!((started.tag, started.status), (23, 2));
	assert_eq!(h.recv_output(23, 1).await, b"");
	let (exited, _) = h.recv_message().await;
	assert_eq!((exited.tag, exited.status, exited.value), (23, 5, 0));

	h.close_control().await;
	h.join().await;
}

#[tokio::test]
async fn inherited_environment_reaches_the_child() {
	std::env::set_var("PROCMUX_TEST_MARKER", "yes");
	let mut h = start(test_config()).await;
	let filler = filler_fd();

	let body = request_body(
		24,
		[DISP_DEFAULT, DISP_DEFAULT, DISP_INHERIT],
		0,
		ENVC_INHERIT,
		&[b"/usr/bin/env"],
	);
	h.send_request(&body, &[filler.as_raw_fd()]).await;

	let (started, _) = h.recv_message().await;
	assert_eq!((started.tag, started.status), (24, 2));
	let output = h.recv_output(24, 1).await;
	assert!(String::from_utf8_lossy(&output).contains("PROCMUX_TEST_MARKER=yes"));
	let (exited, _) = h.recv_message().await;
	assert_eq!((exited.tag, exited.status, exited.value), (24, 5, 0));

	h.close_control().await;
	h.join().await;
}

// --- Descriptor wiring ---

#[tokio::test]
async fn default_stdin_reads_eof_immediately() {
	let mut h = start(test_config()).await;
	let filler = filler_fd();

	// cat with /dev/null on stdin exits at once with nothing to say.
	let body = request_body(
		31,
		[DISP_DEFAULT, DISP_DEFAULT, DISP_INHERIT],
		0,
		ENVC_INHERIT,
		&[b"/bin/cat"],
	);
	h.send_request(&body, &[filler.as_raw_fd()]).await;

	let (started, _) = h.recv_message().await;
	assert_eq!((started.tag, started.status), (31, 2));
	assert_eq!(h.recv_output(31, 1).await, b"");
	let (exited, _) = h.recv_message().await;
	assert_eq!((exited.tag, exited.status, exited.value), (31, 5, 0));

	h.close_control().await;
	h.join().await;
}

#[tokio::test]
async fn passed_descriptor_becomes_child_stdout() {
	let mut h = start(test_config()).await;

	let (pipe_read, pipe_write) = nix::unistd::pipe().unwrap();
	let body = request_body(
		32,
		[DISP_DEFAULT, 0x01, DISP_INHERIT],
		2,
		ENVC_INHERIT,
		&[b"/bin/echo", b"echo", b"through-the-pipe"],
	);
	h.send_request(&body, &[pipe_write.as_raw_fd()]).await;
	drop(pipe_write);

	let (started, _) = h.recv_message().await;
	assert_eq!((started.tag, started.status), (32, 2));
	// stdout went to the passed pipe, so the protocol only reports exit.
	let (exited, _) = h.recv_message().await;
	assert_eq!((exited.tag, exited.status, exited.value), (32, 5, 0));

	let mut from_pipe = String::new();
	std::fs::File::from(pipe_read).read_to_string(&mut from_pipe).unwrap();
	assert_eq!(from_pipe, "through-the-pipe\n");

	h.close_control().await;
	h.join().await;
}

// --- Shutdown ---

#[tokio::test]
async fn eof_terminates_children_with_sigterm() {
	let mut h = start(test_config()).await;
	let filler = filler_fd();

	let body = request_body(
		41,
		[DISP_DEFAULT, DISP_INHERIT, DISP_INHERIT],
		2,
		ENVC_INHERIT,
		&[b"/bin/sleep", b"sleep", b"30"],
	);
	h.send_request(&body, &[filler.as_raw_fd()]).await;
	let (started, _) = h.recv_message().await;
	assert_eq!((started.tag, started.status), (41, 2));

	h.close_control().await;

	let (exited, _) = h.recv_message().await;
	assert_eq!((exited.tag, exited.status), (41, 5));
	assert_eq!(exited.value & 0x7f, libc::SIGTERM as u32);
	h.join().await;
}

#[tokio::test]
async fn grace_expiry_escalates_to_sigkill() {
	let mut h = start(test_config()).await;
	let filler = filler_fd();

	let body = request_body(
		42,
		[DISP_DEFAULT, DISP_INHERIT, DISP_INHERIT],
		3,
		ENVC_INHERIT,
		&[b"/bin/sh", b"sh", b"-c", b"trap '' TERM; sleep 30"],
	);
	h.send_request(&body, &[filler.as_raw_fd()]).await;
	let (started, _) = h.recv_message().await;
	assert_eq!((started.tag, started.status), (42, 2));

	h.close_control().await;

	let (exited, _) = h.recv_message().await;
	assert_eq!((exited.tag, exited.status), (42, 5));
	assert_eq!(exited.value & 0x7f, libc::SIGKILL as u32);
	h.join().await;
}

#[tokio::test]
async fn write_failure_suppresses_output_but_children_complete() {
	let mut h = start(test_config()).await;
	let filler = filler_fd();

	// Close our reading direction: every status write now fails.
	unsafe {
		assert_eq!(libc::shutdown(h.client.as_raw_fd(), libc::SHUT_RD), 0);
	}

	let body = request_body(
		51,
		[DISP_DEFAULT, DISP_DEFAULT, DISP_INHERIT],
		2,
		ENVC_INHERIT,
		&[b"/bin/echo", b"echo", b"nobody-is-listening"],
	);
	h.send_request(&body, &[filler.as_raw_fd()]).await;

	// The supervisor must still reap the child and exit cleanly on EOF.
	h.close_control().await;
	h.join().await;
}
