use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;

use procmux_core::{FrameHeader, FRAME_HEADER_LEN, REQUEST_FIXED_LEN};

/// Largest accepted request body. Oversized frames are drained and answered
/// with an ill-formed report so the stream stays in sync.
pub const MAX_FRAME_DATA: usize = 1024 * 1024;

/// Most descriptors accepted with one request; the ancillary buffer is
/// sized for exactly this many.
pub const MAX_FRAME_FDS: usize = 32;

/// What the reader task hands to the supervisor loop.
#[derive(Debug)]
pub enum ControlEvent {
	/// A frame whose envelope was acceptable. The body still needs
	/// decoding; `fds` are owned here and close on drop if unused.
	Request { data: Vec<u8>, fds: Vec<OwnedFd> },
	/// The envelope itself was bad. Data was drained, descriptors closed.
	Malformed { tag: u32, reason: String },
	/// Peer closed the channel, or reading failed (treated the same).
	Eof,
}

/// The inherited AF_UNIX stream: spawn requests with SCM_RIGHTS descriptors
/// in, status messages out.
pub struct ControlSocket {
	io: Arc<AsyncFd<UnixStream>>,
}

impl ControlSocket {
	/// Takes ownership of the descriptor the invoker provided, verifying it
	/// is actually a socket before committing to it.
	///
	/// # Safety contract
	/// The caller asserts `fd` is open and unowned elsewhere in the
	/// process; this is the invocation contract for the well-known slot.
	pub fn adopt(fd: RawFd) -> io::Result<Self> {
		let stream = unsafe { UnixStream::from_raw_fd(fd) };
		stream.local_addr()?;
		Self::from_std(stream)
	}

	/// Wraps an already-owned stream; the path tests use with socketpairs.
	pub fn from_std(stream: UnixStream) -> io::Result<Self> {
		stream.set_nonblocking(true)?;
		set_cloexec(stream.as_raw_fd())?;
		let io = AsyncFd::with_interest(stream, Interest::READABLE | Interest::WRITABLE)?;
		Ok(Self { io: Arc::new(io) })
	}

	/// Shared handle for the outbound writer and for shutting down reads.
	pub fn io(&self) -> Arc<AsyncFd<UnixStream>> {
		Arc::clone(&self.io)
	}

	/// Produces the next control event. Never fails: read errors collapse
	/// into [`ControlEvent::Eof`], malformed envelopes are reported after
	/// the stream has been resynced.
	pub async fn next_event(&self) -> ControlEvent {
		let mut header = [0u8; FRAME_HEADER_LEN];
		match self.read_exact(&mut header).await {
			Ok(n) if n == FRAME_HEADER_LEN => {}
			Ok(0) => return ControlEvent::Eof,
			Ok(n) => {
				tracing::warn!("control channel closed {} bytes into a frame header", n);
				return ControlEvent::Eof;
			}
			Err(err) => {
				tracing::warn!("control channel read error: {}", err);
				return ControlEvent::Eof;
			}
		}

		let FrameHeader { data_len, n_fds } = FrameHeader::decode(&header);
		let data_len = data_len as usize;
		let n_fds = n_fds as usize;

		if let Some(reason) = envelope_error(data_len, n_fds) {
			tracing::warn!("discarding request: {}", reason);
			return match self.drain_body(data_len).await {
				Ok(tag) => ControlEvent::Malformed { tag, reason },
				Err(err) => {
					tracing::warn!("control channel failed while draining: {}", err);
					ControlEvent::Eof
				}
			};
		}

		let mut data = vec![0u8; data_len];
		let mut fds = Vec::new();
		let mut filled = 0;
		while filled < data_len {
			match self.recv_with_fds(&mut data[filled..], &mut fds).await {
				Ok(0) => {
					tracing::warn!("control channel closed {} bytes into a request body", filled);
					return ControlEvent::Eof;
				}
				Ok(n) => filled += n,
				Err(err) => {
					tracing::warn!("control channel read error: {}", err);
					return ControlEvent::Eof;
				}
			}
		}

		ControlEvent::Request { data, fds }
	}

	/// Reads and discards `len` body bytes (closing any descriptors that
	/// ride along), returning the tag from the first four bytes when there
	/// were that many.
	async fn drain_body(&self, len: usize) -> io::Result<u32> {
		let mut head = [0u8; 4];
		let mut seen = 0;
		let mut scratch = vec![0u8; 8 * 1024];
		while seen < len {
			let want = scratch.len().min(len - seen);
			let mut fds = Vec::new();
			let n = self.recv_with_fds(&mut scratch[..want], &mut fds).await?;
			if n == 0 {
				return Err(io::ErrorKind::UnexpectedEof.into());
			}
			for (i, &byte) in scratch[..n].iter().enumerate() {
				if seen + i < 4 {
					head[seen + i] = byte;
				}
			}
			seen += n;
		}
		Ok(if len >= 4 { u32::from_ne_bytes(head) } else { 0 })
	}

	async fn read_exact(&self, buf: &mut [u8]) -> io::Result<usize> {
		let mut filled = 0;
		while filled < buf.len() {
			let slice = &mut buf[filled..];
			let n = self
				.io
				.async_io(Interest::READABLE, |stream| {
					let mut stream = stream;
					loop {
						match stream.read(slice) {
							Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
							result => break result,
						}
					}
				})
				.await?;
			if n == 0 {
				break;
			}
			filled += n;
		}
		Ok(filled)
	}

	/// One `recvmsg`, appending any SCM_RIGHTS descriptors (received
	/// close-on-exec) to `fds`. Returns the byte count; 0 is EOF.
	async fn recv_with_fds(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
		let (n, received) = self
			.io
			.async_io(Interest::READABLE, |stream| {
				let raw = stream.as_raw_fd();
				let mut cmsg = nix::cmsg_space!([RawFd; MAX_FRAME_FDS]);
				let mut iov = [io::IoSliceMut::new(buf)];
				loop {
					match recvmsg::<()>(raw, &mut iov, Some(&mut cmsg), MsgFlags::MSG_CMSG_CLOEXEC) {
						Err(nix::errno::Errno::EINTR) => continue,
						Err(err) => break Err(io::Error::from(err)),
						Ok(msg) => {
							let mut received = Vec::new();
							let iter = msg.cmsgs().map_err(io::Error::from)?;
							for cmsg in iter {
								if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
									for fd in raw_fds {
										received.push(unsafe { OwnedFd::from_raw_fd(fd) });
									}
								}
							}
							break Ok((msg.bytes, received));
						}
					}
				}
			})
			.await?;
		fds.extend(received);
		Ok(n)
	}
}

fn envelope_error(data_len: usize, n_fds: usize) -> Option<String> {
	if data_len < REQUEST_FIXED_LEN {
		Some(format!("frame body of {} bytes is below the {}-byte minimum", data_len, REQUEST_FIXED_LEN))
	} else if n_fds == 0 {
		Some("frame carries no descriptors".to_string())
	} else if data_len > MAX_FRAME_DATA {
		Some(format!("frame body of {} bytes exceeds the {}-byte limit", data_len, MAX_FRAME_DATA))
	} else if n_fds > MAX_FRAME_FDS {
		Some(format!("frame carries {} descriptors, limit is {}", n_fds, MAX_FRAME_FDS))
	} else {
		None
	}
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
	unsafe {
		let flags = libc::fcntl(fd, libc::F_GETFD);
		if flags < 0 {
			return Err(io::Error::last_os_error());
		}
		if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
			return Err(io::Error::last_os_error());
		}
	}
	Ok(())
}

/// Runs the reader as its own task so a half-read frame can never be lost
/// to branch cancellation in the supervisor loop.
pub fn spawn_reader(socket: ControlSocket, tx: mpsc::Sender<ControlEvent>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			let event = socket.next_event().await;
			let eof = matches!(event, ControlEvent::Eof);
			if tx.send(event).await.is_err() || eof {
				break;
			}
		}
	})
}
