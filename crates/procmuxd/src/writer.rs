use std::io;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use procmux_core::StatusMessage;

/// Runs the outbound side of the status channel.
///
/// Every status message funnels through the channel into this one task, so
/// messages reach the wire in send order. After a hard write error the task
/// keeps draining the channel and discards everything: children are left to
/// run, get read, and get reaped exactly as before, silently.
pub fn spawn_writer(
	io: Arc<AsyncFd<UnixStream>>,
	mut rx: mpsc::Receiver<StatusMessage>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut suppressed = false;
		while let Some(message) = rx.recv().await {
			if suppressed {
				continue;
			}
			let buf = message.encode();
			if let Err(err) = write_all(&io, &buf).await {
				tracing::warn!("status channel write failed, discarding further status traffic: {}", err);
				suppressed = true;
			}
		}
	})
}

/// Writes the whole buffer, retrying partial writes and deferring on
/// writable readiness when the socket would block.
async fn write_all(io: &AsyncFd<UnixStream>, buf: &[u8]) -> io::Result<()> {
	let mut written = 0;
	while written < buf.len() {
		let slice = &buf[written..];
		let n = io
			.async_io(Interest::WRITABLE, |stream| loop {
				match nix::unistd::write(stream, slice) {
					Err(nix::errno::Errno::EINTR) => continue,
					Err(err) => break Err(io::Error::from(err)),
					Ok(n) => break Ok(n),
				}
			})
			.await?;
		written += n;
	}
	Ok(())
}
