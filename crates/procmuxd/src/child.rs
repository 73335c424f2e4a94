use std::os::unix::process::ExitStatusExt;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use procmux_core::{OutputStream, StatusMessage};

use crate::registry::Registry;
use crate::signals;
use crate::spawn::Launched;

/// Owns one running child: forwards its piped output, then reaps it and
/// reports the raw wait status.
///
/// Both pipes are read to EOF before the wait, which is what guarantees the
/// per-tag message order: output chunks, then one close per forwarded
/// stream, then exactly one exit report.
pub struct ChildActor {
	tag: u32,
	launched: Launched,
	registry: Registry,
	status_tx: mpsc::Sender<StatusMessage>,
	read_chunk: usize,
}

impl ChildActor {
	pub fn new(
		tag: u32,
		launched: Launched,
		registry: Registry,
		status_tx: mpsc::Sender<StatusMessage>,
		read_chunk: usize,
	) -> Self {
		Self { tag, launched, registry, status_tx, read_chunk }
	}

	pub async fn run(mut self) {
		let stdout = self.launched.child.stdout.take();
		let stderr = self.launched.child.stderr.take();
		tokio::join!(
			forward(stdout, OutputStream::Stdout, self.tag, &self.status_tx, self.read_chunk),
			forward(stderr, OutputStream::Stderr, self.tag, &self.status_tx, self.read_chunk),
		);

		let pid = self.launched.pid;
		let wait_status = match self.launched.child.wait().await {
			Ok(status) => status.into_raw() as u32,
			Err(err) => {
				tracing::warn!("wait for pid {} failed: {}", pid, err);
				0
			}
		};
		let _ = self
			.status_tx
			.send(StatusMessage::exited(self.tag, wait_status))
			.await;

		signals::untrack_child(pid);
		self.registry.remove(self.tag).await;
	}
}

/// Pumps one forwarded pipe: each successful read becomes one output
/// message, untouched. EOF and read errors both close the stream.
async fn forward<R>(
	reader: Option<R>,
	stream: OutputStream,
	tag: u32,
	status_tx: &mpsc::Sender<StatusMessage>,
	read_chunk: usize,
) where
	R: AsyncRead + Unpin,
{
	let Some(mut reader) = reader else {
		return;
	};
	let mut buf = vec![0u8; read_chunk];
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => {
				let chunk = buf[..n].to_vec();
				let _ = status_tx.send(StatusMessage::output(tag, stream, chunk)).await;
			}
			Err(err) => {
				tracing::debug!("pipe read for tag {} failed: {}", tag, err);
				break;
			}
		}
	}
	let _ = status_tx.send(StatusMessage::output_closed(tag, stream)).await;
}
