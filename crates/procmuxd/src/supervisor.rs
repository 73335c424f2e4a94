use std::io;
use std::net::Shutdown;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};

use procmux_core::{decode_request, StatusMessage};

use crate::child::ChildActor;
use crate::config::Config;
use crate::control::{spawn_reader, ControlEvent, ControlSocket};
use crate::lifecycle::{signal_all, Lifecycle};
use crate::registry::{ChildEntry, Registry};
use crate::signals::{self, TermSignals};
use crate::spawn;
use crate::writer::spawn_writer;

/// Drives the supervisor until shutdown completes: accepts spawn requests
/// from the control channel, launches and tracks children, and winds
/// everything down on EOF or a terminating signal.
///
/// Returns once the child table is empty after shutdown began and all
/// status messages have been flushed (or suppressed).
pub async fn run(cfg: Config, control: ControlSocket) -> io::Result<()> {
	signals::install_process_handlers()?;
	let mut term = TermSignals::new()?;

	let io = control.io();
	let (status_tx, status_rx) = mpsc::channel(256);
	let writer_task = spawn_writer(Arc::clone(&io), status_rx);

	let (event_tx, event_rx) = mpsc::channel(32);
	let reader_task = spawn_reader(control, event_tx);
	let mut events = Some(event_rx);

	let registry = Registry::new();
	let mut children: JoinSet<()> = JoinSet::new();
	let mut lifecycle = Lifecycle::new();

	loop {
		if !lifecycle.is_running() && children.is_empty() {
			break;
		}
		let deadline = lifecycle.deadline();

		tokio::select! {
			event = next_event(&mut events), if events.is_some() => match event {
				Some(ControlEvent::Request { data, fds }) => {
					handle_request(data, fds, &cfg, &registry, &status_tx, &mut children).await;
				}
				Some(ControlEvent::Malformed { tag, reason }) => {
					let _ = status_tx.send(StatusMessage::ill_formed(tag, reason)).await;
				}
				Some(ControlEvent::Eof) | None => {
					tracing::info!("control channel closed, draining");
					enter_drain(Signal::SIGTERM, &cfg, &mut lifecycle, &registry, &io, &mut events).await;
				}
			},
			signal = term.recv() => {
				tracing::info!("received {}, draining", signal);
				enter_drain(signal, &cfg, &mut lifecycle, &registry, &io, &mut events).await;
			}
			Some(_) = children.join_next(), if !children.is_empty() => {}
			_ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
				let survivors = registry.live_pids().await;
				tracing::info!("grace period expired, sending SIGKILL to {} children", survivors.len());
				signal_all(&survivors, Signal::SIGKILL);
				lifecycle.harden();
			}
		}
	}

	// All actors are done; dropping the last sender lets the writer flush
	// whatever the channel still holds and exit.
	drop(status_tx);
	let _ = writer_task.await;
	let _ = reader_task.await;
	tracing::info!("all children reaped, exiting");
	Ok(())
}

async fn next_event(events: &mut Option<mpsc::Receiver<ControlEvent>>) -> Option<ControlEvent> {
	match events {
		Some(rx) => rx.recv().await,
		None => None,
	}
}

/// Decodes one accepted frame and launches the child it describes,
/// reporting ill-formed / spawn-error / started as appropriate. The passed
/// descriptor array is closed on return; spawned children hold duplicates.
async fn handle_request(
	data: Vec<u8>,
	fds: Vec<OwnedFd>,
	cfg: &Config,
	registry: &Registry,
	status_tx: &mpsc::Sender<StatusMessage>,
	children: &mut JoinSet<()>,
) {
	let request = match decode_request(&data, fds.len()) {
		Ok(request) => request,
		Err(err) => {
			let tag = frame_tag(&data);
			tracing::warn!("rejecting request with tag {}: {}", tag, err);
			let _ = status_tx.send(StatusMessage::ill_formed(tag, err.to_string())).await;
			return;
		}
	};

	if registry.contains(request.tag).await {
		tracing::warn!("rejecting request: tag {} already names a live child", request.tag);
		let _ = status_tx
			.send(StatusMessage::ill_formed(
				request.tag,
				format!("tag {} already names a live child", request.tag),
			))
			.await;
		return;
	}

	match spawn::launch(&request, &fds) {
		Err(err) => {
			tracing::warn!("spawn for tag {} failed: {}", request.tag, err);
			let _ = status_tx
				.send(StatusMessage::spawn_error(request.tag, err.errno, err.message))
				.await;
		}
		Ok(launched) => {
			tracing::debug!("tag {} started as pid {}", request.tag, launched.pid);
			signals::track_child(launched.pid);
			registry.insert(request.tag, ChildEntry { pid: launched.pid }).await;
			let _ = status_tx
				.send(StatusMessage::started(request.tag, launched.pid))
				.await;
			children.spawn(
				ChildActor::new(
					request.tag,
					launched,
					registry.clone(),
					status_tx.clone(),
					cfg.read_chunk,
				)
				.run(),
			);
		}
	}
}

fn frame_tag(data: &[u8]) -> u32 {
	if data.len() >= 4 {
		u32::from_ne_bytes([data[0], data[1], data[2], data[3]])
	} else {
		0
	}
}

/// RUN → DRAIN: deliver the initiating signal to every live child, stop
/// taking requests, and close the inbound half of the control socket. A
/// no-op if shutdown already began.
async fn enter_drain(
	signal: Signal,
	cfg: &Config,
	lifecycle: &mut Lifecycle,
	registry: &Registry,
	io: &AsyncFd<UnixStream>,
	events: &mut Option<mpsc::Receiver<ControlEvent>>,
) {
	if !lifecycle.begin_drain(cfg.grace) {
		return;
	}
	// Dropping the receiver also ends the reader task; descriptors on any
	// queued frames close with their frames.
	*events = None;
	let _ = io.get_ref().shutdown(Shutdown::Read);
	signal_all(&registry.live_pids().await, signal);
}
