//! # procmuxd
//!
//! Subprocess-multiplexing supervisor.
//!
//! A controlling program starts procmuxd with an AF_UNIX stream socket on
//! fd 3, then sends spawn requests carrying descriptors over it and reads
//! tagged status messages back: process started, produced output, closed an
//! output stream, exited. That one connection is the whole interface: no
//! arguments, nothing on stdin or stdout, human-readable diagnostics on
//! stderr only.
//!
//! The wire format lives in [`procmux_core`]. The pieces here:
//!
//! - [`control`]: reads framed requests and their SCM_RIGHTS descriptors.
//! - [`spawn`]: wires descriptors per disposition and launches the child.
//! - [`child`]: per-child task forwarding output and reaping.
//! - [`registry`]: the table of live children.
//! - [`writer`]: serializes status messages onto the socket.
//! - [`lifecycle`] and [`supervisor`]: the RUN / DRAIN / HARD_DRAIN
//!   shutdown machine around the event loop.
//! - [`signals`]: terminate-signal streams and the crash-kill handler.
//!
//! Shutdown: on control-channel EOF or a terminating signal, every live
//! child receives that signal (SIGTERM for EOF), no further spawns are
//! accepted, and survivors get SIGKILL after the grace period; the
//! supervisor exits once the last child is reaped and reported.

pub mod child;
pub mod config;
pub mod control;
pub mod lifecycle;
pub mod registry;
pub mod signals;
pub mod spawn;
pub mod supervisor;
pub mod writer;

pub use config::Config;
pub use control::ControlSocket;
