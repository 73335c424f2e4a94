//! # procmux-core
//!
//! Wire protocol shared by the procmux supervisor and anything that talks
//! to it.
//!
//! The supervisor listens on an AF_UNIX stream it inherits on a well-known
//! descriptor. Each spawn request is a pair of sub-messages: an 8-byte frame
//! header (`data_len`, `n_fds`, native-endian u32), then `data_len` bytes of
//! inline data carrying `n_fds` descriptors as SCM_RIGHTS ancillary data.
//! The inline data layout:
//!
//! ```text
//! offset  size  field
//!      0     4  tag
//!      4     1  flags (must be 0)
//!      5     1  disposition of child fd 0
//!      6     1  disposition of child fd 1
//!      7     1  disposition of child fd 2
//!      8     4  argc
//!     12     4  envc (0xFFFF_FFFF = inherit)
//!     16     …  NUL-terminated strings: executable, argv entries, env entries
//! ```
//!
//! Disposition bytes: `0xFF` inherits the supervisor's descriptor; `0x00`
//! attaches `/dev/null` for fd 0 and a forwarded pipe for fds 1 and 2;
//! `k >= 1` attaches passed descriptor `k - 1`.
//!
//! Status messages flow back on the same stream: a 16-byte header
//! `(tag, status, value, len)` of native-endian u32, then `len` payload
//! bytes. See [`Status`] for the codes and [`StatusMessage`] for the
//! per-code payload conventions.

mod protocol;
mod types;

pub use protocol::{decode_request, FrameHeader, FRAME_HEADER_LEN, REQUEST_FIXED_LEN};
pub use types::{
	DecodeError, Disposition, OutputStream, SpawnRequest, Status, StatusHeader, StatusMessage,
	ENVC_INHERIT, STATUS_HEADER_LEN,
};
