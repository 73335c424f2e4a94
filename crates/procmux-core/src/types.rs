use std::ffi::OsString;
use std::fmt;

/// Sentinel `envc` meaning "inherit the supervisor's environment".
pub const ENVC_INHERIT: u32 = 0xFFFF_FFFF;

/// Size of the fixed status-message header.
pub const STATUS_HEADER_LEN: usize = 16;

/// Where one of the child's standard descriptors should come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
	/// Inherit the supervisor's descriptor.
	Inherit,
	/// `/dev/null` for fd 0; a forwarded pipe for fds 1 and 2.
	Default,
	/// One of the descriptors passed alongside the request (zero-based).
	Passed(usize),
}

impl Disposition {
	/// Decodes a wire disposition byte. `0xFF` is inherit, `0x00` is the
	/// per-descriptor default, and `k` names passed descriptor `k - 1`.
	pub fn from_wire(byte: u8) -> Self {
		match byte {
			0xFF => Disposition::Inherit,
			0x00 => Disposition::Default,
			k => Disposition::Passed(k as usize - 1),
		}
	}
}

/// A fully validated spawn request.
///
/// `argv` is never empty: when the request carried `argc == 0` the
/// executable name is reused as the sole argv entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
	pub tag: u32,
	pub stdin: Disposition,
	pub stdout: Disposition,
	pub stderr: Disposition,
	pub program: OsString,
	pub argv: Vec<OsString>,
	/// `None` inherits the supervisor's environment; `Some` replaces it
	/// (possibly with nothing).
	pub env: Option<Vec<(OsString, OsString)>>,
}

/// Status codes carried in the second header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	/// Request could not be parsed. Payload is a human-readable reason.
	IllFormed,
	/// System error while creating the process. `value` is the errno,
	/// payload a human-readable message.
	SpawnError,
	/// Process created. `value` is the pid.
	Started,
	/// Output chunk. `value` is 1 for stdout, 2 for stderr; payload is the
	/// raw bytes of one pipe read, never reblocked.
	Output,
	/// An output stream reached EOF. `value` is 1 or 2.
	OutputClosed,
	/// Process exited. `value` is the raw wait status.
	Exited,
}

impl Status {
	pub fn code(self) -> u32 {
		match self {
			Status::IllFormed => 0,
			Status::SpawnError => 1,
			Status::Started => 2,
			Status::Output => 3,
			Status::OutputClosed => 4,
			Status::Exited => 5,
		}
	}

	pub fn from_code(code: u32) -> Option<Self> {
		match code {
			0 => Some(Status::IllFormed),
			1 => Some(Status::SpawnError),
			2 => Some(Status::Started),
			3 => Some(Status::Output),
			4 => Some(Status::OutputClosed),
			5 => Some(Status::Exited),
			_ => None,
		}
	}
}

/// Identifies which forwarded stream an output message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
	Stdout,
	Stderr,
}

impl OutputStream {
	pub fn wire_value(self) -> u32 {
		match self {
			OutputStream::Stdout => 1,
			OutputStream::Stderr => 2,
		}
	}
}

/// One status message, ready to encode.
#[derive(Debug, Clone)]
pub struct StatusMessage {
	pub tag: u32,
	pub status: Status,
	pub value: u32,
	pub payload: Vec<u8>,
}

impl StatusMessage {
	pub fn ill_formed(tag: u32, reason: impl Into<String>) -> Self {
		Self {
			tag,
			status: Status::IllFormed,
			value: 0,
			payload: reason.into().into_bytes(),
		}
	}

	pub fn spawn_error(tag: u32, errno: u32, message: impl Into<String>) -> Self {
		Self {
			tag,
			status: Status::SpawnError,
			value: errno,
			payload: message.into().into_bytes(),
		}
	}

	pub fn started(tag: u32, pid: u32) -> Self {
		Self { tag, status: Status::Started, value: pid, payload: Vec::new() }
	}

	pub fn output(tag: u32, stream: OutputStream, chunk: Vec<u8>) -> Self {
		Self { tag, status: Status::Output, value: stream.wire_value(), payload: chunk }
	}

	pub fn output_closed(tag: u32, stream: OutputStream) -> Self {
		Self { tag, status: Status::OutputClosed, value: stream.wire_value(), payload: Vec::new() }
	}

	pub fn exited(tag: u32, wait_status: u32) -> Self {
		Self { tag, status: Status::Exited, value: wait_status, payload: Vec::new() }
	}

	/// Encodes header and payload into one buffer so the message goes out
	/// as a single ordered write.
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(STATUS_HEADER_LEN + self.payload.len());
		out.extend_from_slice(&self.tag.to_ne_bytes());
		out.extend_from_slice(&self.status.code().to_ne_bytes());
		out.extend_from_slice(&self.value.to_ne_bytes());
		out.extend_from_slice(&(self.payload.len() as u32).to_ne_bytes());
		out.extend_from_slice(&self.payload);
		out
	}
}

/// Decoded form of the fixed status-message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusHeader {
	pub tag: u32,
	pub status: u32,
	pub value: u32,
	pub len: u32,
}

impl StatusHeader {
	pub fn decode(bytes: &[u8; STATUS_HEADER_LEN]) -> Self {
		let field = |i: usize| {
			u32::from_ne_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
		};
		Self {
			tag: field(0),
			status: field(4),
			value: field(8),
			len: field(12),
		}
	}

	pub fn status(&self) -> Option<Status> {
		Status::from_code(self.status)
	}
}

/// Reasons a spawn request body failed to decode. The Display text becomes
/// the payload of the status-0 reply.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
	/// Body shorter than the fixed 16-byte prefix.
	Truncated { len: usize },
	/// Non-zero flags byte.
	BadFlags(u8),
	/// A disposition referenced a passed descriptor that was not there.
	DescriptorIndex { child_fd: u32, index: usize, n_fds: usize },
	/// argc/envc claim more strings than the body could possibly hold.
	CountOverflow { argc: u32, envc: u32 },
	/// Ran out of body before the expected strings were all terminated.
	UnterminatedString { index: usize },
	/// Bytes left over after the last expected string.
	TrailingBytes { count: usize },
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DecodeError::Truncated { len } => {
				write!(f, "request body too short: {} bytes", len)
			}
			DecodeError::BadFlags(flags) => {
				write!(f, "reserved flags byte is 0x{:02x}, expected 0", flags)
			}
			DecodeError::DescriptorIndex { child_fd, index, n_fds } => {
				write!(
					f,
					"disposition for fd {} references passed descriptor {} but only {} were passed",
					child_fd, index, n_fds
				)
			}
			DecodeError::CountOverflow { argc, envc } => {
				write!(f, "argc {} / envc {} cannot fit in the request body", argc, envc)
			}
			DecodeError::UnterminatedString { index } => {
				write!(f, "string {} is not NUL-terminated within the body", index)
			}
			DecodeError::TrailingBytes { count } => {
				write!(f, "{} trailing bytes after the string section", count)
			}
		}
	}
}

impl std::error::Error for DecodeError {}
