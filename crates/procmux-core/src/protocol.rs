use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;

use crate::types::{DecodeError, Disposition, SpawnRequest, ENVC_INHERIT};

/// Size of the frame header preceding every spawn request.
pub const FRAME_HEADER_LEN: usize = 8;

/// Fixed-size prefix of the request body, before the string section.
pub const REQUEST_FIXED_LEN: usize = 16;

/// The two-field envelope announcing a spawn request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
	pub data_len: u32,
	pub n_fds: u32,
}

impl FrameHeader {
	pub fn decode(bytes: &[u8; FRAME_HEADER_LEN]) -> Self {
		Self {
			data_len: u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
			n_fds: u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
		}
	}

	pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
		let mut out = [0u8; FRAME_HEADER_LEN];
		out[0..4].copy_from_slice(&self.data_len.to_ne_bytes());
		out[4..8].copy_from_slice(&self.n_fds.to_ne_bytes());
		out
	}
}

/// Decodes and validates a spawn request body.
///
/// `n_fds` is the number of descriptors that actually arrived with the
/// frame; dispositions are checked against it. The string section must hold
/// exactly the announced strings and nothing else. `argc == 0` sends no argv
/// strings and reuses the executable as the sole argv entry; an `envc` of
/// [`ENVC_INHERIT`] sends no env strings and keeps the supervisor's
/// environment.
pub fn decode_request(data: &[u8], n_fds: usize) -> Result<SpawnRequest, DecodeError> {
	if data.len() < REQUEST_FIXED_LEN {
		return Err(DecodeError::Truncated { len: data.len() });
	}

	let field = |i: usize| u32::from_ne_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
	let tag = field(0);

	let flags = data[4];
	if flags != 0 {
		return Err(DecodeError::BadFlags(flags));
	}

	let disposition = |child_fd: u32, byte: u8| -> Result<Disposition, DecodeError> {
		let disp = Disposition::from_wire(byte);
		if let Disposition::Passed(index) = disp {
			if index >= n_fds {
				return Err(DecodeError::DescriptorIndex { child_fd, index, n_fds });
			}
		}
		Ok(disp)
	};
	let stdin = disposition(0, data[5])?;
	let stdout = disposition(1, data[6])?;
	let stderr = disposition(2, data[7])?;

	let argc = field(8);
	let envc = field(12);
	let env_count = if envc == ENVC_INHERIT { 0 } else { envc as u64 };

	// Every string occupies at least its terminator, which bounds how many
	// the section can hold and keeps hostile counts from allocating.
	let section = &data[REQUEST_FIXED_LEN..];
	let expected = 1 + argc as u64 + env_count;
	if expected > section.len() as u64 {
		return Err(DecodeError::CountOverflow { argc, envc });
	}

	let mut strings = Vec::with_capacity(expected as usize);
	let mut rest = section;
	for index in 0..expected as usize {
		match rest.iter().position(|&b| b == 0) {
			Some(nul) => {
				strings.push(OsString::from_vec(rest[..nul].to_vec()));
				rest = &rest[nul + 1..];
			}
			None => return Err(DecodeError::UnterminatedString { index }),
		}
	}
	if !rest.is_empty() {
		return Err(DecodeError::TrailingBytes { count: rest.len() });
	}

	let mut strings = strings.into_iter();
	let program = strings.next().unwrap_or_default();
	let argv = if argc == 0 {
		vec![program.clone()]
	} else {
		strings.by_ref().take(argc as usize).collect()
	};
	let env = if envc == ENVC_INHERIT {
		None
	} else {
		Some(strings.map(split_env_entry).collect())
	};

	Ok(SpawnRequest { tag, stdin, stdout, stderr, program, argv, env })
}

/// Splits a `KEY=VALUE` environ entry at the first `=`. An entry with no
/// `=` becomes a variable with an empty value.
fn split_env_entry(entry: OsString) -> (OsString, OsString) {
	let bytes = entry.into_vec();
	match bytes.iter().position(|&b| b == b'=') {
		Some(eq) => {
			let value = bytes[eq + 1..].to_vec();
			let mut key = bytes;
			key.truncate(eq);
			(OsString::from_vec(key), OsString::from_vec(value))
		}
		None => (OsString::from_vec(bytes), OsString::new()),
	}
}
