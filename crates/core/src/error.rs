//! Error types shared by every busline crate.

use std::fmt;
use std::io;

use thiserror::Error;

/// Subsystem that reported a native failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facility {
	/// The protocol engine itself (initialization, teardown).
	Engine,
	/// Message transport and protocol handling.
	Protocol,
	/// The main-loop backend.
	Loop,
}

impl Facility {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Engine => "engine",
			Self::Protocol => "protocol",
			Self::Loop => "loop",
		}
	}
}

impl fmt::Display for Facility {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Kind of D-Bus name rejected by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
	ObjectPath,
	InterfaceName,
	MemberName,
	BusName,
	ErrorName,
}

impl fmt::Display for NameKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::ObjectPath => "object path",
			Self::InterfaceName => "interface name",
			Self::MemberName => "member name",
			Self::BusName => "bus name",
			Self::ErrorName => "error name",
		})
	}
}

/// Possible errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
	/// A core operation ran before `lifecycle::init` or after `lifecycle::shutdown`.
	#[error("module not initialized")]
	NotInitialized,
	/// The protocol engine refused to start.
	#[error("engine initialization failed: {0}")]
	EngineInit(String),
	/// A caller-supplied argument violates the operation contract.
	#[error("invalid argument: {0}")]
	InvalidArgument(String),
	/// A path or name failed D-Bus syntax validation.
	#[error("invalid {kind} {value:?}: {reason}")]
	InvalidName {
		/// Which kind of name was checked.
		kind: NameKind,
		/// The rejected input.
		value: String,
		/// Rule that failed.
		reason: &'static str,
	},
	/// A type signature failed D-Bus syntax validation.
	#[error("invalid type signature {signature:?}: {reason}")]
	InvalidSignature {
		/// The rejected signature.
		signature: String,
		/// Rule that failed.
		reason: &'static str,
	},
	/// A native call failed.
	#[error("{facility} error {code}: {message}")]
	Native {
		/// Subsystem that failed.
		facility: Facility,
		/// OS error code, `-1` when the failure has none.
		code: i32,
		/// Human readable description.
		message: String,
	},
	/// An interface with the same name is already attached to the object.
	#[error("interface {0:?} is already attached")]
	DuplicateInterface(String),
	/// Removal was requested through an instance other than the attached one.
	#[error("interface {0:?} is attached through a different instance")]
	InterfaceMismatch(String),
	/// An object is already registered at the path.
	#[error("object path {0:?} is already registered")]
	DuplicateObject(String),
	/// The pending call already fired or was cancelled.
	#[error("pending call already completed")]
	CallCompleted,
	/// The connection has been closed.
	#[error("connection is closed")]
	Disconnected,
	/// A run mode string did not name a known mode.
	#[error("invalid run mode {0:?}")]
	InvalidRunMode(String),
	/// Configuration could not be read or parsed.
	#[error("configuration error: {0}")]
	Config(String),
}

impl Error {
	/// Wraps an I/O failure reported by a native collaborator.
	pub fn native(facility: Facility, err: &io::Error) -> Self {
		Self::Native {
			facility,
			code: err.raw_os_error().unwrap_or(-1),
			message: err.to_string(),
		}
	}

	/// Native failure without an OS error code.
	pub fn native_msg(facility: Facility, message: impl Into<String>) -> Self {
		Self::Native {
			facility,
			code: -1,
			message: message.into(),
		}
	}

	/// Returns the facility tag for native failures.
	pub fn facility(&self) -> Option<Facility> {
		match self {
			Self::Native { facility, .. } => Some(*facility),
			_ => None,
		}
	}
}

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn native_keeps_os_code_and_facility() {
		let err = Error::native(Facility::Loop, &io::Error::from_raw_os_error(9));
		assert_eq!(err.facility(), Some(Facility::Loop));
		let Error::Native { code, .. } = err else {
			panic!("expected native error");
		};
		assert_eq!(code, 9);
	}

	#[test]
	fn native_without_os_code_uses_minus_one() {
		let err = Error::native(Facility::Protocol, &io::Error::other("broken"));
		assert!(err.to_string().starts_with("protocol error -1:"), "got: {err}");
	}
}
