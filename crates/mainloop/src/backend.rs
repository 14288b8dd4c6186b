//! Capability interface every main-loop backend implements.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use busline_core::NativeHandle;

use crate::WatchFlags;

/// Readiness reported by one backend iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
	/// A registered descriptor became ready.
	Watch { handle: NativeHandle, flags: WatchFlags },
	/// An armed timer expired. The backend disarms it before reporting.
	Timer { handle: NativeHandle },
}

/// Main-loop primitives consumed by the dispatcher.
///
/// Backends never call user code. They only report readiness keyed by the
/// [`NativeHandle`] a registration was made with; the dispatcher resolves the
/// handle and runs the handler after the backend call has returned.
pub trait Backend {
	/// Short name for logs.
	fn name(&self) -> &'static str;

	/// Starts monitoring `fd` for `interest`.
	fn add_watch(&mut self, handle: NativeHandle, fd: RawFd, interest: WatchFlags) -> io::Result<()>;

	/// Changes the conditions monitored for an existing watch.
	fn modify_watch(&mut self, handle: NativeHandle, interest: WatchFlags) -> io::Result<()>;

	/// Stops monitoring. Unknown handles are ignored.
	fn remove_watch(&mut self, handle: NativeHandle) -> io::Result<()>;

	/// Arms a one-shot timer, replacing any countdown already running for `handle`.
	fn arm_timer(&mut self, handle: NativeHandle, after: Duration) -> io::Result<()>;

	/// Cancels a timer. Unknown or expired handles are ignored.
	fn disarm_timer(&mut self, handle: NativeHandle) -> io::Result<()>;

	/// Runs one iteration, appending ready events to `events`.
	///
	/// With `block` set, waits until at least one registration is ready, the
	/// next timer expires, or the wait is interrupted. Must return immediately
	/// when nothing is registered.
	fn iterate(&mut self, block: bool, events: &mut Vec<LoopEvent>) -> io::Result<()>;

	/// Asks a blocked [`Self::iterate`] to return.
	fn stop(&mut self) -> io::Result<()> {
		Ok(())
	}

	/// Returns `true` when no watch or timer is registered.
	fn is_idle(&self) -> bool;

	/// Releases backend resources. Called once, when the last user of the loop is gone.
	fn teardown(&mut self) {}
}
