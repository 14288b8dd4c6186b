//! Descriptor watches.

use std::cell::Cell;
use std::fmt;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;

use busline_core::callback::{CallbackContext, guard};
use busline_core::{Error, NativeHandle, Result, UserData};
use tracing::{debug, trace};

use crate::WatchFlags;
use crate::dispatcher::{Dispatcher, DispatcherInner};

/// Handler run when a watch becomes ready.
///
/// Receives the watch, the ready conditions and the watch's user data. Errors
/// and panics are logged and otherwise ignored.
pub type WatchHandler = dyn Fn(&Watch, WatchFlags, Option<&UserData>) -> anyhow::Result<()>;

pub(crate) struct WatchInner {
	handle: NativeHandle,
	fd: RawFd,
	interest: Cell<WatchFlags>,
	enabled: Cell<bool>,
	pending: Cell<WatchFlags>,
	callback: CallbackContext<WatchHandler>,
	dispatcher: Rc<DispatcherInner>,
}

impl WatchInner {
	/// Records readiness for delivery later in the same iteration.
	pub(crate) fn latch(&self, flags: WatchFlags) -> bool {
		if !self.enabled.get() {
			return false;
		}
		self.pending.set(self.pending.get() | flags);
		true
	}

	/// Runs the handler with whatever is still latched.
	pub(crate) fn deliver(self: &Rc<Self>) -> bool {
		if !self.enabled.get() {
			return false;
		}
		let flags = self.pending.take();
		if flags.is_empty() {
			return false;
		}
		let Some(handler) = self.callback.handler() else {
			trace!(handle = %self.handle, "watch.no_handler");
			return false;
		};
		let data = self.callback.data();
		let watch = Watch { inner: Rc::clone(self) };
		guard("watch", &self.handle, || handler(&watch, flags, data.as_ref()));
		true
	}
}

impl Drop for WatchInner {
	fn drop(&mut self) {
		if self.enabled.get()
			&& let Err(err) = self.dispatcher.with_backend(|backend| backend.remove_watch(self.handle))
		{
			debug!(handle = %self.handle, %err, "watch.remove_failed");
		}
		self.dispatcher.token.with_registry(|registry| registry.remove(self.handle));
		trace!(handle = %self.handle, fd = self.fd, "watch.drop");
	}
}

fn check_descriptor(fd: RawFd) -> Result<()> {
	if fd < 0 {
		return Err(Error::InvalidArgument(format!("descriptor {fd} is negative")));
	}
	// SAFETY: the descriptor is only queried, never closed or retained.
	let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
	rustix::io::fcntl_getfd(borrowed).map_err(|err| Error::InvalidArgument(format!("descriptor {fd} is not open: {err}")))?;
	Ok(())
}

fn check_flags(flags: WatchFlags) -> Result<()> {
	if flags.is_empty() {
		return Err(Error::InvalidArgument("watch needs at least one event flag".into()));
	}
	Ok(())
}

/// A monitored descriptor with an event mask and handler.
///
/// The caller keeps ownership of the descriptor and must keep it open while
/// the watch is enabled. Cloning yields another handle to the same watch; the
/// watch is unregistered when the last handle is dropped.
#[derive(Clone)]
pub struct Watch {
	inner: Rc<WatchInner>,
}

impl Watch {
	/// Creates an enabled watch on `fd`.
	pub fn new(
		dispatcher: &Dispatcher,
		fd: RawFd,
		flags: WatchFlags,
		handler: impl Fn(&Watch, WatchFlags, Option<&UserData>) -> anyhow::Result<()> + 'static,
		data: Option<UserData>,
	) -> Result<Self> {
		check_flags(flags)?;
		check_descriptor(fd)?;

		let dispatcher = Rc::clone(&dispatcher.inner);
		let handle = dispatcher.token.with_registry(|registry| registry.reserve());
		if let Err(err) = dispatcher.with_backend(|backend| backend.add_watch(handle, fd, flags)) {
			dispatcher.token.with_registry(|registry| registry.remove(handle));
			return Err(err);
		}

		let handler: Rc<WatchHandler> = Rc::new(handler);
		let inner = Rc::new(WatchInner {
			handle,
			fd,
			interest: Cell::new(flags),
			enabled: Cell::new(true),
			pending: Cell::new(WatchFlags::empty()),
			callback: CallbackContext::new(Some(handler), data),
			dispatcher,
		});
		inner.dispatcher.token.with_registry(|registry| registry.bind(handle, &inner));
		debug!(%handle, fd, flags = ?flags, "watch.new");
		Ok(Self { inner })
	}

	pub fn handle(&self) -> NativeHandle {
		self.inner.handle
	}

	pub fn fd(&self) -> RawFd {
		self.inner.fd
	}

	pub fn flags(&self) -> WatchFlags {
		self.inner.interest.get()
	}

	/// Replaces the event mask.
	pub fn set_flags(&self, flags: WatchFlags) -> Result<()> {
		check_flags(flags)?;
		if self.inner.enabled.get() {
			self.inner.dispatcher.with_backend(|backend| backend.modify_watch(self.inner.handle, flags))?;
		}
		self.inner.interest.set(flags);
		Ok(())
	}

	pub fn is_enabled(&self) -> bool {
		self.inner.enabled.get()
	}

	/// Starts or stops monitoring.
	///
	/// Once disabling returns, the handler is not invoked again until the watch
	/// is re-enabled, even for readiness already latched in this iteration.
	pub fn set_enabled(&self, enabled: bool) -> Result<()> {
		let inner = &self.inner;
		if inner.enabled.get() == enabled {
			return Ok(());
		}
		if enabled {
			inner
				.dispatcher
				.with_backend(|backend| backend.add_watch(inner.handle, inner.fd, inner.interest.get()))?;
		} else {
			inner.pending.set(WatchFlags::empty());
			inner.dispatcher.with_backend(|backend| backend.remove_watch(inner.handle))?;
		}
		inner.enabled.set(enabled);
		trace!(handle = %inner.handle, enabled, "watch.set_enabled");
		Ok(())
	}

	/// Returns and clears readiness latched but not yet delivered.
	pub fn clear_pending(&self) -> WatchFlags {
		self.inner.pending.take()
	}

	pub fn data(&self) -> Option<UserData> {
		self.inner.callback.data()
	}

	/// Replaces the user data, returning the previous value.
	pub fn set_data(&self, data: Option<UserData>) -> Option<UserData> {
		self.inner.callback.set_data(data)
	}

	/// Replaces the handler. A watch without a handler drops its events.
	pub fn set_handler(&self, handler: Option<Rc<WatchHandler>>) {
		self.inner.callback.set_handler(handler);
	}

	pub fn dispatcher(&self) -> Dispatcher {
		Dispatcher {
			inner: Rc::clone(&self.inner.dispatcher),
		}
	}

	/// Returns `true` if both handles refer to the same watch.
	pub fn ptr_eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.inner, &other.inner)
	}
}

impl fmt::Debug for Watch {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Watch")
			.field("handle", &self.inner.handle)
			.field("fd", &self.inner.fd)
			.field("flags", &self.inner.interest.get())
			.field("enabled", &self.inner.enabled.get())
			.finish()
	}
}
