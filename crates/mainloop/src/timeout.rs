//! Millisecond timers with optional repetition.
//!
//! An enabled timeout owns a strong reference to itself. A one-shot timeout
//! created and enabled without keeping a handle therefore survives until it
//! fires, and is released right after its handler returns. Disabling releases
//! the self reference as well.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use busline_core::callback::{CallbackContext, guard};
use busline_core::{Error, NativeHandle, Result, UserData};
use tracing::{debug, trace, warn};

use crate::dispatcher::{Dispatcher, DispatcherInner};

/// Handler run when a timeout expires. Errors and panics are logged and otherwise ignored.
pub type TimeoutHandler = dyn Fn(&Timeout, Option<&UserData>) -> anyhow::Result<()>;

const MIN_INTERVAL: Duration = Duration::from_millis(1);
const MAX_INTERVAL: Duration = Duration::from_millis(i32::MAX as u64);

pub(crate) struct TimeoutInner {
	handle: NativeHandle,
	interval: Cell<Duration>,
	repeat: Cell<bool>,
	enabled: Cell<bool>,
	/// Bumped on every arm and disarm, so a stale expiry can be told apart.
	epoch: Cell<u64>,
	callback: CallbackContext<TimeoutHandler>,
	dispatcher: Rc<DispatcherInner>,
	anchor: RefCell<Option<Rc<TimeoutInner>>>,
}

impl TimeoutInner {
	pub(crate) fn epoch(&self) -> u64 {
		self.epoch.get()
	}

	fn bump(&self) -> u64 {
		let next = self.epoch.get().wrapping_add(1);
		self.epoch.set(next);
		next
	}

	fn arm(&self) -> Result<()> {
		let interval = self.interval.get();
		self.dispatcher.with_backend(|backend| backend.arm_timer(self.handle, interval))
	}

	fn disarm(&self) -> Result<()> {
		self.dispatcher.with_backend(|backend| backend.disarm_timer(self.handle))
	}

	/// Handles an expiry observed at `epoch`.
	///
	/// A one-shot is disabled and its self reference moved out before the
	/// handler runs, so the handler may enable it again. The moved reference is
	/// released after the handler returns.
	pub(crate) fn fire(this: &Rc<Self>, epoch: u64) -> bool {
		if !this.enabled.get() || this.epoch.get() != epoch {
			return false;
		}

		let repeat = this.repeat.get();
		let released = if repeat {
			None
		} else {
			this.enabled.set(false);
			this.bump();
			if let Err(err) = this.disarm() {
				debug!(handle = %this.handle, %err, "timeout.disarm_failed");
			}
			this.anchor.borrow_mut().take()
		};

		if let Some(handler) = this.callback.handler() {
			let data = this.callback.data();
			let timeout = Timeout { inner: Rc::clone(this) };
			guard("timeout", &this.handle, || handler(&timeout, data.as_ref()));
		} else {
			trace!(handle = %this.handle, "timeout.no_handler");
		}

		if repeat && this.enabled.get() && this.epoch.get() == epoch {
			this.bump();
			if let Err(err) = this.arm() {
				warn!(handle = %this.handle, %err, "timeout.rearm_failed");
				this.enabled.set(false);
				this.bump();
				let anchor = this.anchor.borrow_mut().take();
				drop(anchor);
			}
		}

		drop(released);
		true
	}
}

impl Drop for TimeoutInner {
	fn drop(&mut self) {
		if self.enabled.get()
			&& let Err(err) = self.disarm()
		{
			debug!(handle = %self.handle, %err, "timeout.disarm_failed");
		}
		self.dispatcher.token.with_registry(|registry| registry.remove(self.handle));
		trace!(handle = %self.handle, "timeout.drop");
	}
}

fn check_interval(interval: Duration) -> Result<()> {
	if interval < MIN_INTERVAL {
		return Err(Error::InvalidArgument(format!(
			"timeout interval must be at least 1ms, got {interval:?}"
		)));
	}
	if interval > MAX_INTERVAL {
		return Err(Error::InvalidArgument(format!(
			"timeout interval must be at most {MAX_INTERVAL:?}, got {interval:?}"
		)));
	}
	Ok(())
}

/// A timer delivering expiry to a handler.
///
/// Created disabled. Cloning yields another handle to the same timeout.
#[derive(Clone)]
pub struct Timeout {
	inner: Rc<TimeoutInner>,
}

impl Timeout {
	/// Shortest accepted interval.
	pub const MIN_INTERVAL: Duration = MIN_INTERVAL;
	/// Longest accepted interval, the range of a native millisecond timeout.
	pub const MAX_INTERVAL: Duration = MAX_INTERVAL;

	pub fn new(
		dispatcher: &Dispatcher,
		interval: Duration,
		repeat: bool,
		handler: impl Fn(&Timeout, Option<&UserData>) -> anyhow::Result<()> + 'static,
		data: Option<UserData>,
	) -> Result<Self> {
		check_interval(interval)?;
		let dispatcher = Rc::clone(&dispatcher.inner);
		let handle = dispatcher.token.with_registry(|registry| registry.reserve());
		let handler: Rc<TimeoutHandler> = Rc::new(handler);
		let inner = Rc::new(TimeoutInner {
			handle,
			interval: Cell::new(interval),
			repeat: Cell::new(repeat),
			enabled: Cell::new(false),
			epoch: Cell::new(0),
			callback: CallbackContext::new(Some(handler), data),
			dispatcher,
			anchor: RefCell::new(None),
		});
		inner.dispatcher.token.with_registry(|registry| registry.bind(handle, &inner));
		debug!(%handle, ?interval, repeat, "timeout.new");
		Ok(Self { inner })
	}

	pub fn handle(&self) -> NativeHandle {
		self.inner.handle
	}

	pub fn interval(&self) -> Duration {
		self.inner.interval.get()
	}

	/// Changes the interval. An armed countdown keeps its deadline; the new
	/// interval applies from the next arming.
	pub fn set_interval(&self, interval: Duration) -> Result<()> {
		check_interval(interval)?;
		self.inner.interval.set(interval);
		Ok(())
	}

	pub fn repeat(&self) -> bool {
		self.inner.repeat.get()
	}

	/// Changes whether the timeout re-arms after firing. The current countdown
	/// is not affected.
	pub fn set_repeat(&self, repeat: bool) {
		self.inner.repeat.set(repeat);
	}

	pub fn is_enabled(&self) -> bool {
		self.inner.enabled.get()
	}

	/// Arms or disarms the timeout.
	///
	/// Enabling an already enabled timeout keeps the running countdown.
	pub fn set_enabled(&self, enabled: bool) -> Result<()> {
		let inner = &self.inner;
		if inner.enabled.get() == enabled {
			return Ok(());
		}
		if enabled {
			inner.arm()?;
			inner.bump();
			inner.enabled.set(true);
			*inner.anchor.borrow_mut() = Some(Rc::clone(inner));
		} else {
			inner.enabled.set(false);
			inner.bump();
			let anchor = inner.anchor.borrow_mut().take();
			drop(anchor);
			inner.disarm()?;
		}
		trace!(handle = %inner.handle, enabled, "timeout.set_enabled");
		Ok(())
	}

	pub fn data(&self) -> Option<UserData> {
		self.inner.callback.data()
	}

	/// Replaces the user data, returning the previous value.
	pub fn set_data(&self, data: Option<UserData>) -> Option<UserData> {
		self.inner.callback.set_data(data)
	}

	pub fn set_handler(&self, handler: Option<Rc<TimeoutHandler>>) {
		self.inner.callback.set_handler(handler);
	}

	pub fn dispatcher(&self) -> Dispatcher {
		Dispatcher {
			inner: Rc::clone(&self.inner.dispatcher),
		}
	}

	/// Returns `true` if both handles refer to the same timeout.
	pub fn ptr_eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.inner, &other.inner)
	}

	/// Weak reference for observing when the timeout is released.
	pub fn downgrade(&self) -> WeakTimeout {
		WeakTimeout(Rc::downgrade(&self.inner))
	}
}

impl fmt::Debug for Timeout {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Timeout")
			.field("handle", &self.inner.handle)
			.field("interval", &self.inner.interval.get())
			.field("repeat", &self.inner.repeat.get())
			.field("enabled", &self.inner.enabled.get())
			.finish()
	}
}

/// Non-owning reference to a [`Timeout`].
#[derive(Clone)]
pub struct WeakTimeout(std::rc::Weak<TimeoutInner>);

impl WeakTimeout {
	pub fn upgrade(&self) -> Option<Timeout> {
		self.0.upgrade().map(|inner| Timeout { inner })
	}

	/// Returns `true` once the timeout has been released.
	pub fn is_released(&self) -> bool {
		self.0.strong_count() == 0
	}
}

impl fmt::Debug for WeakTimeout {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WeakTimeout").field("released", &self.is_released()).finish()
	}
}
