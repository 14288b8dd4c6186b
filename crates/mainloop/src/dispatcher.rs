//! Owner of a main-loop backend; runs event processing.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::str::FromStr;

use busline_core::config::DispatcherConfig;
use busline_core::{Error, Facility, LifecycleToken, Result};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::backend::{Backend, LoopEvent};
use crate::poll::PollBackend;
use crate::timeout::TimeoutInner;
use crate::watch::WatchInner;

/// How long [`Dispatcher::run`] keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
	/// Block until [`Dispatcher::stop`] or until nothing is left to wait for.
	#[default]
	Wait,
	/// Process events that are already ready and return.
	NoWait,
	/// Block until at least one event is delivered.
	Once,
}

impl RunMode {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Wait => "wait",
			Self::NoWait => "nowait",
			Self::Once => "once",
		}
	}
}

impl fmt::Display for RunMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RunMode {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"wait" => Ok(Self::Wait),
			"nowait" | "no_wait" | "no-wait" => Ok(Self::NoWait),
			"once" => Ok(Self::Once),
			other => Err(Error::InvalidRunMode(other.to_owned())),
		}
	}
}

/// A backend shared by one or more dispatchers.
///
/// The backend is torn down when the last holder goes away: the loop wrapper
/// itself, a dispatcher, or any watch or timeout of such a dispatcher.
pub(crate) struct LoopCell {
	pub(crate) backend: RefCell<Box<dyn Backend>>,
	_token: LifecycleToken,
}

impl LoopCell {
	fn new(backend: Box<dyn Backend>) -> Result<Rc<Self>> {
		let token = LifecycleToken::acquire()?;
		Ok(Rc::new(Self {
			backend: RefCell::new(backend),
			_token: token,
		}))
	}
}

impl Drop for LoopCell {
	fn drop(&mut self) {
		let backend = self.backend.get_mut();
		debug!(backend = backend.name(), "loop.teardown");
		backend.teardown();
	}
}

/// A caller-supplied main loop that dispatchers can share without owning.
#[derive(Clone)]
pub struct EventLoop {
	cell: Rc<LoopCell>,
}

impl EventLoop {
	/// Creates a loop on the [`PollBackend`].
	pub fn new() -> Result<Self> {
		Self::with_backend(PollBackend::new())
	}

	pub fn with_backend(backend: impl Backend + 'static) -> Result<Self> {
		Ok(Self {
			cell: LoopCell::new(Box::new(backend))?,
		})
	}

	pub fn backend_name(&self) -> &'static str {
		self.cell.backend.borrow().name()
	}
}

impl fmt::Debug for EventLoop {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EventLoop").field("backend", &self.backend_name()).finish()
	}
}

/// Native dispatcher state, shared by the [`Dispatcher`] handle and every
/// watch and timeout created on it.
pub(crate) struct DispatcherInner {
	pub(crate) loop_cell: Rc<LoopCell>,
	owns_loop: bool,
	stop_requested: Cell<bool>,
	running: Cell<bool>,
	events: RefCell<Vec<LoopEvent>>,
	pub(crate) token: LifecycleToken,
}

impl Drop for DispatcherInner {
	fn drop(&mut self) {
		debug!(owns_loop = self.owns_loop, "dispatcher.release");
	}
}

impl DispatcherInner {
	/// Borrows the backend for one call and maps its failure to a loop error.
	pub(crate) fn with_backend<R>(&self, f: impl FnOnce(&mut dyn Backend) -> std::io::Result<R>) -> Result<R> {
		let mut backend = self.loop_cell.backend.borrow_mut();
		f(backend.as_mut()).map_err(|err| Error::native(Facility::Loop, &err))
	}

	fn is_idle(&self) -> bool {
		self.loop_cell.backend.borrow().is_idle()
	}

	/// Runs one backend iteration and delivers what it reported.
	fn iterate(&self, block: bool) -> Result<usize> {
		let mut events = self.events.take();
		events.clear();
		self.with_backend(|backend| backend.iterate(block, &mut events))?;
		let delivered = self.deliver(&events);
		self.events.replace(events);
		Ok(delivered)
	}

	/// Delivers one iteration's events.
	///
	/// Watch readiness is latched on every watch before any handler runs, so a
	/// handler that disables or drains another watch suppresses its delivery.
	/// Timers fire after watches, and only if nothing re-armed or disabled them
	/// in between.
	fn deliver(&self, events: &[LoopEvent]) -> usize {
		let mut watches: SmallVec<[Weak<WatchInner>; 8]> = SmallVec::new();
		let mut timers: SmallVec<[(Weak<TimeoutInner>, u64); 4]> = SmallVec::new();

		for event in events {
			match *event {
				LoopEvent::Watch { handle, flags } => match self.token.lookup::<WatchInner>(handle) {
					Some(watch) => {
						if watch.latch(flags) {
							watches.push(Rc::downgrade(&watch));
						}
					}
					None => warn!(%handle, "watch.stale"),
				},
				LoopEvent::Timer { handle } => match self.token.lookup::<TimeoutInner>(handle) {
					Some(timeout) => timers.push((Rc::downgrade(&timeout), timeout.epoch())),
					None => warn!(%handle, "timeout.stale"),
				},
			}
		}

		let mut delivered = 0;
		for watch in watches {
			if let Some(watch) = watch.upgrade()
				&& watch.deliver()
			{
				delivered += 1;
			}
		}
		for (timeout, epoch) in timers {
			if let Some(timeout) = timeout.upgrade()
				&& TimeoutInner::fire(&timeout, epoch)
			{
				delivered += 1;
			}
		}
		delivered
	}
}

struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
	fn drop(&mut self) {
		self.0.set(false);
	}
}

/// Runs a main-loop backend and routes its readiness to watches and timeouts.
///
/// Cloning yields another handle to the same dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
	pub(crate) inner: Rc<DispatcherInner>,
}

impl Dispatcher {
	/// Creates a dispatcher that owns a new [`PollBackend`] loop.
	pub fn new() -> Result<Self> {
		Self::with_backend(PollBackend::new())
	}

	/// Creates a dispatcher that owns a new loop sized from configuration.
	pub fn with_config(config: &DispatcherConfig) -> Result<Self> {
		Self::with_backend(PollBackend::with_capacity(config.max_events))
	}

	/// Creates a dispatcher that owns `backend`.
	pub fn with_backend(backend: impl Backend + 'static) -> Result<Self> {
		let cell = LoopCell::new(Box::new(backend))?;
		Self::build(cell, true)
	}

	/// Creates a dispatcher on a shared loop.
	///
	/// The loop stays alive until this dispatcher and every watch and timeout
	/// created on it are gone, even if `main_loop` is dropped first.
	pub fn with_loop(main_loop: &EventLoop) -> Result<Self> {
		Self::build(Rc::clone(&main_loop.cell), false)
	}

	fn build(loop_cell: Rc<LoopCell>, owns_loop: bool) -> Result<Self> {
		let token = LifecycleToken::acquire()?;
		debug!(backend = loop_cell.backend.borrow().name(), owns_loop, "dispatcher.new");
		Ok(Self {
			inner: Rc::new(DispatcherInner {
				loop_cell,
				owns_loop,
				stop_requested: Cell::new(false),
				running: Cell::new(false),
				events: RefCell::new(Vec::new()),
				token,
			}),
		})
	}

	pub fn owns_loop(&self) -> bool {
		self.inner.owns_loop
	}

	pub fn is_running(&self) -> bool {
		self.inner.running.get()
	}

	pub fn backend_name(&self) -> &'static str {
		self.inner.loop_cell.backend.borrow().name()
	}

	/// Processes events according to `mode` and returns how many handlers ran.
	///
	/// Fails with a loop error when called from inside a handler of the same
	/// dispatcher, or when the backend fails.
	pub fn run(&self, mode: RunMode) -> Result<usize> {
		let inner = &self.inner;
		if inner.running.replace(true) {
			return Err(Error::native_msg(Facility::Loop, "dispatcher is already running"));
		}
		let _running = RunningGuard(&inner.running);
		inner.stop_requested.set(false);
		debug!(%mode, "dispatcher.run");

		let mut delivered = 0;
		match mode {
			RunMode::NoWait => delivered += inner.iterate(false)?,
			RunMode::Once => {
				while !inner.stop_requested.get() && !inner.is_idle() {
					let n = inner.iterate(true)?;
					delivered += n;
					if n > 0 {
						break;
					}
				}
			}
			RunMode::Wait => {
				while !inner.stop_requested.get() && !inner.is_idle() {
					delivered += inner.iterate(true)?;
				}
			}
		}
		debug!(%mode, delivered, stopped = inner.stop_requested.get(), "dispatcher.return");
		Ok(delivered)
	}

	/// Makes a running [`Self::run`] return at its next checkpoint.
	pub fn stop(&self) -> Result<()> {
		self.inner.stop_requested.set(true);
		self.inner.with_backend(|backend| backend.stop())
	}
}

impl fmt::Debug for Dispatcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Dispatcher")
			.field("backend", &self.backend_name())
			.field("owns_loop", &self.inner.owns_loop)
			.field("running", &self.inner.running.get())
			.finish()
	}
}
