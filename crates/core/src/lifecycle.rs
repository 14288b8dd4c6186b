//! Module init/shutdown gate.
//!
//! [`init`] starts the protocol engine once and creates a sentinel. Every object
//! that needs the engine holds a [`LifecycleToken`] (a strong reference to the
//! sentinel). [`shutdown`] only drops the module's own reference, so the engine
//! is torn down when the last dependent object is dropped, not before.
//!
//! The gate is bound to the calling thread: busline runs every callback on one
//! thread, and the `Rc`-based handles cannot leave it.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, info};

use crate::registry::{HandleRegistry, NativeHandle};
use crate::{Error, Result};

/// Paths consulted for the local machine id, in order.
const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Three-part version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
	pub major: u32,
	pub minor: u32,
	pub micro: u32,
}

impl Version {
	pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
		Self { major, minor, micro }
	}

	/// Version of this crate.
	pub fn module() -> Self {
		let part = |s: &str| s.parse().unwrap_or(0);
		Self {
			major: part(env!("CARGO_PKG_VERSION_MAJOR")),
			minor: part(env!("CARGO_PKG_VERSION_MINOR")),
			micro: part(env!("CARGO_PKG_VERSION_PATCH")),
		}
	}
}

impl fmt::Display for Version {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
	}
}

/// Versions reported by [`version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
	/// Version of the protocol engine in use.
	pub library: Version,
	/// Version of the binding module.
	pub module: Version,
}

/// Hooks into the protocol engine wrapped by the module.
pub trait Engine {
	/// Starts the engine. Called once per module lifetime.
	fn init(&self) -> Result<()>;

	/// Stops the engine. Called once, after the last dependent object is gone.
	fn shutdown(&self);

	fn version(&self) -> Version;

	/// Local machine identifier, `None` when unavailable.
	fn machine_id(&self) -> Option<String>;
}

/// Engine backed by the host system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEngine;

impl Engine for SystemEngine {
	fn init(&self) -> Result<()> {
		Ok(())
	}

	fn shutdown(&self) {}

	fn version(&self) -> Version {
		Version::module()
	}

	fn machine_id(&self) -> Option<String> {
		MACHINE_ID_PATHS
			.iter()
			.filter_map(|path| std::fs::read_to_string(path).ok())
			.map(|raw| raw.trim().to_owned())
			.find(|id| is_machine_id(id))
	}
}

/// A machine id is 32 lowercase hex digits.
fn is_machine_id(id: &str) -> bool {
	id.len() == 32 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

struct Sentinel {
	engine: Box<dyn Engine>,
	registry: RefCell<HandleRegistry>,
	epoch: u64,
}

impl Drop for Sentinel {
	fn drop(&mut self) {
		let leaked = self.registry.get_mut().len();
		debug!(epoch = self.epoch, leaked, "module.teardown");
		self.engine.shutdown();
	}
}

#[derive(Default)]
struct ModuleState {
	owned: Option<Rc<Sentinel>>,
	lingering: Weak<Sentinel>,
}

thread_local! {
	static MODULE: RefCell<ModuleState> = RefCell::new(ModuleState::default());
	static EPOCH: Cell<u64> = const { Cell::new(0) };
}

/// Initializes the module with the [`SystemEngine`].
pub fn init() -> Result<()> {
	init_with(SystemEngine)
}

/// Initializes the module with a custom engine.
///
/// A no-op when the module is already initialized. After [`shutdown`], while
/// dependent objects still keep the engine alive, the existing sentinel is
/// adopted again and `engine` is discarded.
pub fn init_with(engine: impl Engine + 'static) -> Result<()> {
	MODULE.with(|module| {
		let mut module = module.borrow_mut();
		if module.owned.is_some() {
			return Ok(());
		}
		if let Some(sentinel) = module.lingering.upgrade() {
			debug!(epoch = sentinel.epoch, "module.readopt");
			module.owned = Some(sentinel);
			return Ok(());
		}

		engine.init()?;
		let epoch = EPOCH.with(|e| {
			let next = e.get() + 1;
			e.set(next);
			next
		});
		let sentinel = Rc::new(Sentinel {
			engine: Box::new(engine),
			registry: RefCell::new(HandleRegistry::new()),
			epoch,
		});
		info!(epoch, version = %sentinel.engine.version(), "module.init");
		module.lingering = Rc::downgrade(&sentinel);
		module.owned = Some(sentinel);
		Ok(())
	})
}

/// Drops the module's reference to the engine.
///
/// Returns `true` if the engine was torn down immediately, `false` if dependent
/// objects still hold it (or the module was not initialized).
pub fn shutdown() -> bool {
	let owned = MODULE.with(|module| module.borrow_mut().owned.take());
	let Some(sentinel) = owned else {
		return false;
	};
	let last = Rc::strong_count(&sentinel) == 1;
	debug!(dependents = Rc::strong_count(&sentinel) - 1, "module.shutdown");
	drop(sentinel);
	last
}

/// Returns `true` between [`init`] and [`shutdown`].
pub fn is_initialized() -> bool {
	MODULE.with(|module| module.borrow().owned.is_some())
}

/// Returns `true` while the engine is running, including after [`shutdown`]
/// while dependent objects are still alive.
pub fn engine_alive() -> bool {
	MODULE.with(|module| module.borrow().lingering.strong_count() > 0)
}

/// Linked engine and module versions.
pub fn version() -> Result<VersionInfo> {
	Ok(LifecycleToken::acquire()?.version())
}

/// Local machine id, or an empty string when the engine cannot provide one.
pub fn machine_id() -> Result<String> {
	Ok(LifecycleToken::acquire()?.machine_id())
}

/// Strong reference that keeps the protocol engine alive.
#[derive(Clone)]
pub struct LifecycleToken {
	sentinel: Rc<Sentinel>,
}

impl LifecycleToken {
	/// Takes a reference to the running engine.
	///
	/// Fails with [`Error::NotInitialized`] before [`init`] and after [`shutdown`].
	pub fn acquire() -> Result<Self> {
		MODULE.with(|module| {
			module
				.borrow()
				.owned
				.as_ref()
				.map(|sentinel| Self {
					sentinel: Rc::clone(sentinel),
				})
				.ok_or(Error::NotInitialized)
		})
	}

	/// Runs `f` with the module's handle registry.
	///
	/// The registry is borrowed for the duration of `f`; `f` must not call back
	/// into code that touches the registry.
	pub fn with_registry<R>(&self, f: impl FnOnce(&mut HandleRegistry) -> R) -> R {
		f(&mut self.sentinel.registry.borrow_mut())
	}

	/// Resolves a native handle to its live wrapper.
	pub fn lookup<T: 'static>(&self, handle: NativeHandle) -> Option<Rc<T>> {
		self.sentinel.registry.borrow().get::<T>(handle)
	}

	/// Number of registry entries currently allocated.
	pub fn live_handles(&self) -> usize {
		self.sentinel.registry.borrow().len()
	}

	pub fn version(&self) -> VersionInfo {
		VersionInfo {
			library: self.sentinel.engine.version(),
			module: Version::module(),
		}
	}

	pub fn machine_id(&self) -> String {
		self.sentinel.engine.machine_id().unwrap_or_default()
	}

	/// Identifies the module lifetime this token belongs to.
	pub fn epoch(&self) -> u64 {
		self.sentinel.epoch
	}
}

impl fmt::Debug for LifecycleToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LifecycleToken").field("epoch", &self.sentinel.epoch).finish()
	}
}
