//! Handler/user-data pairs and the boundary that runs user handlers.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use tracing::{error, warn};

/// Arbitrary user value delivered to handlers alongside each event.
pub type UserData = Rc<dyn Any>;

/// Owned `(handler, user data)` pair attached to a wrapper.
///
/// Both slots are held strongly until replaced, cleared, or the owner drops.
/// The handler is stored behind an `Rc` so dispatch can clone it out before
/// calling it; a running handler may then replace itself.
pub struct CallbackContext<H: ?Sized> {
	handler: RefCell<Option<Rc<H>>>,
	data: RefCell<Option<UserData>>,
}

impl<H: ?Sized> Default for CallbackContext<H> {
	fn default() -> Self {
		Self {
			handler: RefCell::new(None),
			data: RefCell::new(None),
		}
	}
}

impl<H: ?Sized> CallbackContext<H> {
	pub fn new(handler: Option<Rc<H>>, data: Option<UserData>) -> Self {
		Self {
			handler: RefCell::new(handler),
			data: RefCell::new(data),
		}
	}

	pub fn handler(&self) -> Option<Rc<H>> {
		self.handler.borrow().clone()
	}

	pub fn has_handler(&self) -> bool {
		self.handler.borrow().is_some()
	}

	/// Replaces the handler, returning the previous one.
	pub fn set_handler(&self, handler: Option<Rc<H>>) -> Option<Rc<H>> {
		self.handler.replace(handler)
	}

	pub fn data(&self) -> Option<UserData> {
		self.data.borrow().clone()
	}

	/// Replaces the user data, returning the previous value.
	pub fn set_data(&self, data: Option<UserData>) -> Option<UserData> {
		self.data.replace(data)
	}

	/// Releases both slots.
	pub fn clear(&self) {
		let handler = self.handler.take();
		let data = self.data.take();
		drop((handler, data));
	}
}

impl<H: ?Sized> fmt::Debug for CallbackContext<H> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CallbackContext")
			.field("handler", &self.handler.borrow().is_some())
			.field("data", &self.data.borrow().is_some())
			.finish()
	}
}

/// Runs one user handler at a dispatch boundary.
///
/// Errors and panics raised by `f` are logged against `site` and `subject` and
/// turned into `None`; they never reach the caller.
pub fn guard<R>(site: &'static str, subject: &dyn fmt::Display, f: impl FnOnce() -> anyhow::Result<R>) -> Option<R> {
	match catch_unwind(AssertUnwindSafe(f)) {
		Ok(Ok(value)) => Some(value),
		Ok(Err(err)) => {
			warn!(site, subject = %subject, error = format!("{err:#}"), "handler.failed");
			None
		}
		Err(payload) => {
			error!(site, subject = %subject, panic = panic_message(payload.as_ref()), "handler.panicked");
			None
		}
	}
}

/// Extracts the message of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		(*s).to_owned()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"<non-string panic payload>".to_owned()
	}
}
