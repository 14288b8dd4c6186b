//! Service objects and the two-tier request router.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use busline_core::callback::guard;
use busline_core::names::validate_path;
use busline_core::{CallbackContext, Error, LifecycleToken, Result, UserData};
use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::connection::Connection;
use crate::interface::Interface;
use crate::message::Message;

/// Outcome reported by a request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum HandlerResult {
	/// The request was answered; routing stops.
	Handled = 0,
	/// The handler declined; routing continues.
	NotYetHandled = 1,
	/// The handler ran out of memory; routing stops without an error reply.
	NeedMemory = 2,
}

impl HandlerResult {
	pub const fn code(self) -> i32 {
		self as i32
	}

	/// Maps a host-side result code. Unknown codes count as
	/// [`HandlerResult::NotYetHandled`] and are logged.
	pub fn from_code(code: i64) -> Self {
		match code {
			0 => Self::Handled,
			1 => Self::NotYetHandled,
			2 => Self::NeedMemory,
			other => {
				warn!(code = other, "handler.bad_result");
				Self::NotYetHandled
			}
		}
	}
}

/// Fallback handler of a service object.
pub type ObjectHandler = dyn Fn(&ServiceObject, &Connection, &Message, Option<&UserData>) -> anyhow::Result<HandlerResult>;

struct ObjectInner {
	path: String,
	callback: CallbackContext<ObjectHandler>,
	interfaces: RefCell<Vec<Interface>>,
	_token: LifecycleToken,
}

/// An addressable endpoint exposing zero or more interfaces.
#[derive(Clone)]
pub struct ServiceObject {
	inner: Rc<ObjectInner>,
}

impl ServiceObject {
	pub fn new(path: &str) -> Result<Self> {
		validate_path(path)?;
		let token = LifecycleToken::acquire()?;
		Ok(Self {
			inner: Rc::new(ObjectInner {
				path: path.to_owned(),
				callback: CallbackContext::default(),
				interfaces: RefCell::default(),
				_token: token,
			}),
		})
	}

	/// Installs the handler tried after every interface handler declined.
	pub fn with_handler(
		self,
		handler: impl Fn(&ServiceObject, &Connection, &Message, Option<&UserData>) -> anyhow::Result<HandlerResult> + 'static,
	) -> Self {
		self.inner.callback.set_handler(Some(Rc::new(handler)));
		self
	}

	pub fn with_data(self, data: UserData) -> Self {
		self.inner.callback.set_data(Some(data));
		self
	}

	pub fn path(&self) -> &str {
		&self.inner.path
	}

	pub fn set_handler(&self, handler: Option<Rc<ObjectHandler>>) -> Option<Rc<ObjectHandler>> {
		self.inner.callback.set_handler(handler)
	}

	pub fn data(&self) -> Option<UserData> {
		self.inner.callback.data()
	}

	pub fn set_data(&self, data: Option<UserData>) -> Option<UserData> {
		self.inner.callback.set_data(data)
	}

	/// Attaches `interface`, keeping it alive while attached.
	///
	/// Fails with [`Error::DuplicateInterface`] if an interface with the same
	/// name is attached; the object is left unchanged.
	pub fn add_interface(&self, interface: &Interface) -> Result<()> {
		let mut interfaces = self.inner.interfaces.borrow_mut();
		if interfaces.iter().any(|i| i.name() == interface.name()) {
			return Err(Error::DuplicateInterface(interface.name().to_owned()));
		}
		interfaces.push(interface.clone());
		trace!(path = %self.inner.path, interface = interface.name(), "object.add_interface");
		Ok(())
	}

	/// Detaches `interface`, matched by identity.
	///
	/// Returns `false` if it is not attached. Fails with
	/// [`Error::InterfaceMismatch`] when another instance with the same name is
	/// attached; that instance stays attached.
	pub fn remove_interface(&self, interface: &Interface) -> Result<bool> {
		let mut interfaces = self.inner.interfaces.borrow_mut();
		if let Some(pos) = interfaces.iter().position(|i| i.ptr_eq(interface)) {
			let removed = interfaces.remove(pos);
			drop(interfaces);
			trace!(path = %self.inner.path, interface = removed.name(), "object.remove_interface");
			return Ok(true);
		}
		if interfaces.iter().any(|i| i.name() == interface.name()) {
			warn!(
				path = %self.inner.path,
				interface = interface.name(),
				"object.remove_interface_mismatch"
			);
			return Err(Error::InterfaceMismatch(interface.name().to_owned()));
		}
		Ok(false)
	}

	/// Attached interfaces in attachment order.
	pub fn interfaces(&self) -> Vec<Interface> {
		self.inner.interfaces.borrow().clone()
	}

	pub fn interface(&self, name: &str) -> Option<Interface> {
		self.inner.interfaces.borrow().iter().find(|i| i.name() == name).cloned()
	}

	/// Offers `message` to the interface handlers, then to the object's own handler.
	///
	/// A message naming an interface goes only to that interface. Otherwise
	/// every attached interface declaring the member is tried in attachment
	/// order. The first [`HandlerResult::Handled`] or
	/// [`HandlerResult::NeedMemory`] stops the search. A handler that fails or
	/// panics counts as [`HandlerResult::NotYetHandled`].
	pub fn route(&self, connection: &Connection, message: &Message) -> HandlerResult {
		let candidates: SmallVec<[Interface; 4]> = {
			let interfaces = self.inner.interfaces.borrow();
			match (message.interface(), message.member()) {
				(Some(name), _) => interfaces.iter().filter(|i| i.name() == name).cloned().collect(),
				(None, Some(member)) => interfaces.iter().filter(|i| i.has_method(member)).cloned().collect(),
				(None, None) => SmallVec::new(),
			}
		};

		for interface in &candidates {
			let Some(handler) = interface.handler() else {
				continue;
			};
			let data = interface.data();
			let subject = format!("{} {}", self.inner.path, interface.name());
			let result = guard("interface", &subject, || handler(interface, connection, message, data.as_ref()))
				.unwrap_or(HandlerResult::NotYetHandled);
			trace!(%subject, ?result, "object.route_interface");
			if result != HandlerResult::NotYetHandled {
				return result;
			}
		}

		if let Some(handler) = self.inner.callback.handler() {
			let data = self.inner.callback.data();
			let result = guard("object", &self.inner.path, || handler(self, connection, message, data.as_ref()))
				.unwrap_or(HandlerResult::NotYetHandled);
			trace!(path = %self.inner.path, ?result, "object.route_fallback");
			return result;
		}
		HandlerResult::NotYetHandled
	}

	/// Returns `true` if both handles refer to the same object.
	pub fn ptr_eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.inner, &other.inner)
	}
}

impl fmt::Debug for ServiceObject {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let names: Vec<String> = self.inner.interfaces.borrow().iter().map(|i| i.name().to_owned()).collect();
		f.debug_struct("ServiceObject")
			.field("path", &self.inner.path)
			.field("interfaces", &names)
			.field("callback", &self.inner.callback)
			.finish()
	}
}
