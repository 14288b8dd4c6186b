//! Connections: message transport, object table and reply tracking.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use busline_core::config::Config;
use busline_core::{Error, Facility, LifecycleToken, Result, UserData};
use busline_mainloop::{Dispatcher, Watch, WatchFlags};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::message::{Message, MessageType, error_names};
use crate::object::{HandlerResult, ServiceObject};
use crate::pending::{PendingCall, PendingInner};

/// Moves whole messages to and from a peer.
///
/// `receive` must not block: it returns `Ok(None)` once nothing more is
/// queued.
pub trait Transport {
	fn send(&mut self, message: &Message) -> io::Result<()>;

	fn receive(&mut self) -> io::Result<Option<Message>>;

	/// Descriptor that turns readable when `receive` has work. Transports
	/// without one can only be pumped through [`Connection::read_incoming`].
	fn raw_fd(&self) -> Option<RawFd> {
		None
	}

	fn close(&mut self) {}
}

pub(crate) struct ConnectionInner {
	transport: RefCell<Box<dyn Transport>>,
	open: Cell<bool>,
	next_serial: Cell<u32>,
	objects: RefCell<BTreeMap<String, ServiceObject>>,
	pub(crate) pending: RefCell<FxHashMap<u32, Rc<PendingInner>>>,
	default_timeout: Cell<Option<Duration>>,
	dispatcher: RefCell<Option<Dispatcher>>,
	watch: RefCell<Option<Watch>>,
	_token: LifecycleToken,
}

impl ConnectionInner {
	fn next_serial(&self) -> u32 {
		let serial = self.next_serial.get();
		self.next_serial.set(serial.checked_add(1).unwrap_or(1));
		serial
	}

	fn shutdown(&self) {
		if !self.open.replace(false) {
			return;
		}
		self.transport.borrow_mut().close();
		let watch = self.watch.borrow_mut().take();
		drop(watch);
		let dispatcher = self.dispatcher.borrow_mut().take();
		drop(dispatcher);

		let mut pending: Vec<Rc<PendingInner>> = self.pending.borrow_mut().drain().map(|(_, call)| call).collect();
		pending.sort_by_key(|call| call.serial());
		debug!(pending = pending.len(), "connection.close");
		for call in pending {
			let reply = Message::error_unchecked(call.serial(), error_names::DISCONNECTED, "Connection is closed");
			PendingInner::complete(&call, reply);
		}
	}
}

impl Drop for ConnectionInner {
	fn drop(&mut self) {
		self.shutdown();
	}
}

/// A message connection to one peer.
///
/// Cloning yields another handle to the same connection. The connection is
/// closed when the last handle drops.
#[derive(Clone)]
pub struct Connection {
	inner: Rc<ConnectionInner>,
}

impl Connection {
	pub fn new(transport: impl Transport + 'static) -> Result<Self> {
		Self::with_config(transport, &Config::default())
	}

	/// Creates a connection whose default reply timeout comes from `config`.
	pub fn with_config(transport: impl Transport + 'static, config: &Config) -> Result<Self> {
		let token = LifecycleToken::acquire()?;
		Ok(Self {
			inner: Rc::new(ConnectionInner {
				transport: RefCell::new(Box::new(transport)),
				open: Cell::new(true),
				next_serial: Cell::new(1),
				objects: RefCell::default(),
				pending: RefCell::default(),
				default_timeout: Cell::new(Some(config.call_timeout())),
				dispatcher: RefCell::new(None),
				watch: RefCell::new(None),
				_token: token,
			}),
		})
	}

	pub fn is_open(&self) -> bool {
		self.inner.open.get()
	}

	/// Reply timeout applied by [`Connection::call`]. `None` waits forever.
	pub fn default_timeout(&self) -> Option<Duration> {
		self.inner.default_timeout.get()
	}

	pub fn set_default_timeout(&self, timeout: Option<Duration>) {
		self.inner.default_timeout.set(timeout);
	}

	/// Sends `message`, assigning a serial if it has none. Returns the serial.
	pub fn send(&self, mut message: Message) -> Result<u32> {
		if !self.is_open() {
			return Err(Error::Disconnected);
		}
		if message.serial() == 0 {
			message.set_serial(self.inner.next_serial());
		}
		self.inner
			.transport
			.borrow_mut()
			.send(&message)
			.map_err(|err| Error::native(Facility::Protocol, &err))?;
		trace!(%message, "connection.send");
		Ok(message.serial())
	}

	/// Sends a method call and tracks its reply with the default timeout.
	pub fn call(
		&self,
		message: Message,
		handler: impl Fn(&PendingCall, &Message, Option<&UserData>) -> anyhow::Result<()> + 'static,
		data: Option<UserData>,
	) -> Result<PendingCall> {
		self.call_with_timeout(message, self.default_timeout(), handler, data)
	}

	/// Sends a method call and tracks its reply.
	///
	/// The timeout only runs while the connection is attached to a dispatcher.
	/// When it expires the handler receives a `NoReply` error instead.
	pub fn call_with_timeout(
		&self,
		mut message: Message,
		timeout: Option<Duration>,
		handler: impl Fn(&PendingCall, &Message, Option<&UserData>) -> anyhow::Result<()> + 'static,
		data: Option<UserData>,
	) -> Result<PendingCall> {
		message.expect_call()?;
		if message.no_reply_expected() {
			return Err(Error::InvalidArgument("call is flagged as expecting no reply".into()));
		}
		if !self.is_open() {
			return Err(Error::Disconnected);
		}
		let serial = self.inner.next_serial();
		message.set_serial(serial);

		let call = PendingInner::new(serial, Rc::downgrade(&self.inner), Rc::new(handler), data)?;
		let dispatcher = self.inner.dispatcher.borrow().clone();
		if let (Some(after), Some(dispatcher)) = (timeout, dispatcher) {
			call.arm_timeout(&dispatcher, after)?;
		}
		self.inner.pending.borrow_mut().insert(serial, Rc::clone(&call));

		if let Err(err) = self.send(message) {
			call.abandon();
			return Err(err);
		}
		debug!(serial, ?timeout, "connection.call");
		Ok(PendingCall { inner: call })
	}

	/// Calls still waiting for a reply, oldest first.
	pub fn pending_calls(&self) -> Vec<PendingCall> {
		let mut calls: Vec<PendingCall> = self
			.inner
			.pending
			.borrow()
			.values()
			.map(|inner| PendingCall { inner: Rc::clone(inner) })
			.collect();
		calls.sort_by_key(PendingCall::serial);
		calls
	}

	/// Exposes `object` at its path.
	pub fn register_object(&self, object: &ServiceObject) -> Result<()> {
		match self.inner.objects.borrow_mut().entry(object.path().to_owned()) {
			Entry::Occupied(_) => Err(Error::DuplicateObject(object.path().to_owned())),
			Entry::Vacant(slot) => {
				slot.insert(object.clone());
				debug!(path = object.path(), "connection.register_object");
				Ok(())
			}
		}
	}

	pub fn unregister_object(&self, path: &str) -> Option<ServiceObject> {
		let removed = self.inner.objects.borrow_mut().remove(path);
		if removed.is_some() {
			debug!(path, "connection.unregister_object");
		}
		removed
	}

	pub fn object(&self, path: &str) -> Option<ServiceObject> {
		self.inner.objects.borrow().get(path).cloned()
	}

	/// Registered object paths in sorted order.
	pub fn object_paths(&self) -> Vec<String> {
		self.inner.objects.borrow().keys().cloned().collect()
	}

	/// Lets `dispatcher` drive incoming traffic and reply timeouts.
	///
	/// Needs a transport with a pollable descriptor. A hang-up or error on it
	/// closes the connection.
	pub fn attach(&self, dispatcher: &Dispatcher) -> Result<()> {
		if !self.is_open() {
			return Err(Error::Disconnected);
		}
		if self.inner.watch.borrow().is_some() {
			return Err(Error::InvalidArgument("connection is already attached".into()));
		}
		let fd = self
			.inner
			.transport
			.borrow()
			.raw_fd()
			.ok_or_else(|| Error::InvalidArgument("transport has no pollable descriptor".into()))?;

		let weak = Rc::downgrade(&self.inner);
		let watch = Watch::new(
			dispatcher,
			fd,
			WatchFlags::READABLE,
			move |_, flags, _| {
				let Some(inner) = weak.upgrade() else {
					return Ok(());
				};
				let connection = Connection { inner };
				if flags.contains(WatchFlags::READABLE) {
					connection.read_incoming()?;
				}
				if flags.intersects(WatchFlags::ALWAYS) {
					debug!(flags = ?flags, "connection.hangup");
					connection.close();
				}
				Ok(())
			},
			None,
		)?;
		*self.inner.watch.borrow_mut() = Some(watch);
		*self.inner.dispatcher.borrow_mut() = Some(dispatcher.clone());
		debug!(fd, backend = dispatcher.backend_name(), "connection.attach");
		Ok(())
	}

	/// Dispatcher driving this connection, until it is closed.
	pub fn dispatcher(&self) -> Option<Dispatcher> {
		self.inner.dispatcher.borrow().clone()
	}

	/// Drains the transport, dispatching every queued message. Returns how
	/// many were dispatched.
	pub fn read_incoming(&self) -> Result<usize> {
		let mut count = 0;
		while self.is_open() {
			let next = self.inner.transport.borrow_mut().receive();
			match next.map_err(|err| Error::native(Facility::Protocol, &err))? {
				Some(message) => {
					self.dispatch_message(message);
					count += 1;
				}
				None => break,
			}
		}
		Ok(count)
	}

	/// Routes one incoming message.
	///
	/// Replies complete the matching pending call. Method calls and signals
	/// go to the object at their path; a method call nobody claims is answered
	/// with an `UnknownObject`, `UnknownInterface` or `UnknownMethod` error
	/// unless the caller asked for no reply.
	pub fn dispatch_message(&self, message: Message) -> HandlerResult {
		trace!(%message, "connection.dispatch");
		match message.kind() {
			MessageType::MethodReturn | MessageType::Error => {
				let call = message.reply_serial().and_then(|serial| self.inner.pending.borrow_mut().remove(&serial));
				match call {
					Some(call) => {
						PendingInner::complete(&call, message);
						HandlerResult::Handled
					}
					None => {
						debug!(%message, "connection.unmatched_reply");
						HandlerResult::NotYetHandled
					}
				}
			}
			MessageType::MethodCall | MessageType::Signal => self.route(&message),
		}
	}

	fn route(&self, message: &Message) -> HandlerResult {
		let path = message.path().unwrap_or_default();
		let is_call = message.kind() == MessageType::MethodCall;
		let Some(object) = self.object(path) else {
			if is_call {
				self.reply_error(message, error_names::UNKNOWN_OBJECT, &format!("No such object path '{path}'"));
			}
			return HandlerResult::NotYetHandled;
		};

		let result = object.route(self, message);
		if result == HandlerResult::NotYetHandled && is_call {
			let member = message.member().unwrap_or_default();
			match message.interface() {
				Some(iface) if object.interface(iface).is_none() => {
					self.reply_error(message, error_names::UNKNOWN_INTERFACE, &format!("No such interface '{iface}' at object path '{path}'"));
				}
				Some(iface) => {
					self.reply_error(message, error_names::UNKNOWN_METHOD, &format!("No such method '{member}' in interface '{iface}'"));
				}
				None => {
					self.reply_error(message, error_names::UNKNOWN_METHOD, &format!("No such method '{member}' at object path '{path}'"));
				}
			}
		}
		result
	}

	fn reply_error(&self, call: &Message, name: &str, text: &str) {
		if call.no_reply_expected() {
			return;
		}
		if let Err(err) = self.send(Message::error_to(call, name, text)) {
			warn!(%call, error = %err, "connection.reply_failed");
		}
	}

	/// Closes the transport. Every pending call completes with a
	/// `Disconnected` error. Closing twice is a no-op.
	pub fn close(&self) {
		self.inner.shutdown();
	}

	pub fn ptr_eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.inner, &other.inner)
	}
}

impl fmt::Debug for Connection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Connection")
			.field("open", &self.inner.open.get())
			.field("objects", &self.inner.objects.borrow().len())
			.field("pending", &self.inner.pending.borrow().len())
			.field("attached", &self.inner.watch.borrow().is_some())
			.finish()
	}
}
