//! Outstanding method calls awaiting a reply.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use busline_core::callback::guard;
use busline_core::{CallbackContext, Error, LifecycleToken, Result, UserData};
use busline_mainloop::{Dispatcher, Timeout};
use tracing::{debug, trace};

use crate::connection::ConnectionInner;
use crate::message::{Message, error_names};

/// Handler invoked exactly once with the reply, or with a synthesized error
/// when the call times out or the connection closes.
pub type PendingHandler = dyn Fn(&PendingCall, &Message, Option<&UserData>) -> anyhow::Result<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
	Waiting,
	Completed,
	Cancelled,
}

pub(crate) struct PendingInner {
	serial: u32,
	state: Cell<CallState>,
	reply: RefCell<Option<Message>>,
	callback: CallbackContext<PendingHandler>,
	connection: Weak<ConnectionInner>,
	timer: RefCell<Option<Timeout>>,
	_token: LifecycleToken,
}

impl PendingInner {
	pub(crate) fn new(serial: u32, connection: Weak<ConnectionInner>, handler: Rc<PendingHandler>, data: Option<UserData>) -> Result<Rc<Self>> {
		let token = LifecycleToken::acquire()?;
		Ok(Rc::new(Self {
			serial,
			state: Cell::new(CallState::Waiting),
			reply: RefCell::new(None),
			callback: CallbackContext::new(Some(handler), data),
			connection,
			timer: RefCell::new(None),
			_token: token,
		}))
	}

	pub(crate) fn serial(&self) -> u32 {
		self.serial
	}

	/// Arms a one-shot timer that completes the call with a `NoReply` error.
	pub(crate) fn arm_timeout(self: &Rc<Self>, dispatcher: &Dispatcher, after: Duration) -> Result<()> {
		let weak = Rc::downgrade(self);
		let serial = self.serial;
		let timer = Timeout::new(
			dispatcher,
			after.clamp(Timeout::MIN_INTERVAL, Timeout::MAX_INTERVAL),
			false,
			move |_, _| {
				if let Some(call) = weak.upgrade() {
					debug!(serial, "pending.timed_out");
					let reply = Message::error_unchecked(serial, error_names::NO_REPLY, "Did not receive a reply");
					PendingInner::complete(&call, reply);
				}
				Ok(())
			},
			None,
		)?;
		timer.set_enabled(true)?;
		*self.timer.borrow_mut() = Some(timer);
		Ok(())
	}

	/// Delivers `reply` unless the call already finished. Returns whether the
	/// handler slot was consumed.
	pub(crate) fn complete(this: &Rc<Self>, reply: Message) -> bool {
		if this.state.get() != CallState::Waiting {
			trace!(serial = this.serial, "pending.late_reply");
			return false;
		}
		this.state.set(CallState::Completed);
		this.detach();
		*this.reply.borrow_mut() = Some(reply.clone());

		if let Some(handler) = this.callback.handler() {
			let data = this.callback.data();
			let call = PendingCall { inner: Rc::clone(this) };
			guard("pending_call", &this.serial, || handler(&call, &reply, data.as_ref()));
		}
		this.callback.clear();
		true
	}

	/// Marks the call cancelled without invoking its handler.
	pub(crate) fn abandon(&self) {
		if self.state.get() == CallState::Waiting {
			self.state.set(CallState::Cancelled);
			self.detach();
			self.callback.clear();
		}
	}

	/// Drops the connection's entry and the reply timer.
	fn detach(&self) {
		if let Some(connection) = self.connection.upgrade() {
			let entry = connection.pending.borrow_mut().remove(&self.serial);
			drop(entry);
		}
		let timer = self.timer.borrow_mut().take();
		if let Some(timer) = timer
			&& let Err(err) = timer.set_enabled(false)
		{
			debug!(serial = self.serial, error = %err, "pending.disarm_failed");
		}
	}
}

/// A method call awaiting its reply.
///
/// The connection keeps the call alive until it completes, so dropping every
/// `PendingCall` handle does not cancel it.
#[derive(Clone)]
pub struct PendingCall {
	pub(crate) inner: Rc<PendingInner>,
}

impl PendingCall {
	/// Serial of the method call this is waiting on.
	pub fn serial(&self) -> u32 {
		self.inner.serial
	}

	pub fn state(&self) -> CallState {
		self.inner.state.get()
	}

	/// `true` once a reply arrived, the call timed out, or it was cancelled.
	pub fn is_completed(&self) -> bool {
		self.inner.state.get() != CallState::Waiting
	}

	/// The reply, or the synthesized error that stood in for it.
	pub fn reply(&self) -> Option<Message> {
		self.inner.reply.borrow().clone()
	}

	/// Stops waiting. The handler is never invoked afterwards.
	pub fn cancel(&self) -> Result<()> {
		if self.is_completed() {
			return Err(Error::CallCompleted);
		}
		debug!(serial = self.inner.serial, "pending.cancel");
		self.inner.abandon();
		Ok(())
	}

	pub fn set_handler(&self, handler: Option<Rc<PendingHandler>>) -> Result<Option<Rc<PendingHandler>>> {
		if self.is_completed() {
			return Err(Error::CallCompleted);
		}
		Ok(self.inner.callback.set_handler(handler))
	}

	pub fn data(&self) -> Option<UserData> {
		self.inner.callback.data()
	}

	pub fn set_data(&self, data: Option<UserData>) -> Result<Option<UserData>> {
		if self.is_completed() {
			return Err(Error::CallCompleted);
		}
		Ok(self.inner.callback.set_data(data))
	}

	pub fn ptr_eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.inner, &other.inner)
	}
}

impl fmt::Debug for PendingCall {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PendingCall")
			.field("serial", &self.inner.serial)
			.field("state", &self.inner.state.get())
			.field("timer", &self.inner.timer.borrow().is_some())
			.finish()
	}
}
