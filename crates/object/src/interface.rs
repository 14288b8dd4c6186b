//! Named collections of method, signal and property descriptors.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use busline_core::names::validate_interface_name;
use busline_core::{CallbackContext, Error, LifecycleToken, Result, UserData};
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::connection::Connection;
use crate::descriptor::{Method, MethodSpec, Property, PropertySpec, Signal, SignalSpec};
use crate::message::Message;
use crate::object::HandlerResult;

/// Handler offered method calls addressed to an interface.
pub type InterfaceHandler = dyn Fn(&Interface, &Connection, &Message, Option<&UserData>) -> anyhow::Result<HandlerResult>;

struct InterfaceInner {
	name: String,
	callback: CallbackContext<InterfaceHandler>,
	methods: RefCell<Vec<Method>>,
	signals: RefCell<Vec<Signal>>,
	properties: RefCell<Vec<Property>>,
	_token: LifecycleToken,
}

/// A named API surface that can be attached to service objects.
///
/// Cloning yields another handle to the same interface; identity (see
/// [`Interface::ptr_eq`]) is what [`crate::ServiceObject::remove_interface`]
/// matches on.
#[derive(Clone)]
pub struct Interface {
	inner: Rc<InterfaceInner>,
}

/// Validates a batch and rejects names already taken or repeated in the batch.
fn validate_batch<S, D>(kind: &str, specs: &[S], existing: &[D], convert: impl Fn(&S) -> Result<D>, name: impl Fn(&D) -> &str) -> Result<Vec<D>> {
	let mut taken: FxHashSet<String> = existing.iter().map(|d| name(d).to_owned()).collect();
	let mut out = Vec::with_capacity(specs.len());
	for spec in specs {
		let descriptor = convert(spec)?;
		if !taken.insert(name(&descriptor).to_owned()) {
			return Err(Error::InvalidArgument(format!("duplicate {kind} {:?}", name(&descriptor))));
		}
		out.push(descriptor);
	}
	Ok(out)
}

impl Interface {
	pub fn new(name: &str) -> Result<Self> {
		validate_interface_name(name)?;
		let token = LifecycleToken::acquire()?;
		Ok(Self {
			inner: Rc::new(InterfaceInner {
				name: name.to_owned(),
				callback: CallbackContext::default(),
				methods: RefCell::default(),
				signals: RefCell::default(),
				properties: RefCell::default(),
				_token: token,
			}),
		})
	}

	/// Installs the handler used to claim method calls.
	pub fn with_handler(
		self,
		handler: impl Fn(&Interface, &Connection, &Message, Option<&UserData>) -> anyhow::Result<HandlerResult> + 'static,
	) -> Self {
		self.inner.callback.set_handler(Some(Rc::new(handler)));
		self
	}

	pub fn with_data(self, data: UserData) -> Self {
		self.inner.callback.set_data(Some(data));
		self
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	pub fn handler(&self) -> Option<Rc<InterfaceHandler>> {
		self.inner.callback.handler()
	}

	pub fn set_handler(&self, handler: Option<Rc<InterfaceHandler>>) -> Option<Rc<InterfaceHandler>> {
		self.inner.callback.set_handler(handler)
	}

	pub fn data(&self) -> Option<UserData> {
		self.inner.callback.data()
	}

	pub fn set_data(&self, data: Option<UserData>) -> Option<UserData> {
		self.inner.callback.set_data(data)
	}

	/// Adds methods. Either every spec is valid and registered, or none is.
	pub fn register_methods(&self, specs: &[MethodSpec]) -> Result<()> {
		let mut methods = self.inner.methods.borrow_mut();
		let batch = validate_batch("method", specs, methods.as_slice(), |spec| Method::try_from(spec), |m| m.name.as_str())?;
		debug!(interface = %self.inner.name, count = batch.len(), "interface.register_methods");
		methods.extend(batch);
		Ok(())
	}

	/// Adds signals. Either every spec is valid and registered, or none is.
	pub fn register_signals(&self, specs: &[SignalSpec]) -> Result<()> {
		let mut signals = self.inner.signals.borrow_mut();
		let batch = validate_batch("signal", specs, signals.as_slice(), |spec| Signal::try_from(spec), |s| s.name.as_str())?;
		debug!(interface = %self.inner.name, count = batch.len(), "interface.register_signals");
		signals.extend(batch);
		Ok(())
	}

	/// Adds properties. Either every spec is valid and registered, or none is.
	pub fn register_properties(&self, specs: &[PropertySpec]) -> Result<()> {
		let mut properties = self.inner.properties.borrow_mut();
		let batch = validate_batch("property", specs, properties.as_slice(), |spec| Property::try_from(spec), |p| p.name.as_str())?;
		debug!(interface = %self.inner.name, count = batch.len(), "interface.register_properties");
		properties.extend(batch);
		Ok(())
	}

	pub fn methods(&self) -> Vec<Method> {
		self.inner.methods.borrow().clone()
	}

	pub fn signals(&self) -> Vec<Signal> {
		self.inner.signals.borrow().clone()
	}

	pub fn properties(&self) -> Vec<Property> {
		self.inner.properties.borrow().clone()
	}

	pub fn method(&self, name: &str) -> Option<Method> {
		self.inner.methods.borrow().iter().find(|m| m.name == name).cloned()
	}

	pub fn has_method(&self, name: &str) -> bool {
		self.inner.methods.borrow().iter().any(|m| m.name == name)
	}

	/// Returns `true` if both handles refer to the same interface.
	pub fn ptr_eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.inner, &other.inner)
	}
}

impl fmt::Debug for Interface {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Interface")
			.field("name", &self.inner.name)
			.field("methods", &self.inner.methods.borrow().len())
			.field("signals", &self.inner.signals.borrow().len())
			.field("properties", &self.inner.properties.borrow().len())
			.field("callback", &self.inner.callback)
			.finish()
	}
}
