//! Message headers with an opaque body.
//!
//! Bodies are carried as bytes plus their type signature and are never
//! interpreted here, except that an error reply with signature `s` exposes its
//! body as text.

use std::fmt;

use busline_core::names::{validate_bus_name, validate_error_name, validate_interface_name, validate_member_name, validate_path, validate_signature, validate_utf8};
use busline_core::{Error, Result};

/// Well-known error names used for synthesized replies.
pub mod error_names {
	pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
	pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
	pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
	pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
	pub const DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
	pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
	MethodCall,
	MethodReturn,
	Error,
	Signal,
}

impl MessageType {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::MethodCall => "method_call",
			Self::MethodReturn => "method_return",
			Self::Error => "error",
			Self::Signal => "signal",
		}
	}
}

impl fmt::Display for MessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	kind: MessageType,
	serial: u32,
	reply_serial: Option<u32>,
	path: Option<String>,
	interface: Option<String>,
	member: Option<String>,
	error_name: Option<String>,
	sender: Option<String>,
	destination: Option<String>,
	no_reply_expected: bool,
	signature: String,
	body: Vec<u8>,
}

impl Message {
	fn empty(kind: MessageType) -> Self {
		Self {
			kind,
			serial: 0,
			reply_serial: None,
			path: None,
			interface: None,
			member: None,
			error_name: None,
			sender: None,
			destination: None,
			no_reply_expected: false,
			signature: String::new(),
			body: Vec::new(),
		}
	}

	/// Builds a method call. `interface` may be omitted; the receiver then
	/// picks any interface declaring `member`.
	pub fn method_call(destination: Option<&str>, path: &str, interface: Option<&str>, member: &str) -> Result<Self> {
		let destination = destination.map(validate_bus_name).transpose()?;
		let interface = interface.map(validate_interface_name).transpose()?;
		Ok(Self {
			destination: destination.map(str::to_owned),
			path: Some(validate_path(path)?.to_owned()),
			interface: interface.map(str::to_owned),
			member: Some(validate_member_name(member)?.to_owned()),
			..Self::empty(MessageType::MethodCall)
		})
	}

	pub fn signal(path: &str, interface: &str, member: &str) -> Result<Self> {
		Ok(Self {
			path: Some(validate_path(path)?.to_owned()),
			interface: Some(validate_interface_name(interface)?.to_owned()),
			member: Some(validate_member_name(member)?.to_owned()),
			..Self::empty(MessageType::Signal)
		})
	}

	/// Builds the successful reply to `call`.
	pub fn method_return(call: &Message) -> Self {
		Self {
			reply_serial: Some(call.serial),
			destination: call.sender.clone(),
			..Self::empty(MessageType::MethodReturn)
		}
	}

	/// Builds an error reply to `call` carrying `text` as its message.
	pub fn error(call: &Message, name: &str, text: &str) -> Result<Self> {
		validate_error_name(name)?;
		Ok(Self::error_to(call, name, text))
	}

	/// Builds an error reply addressed by serial only, for replies synthesized
	/// locally when the original call is no longer at hand.
	pub fn error_reply(reply_serial: u32, name: &str, text: &str) -> Result<Self> {
		validate_error_name(name)?;
		Ok(Self::error_unchecked(reply_serial, name, text))
	}

	/// Error reply to `call` with a name known to be valid.
	pub(crate) fn error_to(call: &Message, name: &str, text: &str) -> Self {
		Self {
			destination: call.sender.clone(),
			..Self::error_unchecked(call.serial, name, text)
		}
	}

	pub(crate) fn error_unchecked(reply_serial: u32, name: &str, text: &str) -> Self {
		Self {
			reply_serial: Some(reply_serial),
			error_name: Some(name.to_owned()),
			signature: "s".into(),
			body: text.as_bytes().to_vec(),
			..Self::empty(MessageType::Error)
		}
	}

	/// Attaches a marshaled body.
	pub fn with_body(mut self, signature: &str, body: Vec<u8>) -> Result<Self> {
		self.signature = validate_signature(signature)?.to_owned();
		self.body = body;
		Ok(self)
	}

	pub fn with_sender(mut self, sender: &str) -> Result<Self> {
		self.sender = Some(validate_bus_name(sender)?.to_owned());
		Ok(self)
	}

	pub fn with_no_reply(mut self, no_reply: bool) -> Self {
		self.no_reply_expected = no_reply;
		self
	}

	/// Sets the serial. Connections assign one on send when none is set.
	pub fn with_serial(mut self, serial: u32) -> Self {
		self.serial = serial;
		self
	}

	pub(crate) fn set_serial(&mut self, serial: u32) {
		self.serial = serial;
	}

	pub fn kind(&self) -> MessageType {
		self.kind
	}

	/// Serial number, `0` until the message is sent.
	pub fn serial(&self) -> u32 {
		self.serial
	}

	pub fn reply_serial(&self) -> Option<u32> {
		self.reply_serial
	}

	pub fn path(&self) -> Option<&str> {
		self.path.as_deref()
	}

	pub fn interface(&self) -> Option<&str> {
		self.interface.as_deref()
	}

	pub fn member(&self) -> Option<&str> {
		self.member.as_deref()
	}

	pub fn error_name(&self) -> Option<&str> {
		self.error_name.as_deref()
	}

	pub fn sender(&self) -> Option<&str> {
		self.sender.as_deref()
	}

	pub fn destination(&self) -> Option<&str> {
		self.destination.as_deref()
	}

	pub fn no_reply_expected(&self) -> bool {
		self.no_reply_expected
	}

	pub fn signature(&self) -> &str {
		&self.signature
	}

	pub fn body(&self) -> &[u8] {
		&self.body
	}

	/// Text of an error reply whose body is a single string.
	pub fn error_text(&self) -> Option<&str> {
		if self.kind != MessageType::Error || self.signature != "s" {
			return None;
		}
		validate_utf8(&self.body).ok()
	}

	/// Fails with [`Error::InvalidArgument`] unless this is a method call.
	pub(crate) fn expect_call(&self) -> Result<()> {
		if self.kind != MessageType::MethodCall {
			return Err(Error::InvalidArgument(format!("expected a method call, got {}", self.kind)));
		}
		Ok(())
	}
}

impl fmt::Display for Message {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} #{}", self.kind, self.serial)?;
		if let Some(path) = &self.path {
			write!(f, " {path}")?;
		}
		match (&self.interface, &self.member) {
			(Some(iface), Some(member)) => write!(f, " {iface}.{member}")?,
			(None, Some(member)) => write!(f, " {member}")?,
			_ => {}
		}
		if let Some(name) = &self.error_name {
			write!(f, " {name}")?;
		}
		if let Some(serial) = self.reply_serial {
			write!(f, " reply_to=#{serial}")?;
		}
		Ok(())
	}
}
