//! Method, signal and property descriptors.
//!
//! `*Spec` types are the loosely typed form handed over by the host (direction
//! and access as strings). Registration validates them into the strict
//! [`Method`], [`Signal`] and [`Property`] forms.

use std::fmt;
use std::str::FromStr;

use busline_core::names::{validate_member_name, validate_single_type};
use busline_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
	#[default]
	In,
	Out,
}

impl Direction {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::In => "in",
			Self::Out => "out",
		}
	}
}

impl FromStr for Direction {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"in" => Ok(Self::In),
			"out" => Ok(Self::Out),
			other => Err(Error::InvalidArgument(format!("argument direction must be \"in\" or \"out\", got {other:?}"))),
		}
	}
}

impl fmt::Display for Direction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Property access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
	Read,
	Write,
	ReadWrite,
}

impl Access {
	pub const fn readable(self) -> bool {
		matches!(self, Self::Read | Self::ReadWrite)
	}

	pub const fn writable(self) -> bool {
		matches!(self, Self::Write | Self::ReadWrite)
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Read => "r",
			Self::Write => "w",
			Self::ReadWrite => "rw",
		}
	}
}

impl FromStr for Access {
	type Err = Error;

	/// Accepts exactly `r`, `w`, `rw` and `wr`.
	fn from_str(s: &str) -> Result<Self> {
		match s {
			"r" => Ok(Self::Read),
			"w" => Ok(Self::Write),
			"rw" | "wr" => Ok(Self::ReadWrite),
			other => Err(Error::InvalidArgument(format!("property access must be r, w, rw or wr, got {other:?}"))),
		}
	}
}

/// Argument as supplied by the host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArgSpec {
	pub name: Option<String>,
	pub signature: String,
	/// `"in"` or `"out"`; methods default to `"in"`, signals ignore it.
	pub direction: Option<String>,
}

impl ArgSpec {
	pub fn new(signature: impl Into<String>) -> Self {
		Self {
			signature: signature.into(),
			..Self::default()
		}
	}

	pub fn named(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	pub fn direction(mut self, direction: impl Into<String>) -> Self {
		self.direction = Some(direction.into());
		self
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSpec {
	pub name: String,
	pub args: Vec<ArgSpec>,
}

impl MethodSpec {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			args: Vec::new(),
		}
	}

	pub fn arg(mut self, arg: ArgSpec) -> Self {
		self.args.push(arg);
		self
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSpec {
	pub name: String,
	pub args: Vec<ArgSpec>,
}

impl SignalSpec {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			args: Vec::new(),
		}
	}

	pub fn arg(mut self, arg: ArgSpec) -> Self {
		self.args.push(arg);
		self
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySpec {
	pub name: String,
	pub signature: String,
	pub access: String,
}

impl PropertySpec {
	pub fn new(name: impl Into<String>, signature: impl Into<String>, access: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			signature: signature.into(),
			access: access.into(),
		}
	}
}

/// Validated argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
	pub name: Option<String>,
	pub signature: String,
	pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
	pub name: String,
	pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
	pub name: String,
	pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
	pub name: String,
	pub signature: String,
	pub access: Access,
}

fn validate_arg(spec: &ArgSpec, direction: Direction) -> Result<Arg> {
	validate_single_type(&spec.signature)?;
	Ok(Arg {
		name: spec.name.clone(),
		signature: spec.signature.clone(),
		direction,
	})
}

impl TryFrom<&MethodSpec> for Method {
	type Error = Error;

	fn try_from(spec: &MethodSpec) -> Result<Self> {
		validate_member_name(&spec.name)?;
		let args = spec
			.args
			.iter()
			.map(|arg| {
				let direction = arg.direction.as_deref().map(str::parse).transpose()?.unwrap_or_default();
				validate_arg(arg, direction)
			})
			.collect::<Result<_>>()?;
		Ok(Self {
			name: spec.name.clone(),
			args,
		})
	}
}

impl TryFrom<&SignalSpec> for Signal {
	type Error = Error;

	fn try_from(spec: &SignalSpec) -> Result<Self> {
		validate_member_name(&spec.name)?;
		let args = spec.args.iter().map(|arg| validate_arg(arg, Direction::Out)).collect::<Result<_>>()?;
		Ok(Self {
			name: spec.name.clone(),
			args,
		})
	}
}

impl TryFrom<&PropertySpec> for Property {
	type Error = Error;

	fn try_from(spec: &PropertySpec) -> Result<Self> {
		validate_member_name(&spec.name)?;
		validate_single_type(&spec.signature)?;
		Ok(Self {
			name: spec.name.clone(),
			signature: spec.signature.clone(),
			access: spec.access.parse()?,
		})
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	#[test]
	fn method_directions_default_to_in() {
		let spec = MethodSpec::new("Seek")
			.arg(ArgSpec::new("x").named("offset"))
			.arg(ArgSpec::new("b").named("ok").direction("out"));
		let method = Method::try_from(&spec).unwrap();
		assert_eq!(method.args[0].direction, Direction::In);
		assert_eq!(method.args[1].direction, Direction::Out);
		assert_eq!(method.args[0].name.as_deref(), Some("offset"));
	}

	#[test]
	fn method_rejects_unknown_direction() {
		let spec = MethodSpec::new("Seek").arg(ArgSpec::new("x").direction("inout"));
		assert!(matches!(Method::try_from(&spec), Err(Error::InvalidArgument(_))));
	}

	#[test]
	fn signal_args_are_always_out() {
		let spec = SignalSpec::new("Seeked")
			.arg(ArgSpec::new("x").direction("in"))
			.arg(ArgSpec::new("s").direction("sideways"));
		let signal = Signal::try_from(&spec).unwrap();
		assert!(signal.args.iter().all(|arg| arg.direction == Direction::Out));
	}

	#[rstest]
	#[case("r", Some(Access::Read))]
	#[case("w", Some(Access::Write))]
	#[case("rw", Some(Access::ReadWrite))]
	#[case("wr", Some(Access::ReadWrite))]
	#[case("R", None)]
	#[case("", None)]
	#[case("read", None)]
	#[case("rww", None)]
	fn access_tokens(#[case] token: &str, #[case] expected: Option<Access>) {
		assert_eq!(token.parse::<Access>().ok(), expected);
	}

	#[rstest]
	#[case("")]
	#[case("ii")]
	#[case("a{sv")]
	fn args_need_one_complete_type(#[case] signature: &str) {
		let spec = MethodSpec::new("Set").arg(ArgSpec::new(signature));
		assert!(matches!(Method::try_from(&spec), Err(Error::InvalidSignature { .. })));
	}

	#[test]
	fn property_validates_name_signature_and_access() {
		let ok = Property::try_from(&PropertySpec::new("Volume", "d", "rw")).unwrap();
		assert!(ok.access.readable() && ok.access.writable());
		assert!(Property::try_from(&PropertySpec::new("Volume", "dd", "r")).is_err());
		assert!(Property::try_from(&PropertySpec::new("2Volume", "d", "r")).is_err());
		assert!(Property::try_from(&PropertySpec::new("Volume", "d", "x")).is_err());
	}
}
