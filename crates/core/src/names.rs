//! D-Bus name, path and type signature validation.
//!
//! Every validator returns the input on success so call sites can chain them
//! into constructors.

use crate::{Error, NameKind, Result};

/// Longest name or signature the protocol accepts.
pub const MAX_NAME_LEN: usize = 255;
/// Deepest array or struct nesting a signature may use, counted separately.
pub const MAX_DEPTH: usize = 32;

fn invalid(kind: NameKind, value: &str, reason: &'static str) -> Error {
	Error::InvalidName {
		kind,
		value: value.to_owned(),
		reason,
	}
}

fn is_element_char(b: u8) -> bool {
	b.is_ascii_alphanumeric() || b == b'_'
}

/// Checks a `/`-separated object path such as `/org/example/Player`.
pub fn validate_path(path: &str) -> Result<&str> {
	let kind = NameKind::ObjectPath;
	let Some(rest) = path.strip_prefix('/') else {
		return Err(invalid(kind, path, "must start with '/'"));
	};
	if rest.is_empty() {
		return Ok(path);
	}
	for element in rest.split('/') {
		if element.is_empty() {
			return Err(invalid(kind, path, "empty element or trailing '/'"));
		}
		if !element.bytes().all(is_element_char) {
			return Err(invalid(kind, path, "elements may only contain [A-Za-z0-9_]"));
		}
	}
	Ok(path)
}

/// Shared rules for interface and error names: two or more dot-separated
/// elements of `[A-Za-z0-9_]`, none starting with a digit.
fn validate_dotted(kind: NameKind, name: &str) -> Result<()> {
	if name.is_empty() {
		return Err(invalid(kind, name, "empty"));
	}
	if name.len() > MAX_NAME_LEN {
		return Err(invalid(kind, name, "longer than 255 bytes"));
	}
	let mut elements = 0;
	for element in name.split('.') {
		elements += 1;
		let Some(first) = element.bytes().next() else {
			return Err(invalid(kind, name, "empty element"));
		};
		if first.is_ascii_digit() {
			return Err(invalid(kind, name, "element starts with a digit"));
		}
		if !element.bytes().all(is_element_char) {
			return Err(invalid(kind, name, "elements may only contain [A-Za-z0-9_]"));
		}
	}
	if elements < 2 {
		return Err(invalid(kind, name, "needs at least two elements"));
	}
	Ok(())
}

pub fn validate_interface_name(name: &str) -> Result<&str> {
	validate_dotted(NameKind::InterfaceName, name)?;
	Ok(name)
}

pub fn validate_error_name(name: &str) -> Result<&str> {
	validate_dotted(NameKind::ErrorName, name)?;
	Ok(name)
}

/// Checks a method, signal or property name.
pub fn validate_member_name(name: &str) -> Result<&str> {
	let kind = NameKind::MemberName;
	let Some(first) = name.bytes().next() else {
		return Err(invalid(kind, name, "empty"));
	};
	if name.len() > MAX_NAME_LEN {
		return Err(invalid(kind, name, "longer than 255 bytes"));
	}
	if first.is_ascii_digit() {
		return Err(invalid(kind, name, "starts with a digit"));
	}
	if !name.bytes().all(is_element_char) {
		return Err(invalid(kind, name, "may only contain [A-Za-z0-9_]"));
	}
	Ok(name)
}

/// Checks a unique (`:1.42`) or well-known (`org.example.App`) bus name.
pub fn validate_bus_name(name: &str) -> Result<&str> {
	let kind = NameKind::BusName;
	if name.is_empty() {
		return Err(invalid(kind, name, "empty"));
	}
	if name.len() > MAX_NAME_LEN {
		return Err(invalid(kind, name, "longer than 255 bytes"));
	}
	let (unique, body) = match name.strip_prefix(':') {
		Some(body) => (true, body),
		None => (false, name),
	};
	let mut elements = 0;
	for element in body.split('.') {
		elements += 1;
		let Some(first) = element.bytes().next() else {
			return Err(invalid(kind, name, "empty element"));
		};
		if !unique && first.is_ascii_digit() {
			return Err(invalid(kind, name, "element starts with a digit"));
		}
		if !element.bytes().all(|b| is_element_char(b) || b == b'-') {
			return Err(invalid(kind, name, "elements may only contain [A-Za-z0-9_-]"));
		}
	}
	if elements < 2 {
		return Err(invalid(kind, name, "needs at least two elements"));
	}
	Ok(name)
}

/// Checks that `bytes` is UTF-8 without embedded NUL, as D-Bus strings must be.
pub fn validate_utf8(bytes: &[u8]) -> Result<&str> {
	let text = std::str::from_utf8(bytes).map_err(|err| Error::InvalidArgument(format!("string is not valid UTF-8: {err}")))?;
	if text.contains('\0') {
		return Err(Error::InvalidArgument("string contains a NUL byte".into()));
	}
	Ok(text)
}

/// Checks a type signature made of zero or more complete types.
pub fn validate_signature(signature: &str) -> Result<&str> {
	let mut parser = SignatureParser::new(signature)?;
	while !parser.at_end() {
		parser.complete_type()?;
	}
	Ok(signature)
}

/// Checks a type signature that holds exactly one complete type.
pub fn validate_single_type(signature: &str) -> Result<&str> {
	let mut parser = SignatureParser::new(signature)?;
	if parser.at_end() {
		return Err(parser.fail("empty, expected one complete type"));
	}
	parser.complete_type()?;
	if !parser.at_end() {
		return Err(parser.fail("expected exactly one complete type"));
	}
	Ok(signature)
}

fn is_basic(code: u8) -> bool {
	matches!(code, b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b'h' | b's' | b'o' | b'g')
}

struct SignatureParser<'a> {
	signature: &'a str,
	bytes: &'a [u8],
	pos: usize,
	arrays: usize,
	structs: usize,
}

impl<'a> SignatureParser<'a> {
	fn new(signature: &'a str) -> Result<Self> {
		let parser = Self {
			signature,
			bytes: signature.as_bytes(),
			pos: 0,
			arrays: 0,
			structs: 0,
		};
		if signature.len() > MAX_NAME_LEN {
			return Err(parser.fail("longer than 255 bytes"));
		}
		Ok(parser)
	}

	fn fail(&self, reason: &'static str) -> Error {
		Error::InvalidSignature {
			signature: self.signature.to_owned(),
			reason,
		}
	}

	fn at_end(&self) -> bool {
		self.pos >= self.bytes.len()
	}

	fn next(&mut self) -> Result<u8> {
		let code = *self.bytes.get(self.pos).ok_or_else(|| self.fail("ends in the middle of a type"))?;
		self.pos += 1;
		Ok(code)
	}

	fn complete_type(&mut self) -> Result<()> {
		let code = self.next()?;
		match code {
			c if is_basic(c) => Ok(()),
			b'v' => Ok(()),
			b'a' => {
				self.arrays += 1;
				if self.arrays > MAX_DEPTH {
					return Err(self.fail("arrays nested deeper than 32"));
				}
				let result = if self.bytes.get(self.pos) == Some(&b'{') {
					self.pos += 1;
					self.dict_entry()
				} else {
					self.complete_type()
				};
				self.arrays -= 1;
				result
			}
			b'(' => {
				self.structs += 1;
				if self.structs > MAX_DEPTH {
					return Err(self.fail("structs nested deeper than 32"));
				}
				if self.bytes.get(self.pos) == Some(&b')') {
					return Err(self.fail("empty struct"));
				}
				loop {
					match self.bytes.get(self.pos) {
						Some(b')') => {
							self.pos += 1;
							break;
						}
						Some(_) => self.complete_type()?,
						None => return Err(self.fail("unterminated struct")),
					}
				}
				self.structs -= 1;
				Ok(())
			}
			b'{' => Err(self.fail("dict entry outside an array")),
			b')' | b'}' => Err(self.fail("unbalanced closing bracket")),
			_ => Err(self.fail("unknown type code")),
		}
	}

	/// Parses the body of `a{..}` after the opening brace.
	fn dict_entry(&mut self) -> Result<()> {
		self.structs += 1;
		if self.structs > MAX_DEPTH {
			return Err(self.fail("structs nested deeper than 32"));
		}
		let key = self.next()?;
		if !is_basic(key) {
			return Err(self.fail("dict key must be a basic type"));
		}
		if self.bytes.get(self.pos) == Some(&b'}') {
			return Err(self.fail("dict entry needs a value type"));
		}
		self.complete_type()?;
		if self.next()? != b'}' {
			return Err(self.fail("dict entry holds more than one value type"));
		}
		self.structs -= 1;
		Ok(())
	}
}
