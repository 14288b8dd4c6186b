bitflags::bitflags! {
	/// Readiness conditions of a watched descriptor.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct WatchFlags: u32 {
		/// Data can be read without blocking.
		const READABLE = 1 << 0;
		/// Data can be written without blocking.
		const WRITABLE = 1 << 1;
		/// The descriptor is in an error state. Always reported.
		const ERROR = 1 << 2;
		/// The peer hung up. Always reported.
		const HANGUP = 1 << 3;
	}
}

const NAMES: [(WatchFlags, &str); 4] = [
	(WatchFlags::READABLE, "readable"),
	(WatchFlags::WRITABLE, "writable"),
	(WatchFlags::ERROR, "error"),
	(WatchFlags::HANGUP, "hangup"),
];

impl WatchFlags {
	/// Conditions reported whether or not they were requested.
	pub const ALWAYS: Self = Self::ERROR.union(Self::HANGUP);

	/// Lowercase names of the set flags, for host-side event tables.
	pub fn names(self) -> impl Iterator<Item = &'static str> {
		NAMES.into_iter().filter(move |(flag, _)| self.contains(*flag)).map(|(_, name)| name)
	}

	/// Builds a set from lowercase names. Returns `None` on an unknown name.
	pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<Self> {
		names.into_iter().try_fold(Self::empty(), |acc, name| {
			NAMES.iter().find(|(_, n)| *n == name).map(|(flag, _)| acc | *flag)
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn names_follow_bit_order() {
		let flags = WatchFlags::HANGUP | WatchFlags::READABLE;
		assert_eq!(flags.names().collect::<Vec<_>>(), ["readable", "hangup"]);
		assert_eq!(WatchFlags::empty().names().count(), 0);
	}

	#[test]
	fn from_names_rejects_unknown() {
		assert_eq!(
			WatchFlags::from_names(["writable", "error"]),
			Some(WatchFlags::WRITABLE | WatchFlags::ERROR)
		);
		assert_eq!(WatchFlags::from_names(["readable", "urgent"]), None);
		assert_eq!(WatchFlags::from_names(std::iter::empty()), Some(WatchFlags::empty()));
	}
}
