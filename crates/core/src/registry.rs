//! Weak index from native handles to their owning wrappers.
//!
//! Native collaborators (backends, the protocol engine) only ever see an opaque
//! [`NativeHandle`]. When they call back, the handle is resolved here. The index
//! never owns a wrapper: once the wrapper is gone the lookup misses, and the
//! caller is expected to drop the event.

use std::any::Any;
use std::fmt;
use std::rc::{Rc, Weak};

use slab::Slab;

/// Opaque token handed to native collaborators in place of a pointer.
///
/// The generation makes handles unique for the lifetime of a registry even
/// though arena slots are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle {
	index: u32,
	generation: u32,
}

impl NativeHandle {
	pub const fn index(self) -> u32 {
		self.index
	}

	pub const fn generation(self) -> u32 {
		self.generation
	}

	/// Packs the handle into one integer for collaborators that only carry a `u64` token.
	pub const fn into_raw(self) -> u64 {
		((self.generation as u64) << 32) | self.index as u64
	}

	pub const fn from_raw(raw: u64) -> Self {
		Self {
			index: raw as u32,
			generation: (raw >> 32) as u32,
		}
	}
}

impl fmt::Display for NativeHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}v{}", self.index, self.generation)
	}
}

struct Slot {
	generation: u32,
	target: Weak<dyn Any>,
}

/// Arena of weak wrapper associations keyed by [`NativeHandle`].
pub struct HandleRegistry {
	slots: Slab<Slot>,
	next_generation: u32,
}

impl Default for HandleRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl HandleRegistry {
	pub fn new() -> Self {
		Self {
			slots: Slab::new(),
			next_generation: 1,
		}
	}

	/// Allocates a handle with no wrapper bound yet.
	///
	/// Lookups miss until [`Self::bind`] installs the wrapper, which lets a
	/// wrapper embed its own handle before it is shared.
	pub fn reserve(&mut self) -> NativeHandle {
		let generation = self.next_generation;
		self.next_generation = self.next_generation.wrapping_add(1).max(1);
		let empty: Weak<dyn Any> = Weak::<()>::new();
		let index = self.slots.insert(Slot { generation, target: empty });
		NativeHandle {
			index: index as u32,
			generation,
		}
	}

	/// Installs the weak association for a reserved handle.
	///
	/// Returns `false` if the handle was already removed.
	pub fn bind<T: Any>(&mut self, handle: NativeHandle, wrapper: &Rc<T>) -> bool {
		match self.slot_mut(handle) {
			Some(slot) => {
				let weak: Weak<dyn Any> = Rc::downgrade(wrapper) as Weak<dyn Any>;
				slot.target = weak;
				true
			}
			None => false,
		}
	}

	/// Reserves a handle and binds `wrapper` to it in one step.
	pub fn insert<T: Any>(&mut self, wrapper: &Rc<T>) -> NativeHandle {
		let handle = self.reserve();
		self.bind(handle, wrapper);
		handle
	}

	/// Resolves a handle to its live wrapper.
	///
	/// Misses when the handle is unknown, was removed, belongs to another
	/// wrapper type, or the wrapper has started dropping.
	pub fn get<T: Any>(&self, handle: NativeHandle) -> Option<Rc<T>> {
		let slot = self.slots.get(handle.index as usize)?;
		if slot.generation != handle.generation {
			return None;
		}
		slot.target.upgrade()?.downcast::<T>().ok()
	}

	/// Drops the association. Idempotent.
	pub fn remove(&mut self, handle: NativeHandle) -> bool {
		if self.slot_mut(handle).is_none() {
			return false;
		}
		self.slots.remove(handle.index as usize);
		true
	}

	pub fn contains(&self, handle: NativeHandle) -> bool {
		self.slots
			.get(handle.index as usize)
			.is_some_and(|slot| slot.generation == handle.generation)
	}

	/// Number of handles currently allocated, bound or not.
	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	fn slot_mut(&mut self, handle: NativeHandle) -> Option<&mut Slot> {
		self.slots
			.get_mut(handle.index as usize)
			.filter(|slot| slot.generation == handle.generation)
	}
}

impl fmt::Debug for HandleRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("HandleRegistry")
			.field("len", &self.slots.len())
			.field("next_generation", &self.next_generation)
			.finish()
	}
}
