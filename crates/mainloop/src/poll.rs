//! Reference backend built on `poll(2)` with a deadline-ordered timer queue.

use std::collections::BTreeMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use busline_core::NativeHandle;
use rustc_hash::FxHashMap;
use rustix::event::{PollFd, PollFlags, Timespec};
use rustix::io::Errno;
use slab::Slab;
use tracing::trace;

use crate::backend::{Backend, LoopEvent};
use crate::WatchFlags;

struct WatchEntry {
	handle: NativeHandle,
	fd: RawFd,
	interest: WatchFlags,
}

/// Single-threaded reactor backend.
///
/// Watches are polled level-triggered. Timers are one-shot deadlines; the
/// dispatcher re-arms repeating timeouts itself.
pub struct PollBackend {
	watches: Slab<WatchEntry>,
	by_handle: FxHashMap<NativeHandle, usize>,
	timers: BTreeMap<(Instant, u64), NativeHandle>,
	deadlines: FxHashMap<NativeHandle, (Instant, u64)>,
	next_seq: u64,
	order: Vec<usize>,
}

impl Default for PollBackend {
	fn default() -> Self {
		Self::new()
	}
}

impl PollBackend {
	pub fn new() -> Self {
		Self::with_capacity(16)
	}

	/// Preallocates room for `capacity` watches.
	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			watches: Slab::with_capacity(capacity),
			by_handle: FxHashMap::default(),
			timers: BTreeMap::new(),
			deadlines: FxHashMap::default(),
			next_seq: 0,
			order: Vec::with_capacity(capacity),
		}
	}

	fn next_deadline(&self) -> Option<Instant> {
		self.timers.keys().next().map(|(at, _)| *at)
	}

	fn collect_expired(&mut self, now: Instant, events: &mut Vec<LoopEvent>) {
		while let Some(entry) = self.timers.first_entry() {
			if entry.key().0 > now {
				break;
			}
			let handle = entry.remove();
			self.deadlines.remove(&handle);
			events.push(LoopEvent::Timer { handle });
		}
	}
}

fn interest_to_poll(interest: WatchFlags) -> PollFlags {
	let mut flags = PollFlags::empty();
	if interest.contains(WatchFlags::READABLE) {
		flags |= PollFlags::IN;
	}
	if interest.contains(WatchFlags::WRITABLE) {
		flags |= PollFlags::OUT;
	}
	flags
}

fn poll_to_flags(revents: PollFlags, interest: WatchFlags) -> WatchFlags {
	let mut flags = WatchFlags::empty();
	if revents.intersects(PollFlags::IN | PollFlags::PRI) {
		flags |= WatchFlags::READABLE;
	}
	if revents.contains(PollFlags::OUT) {
		flags |= WatchFlags::WRITABLE;
	}
	if revents.intersects(PollFlags::ERR | PollFlags::NVAL) {
		flags |= WatchFlags::ERROR;
	}
	if revents.contains(PollFlags::HUP) {
		flags |= WatchFlags::HANGUP;
	}
	flags & (interest | WatchFlags::ALWAYS)
}

fn to_timespec(wait: Duration) -> Timespec {
	Timespec {
		tv_sec: wait.as_secs() as _,
		tv_nsec: wait.subsec_nanos() as _,
	}
}

impl Backend for PollBackend {
	fn name(&self) -> &'static str {
		"poll"
	}

	fn add_watch(&mut self, handle: NativeHandle, fd: RawFd, interest: WatchFlags) -> io::Result<()> {
		if self.by_handle.contains_key(&handle) {
			return Err(io::Error::new(io::ErrorKind::AlreadyExists, format!("watch {handle} already registered")));
		}
		let key = self.watches.insert(WatchEntry { handle, fd, interest });
		self.by_handle.insert(handle, key);
		Ok(())
	}

	fn modify_watch(&mut self, handle: NativeHandle, interest: WatchFlags) -> io::Result<()> {
		let key = self
			.by_handle
			.get(&handle)
			.copied()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("watch {handle} not registered")))?;
		self.watches[key].interest = interest;
		Ok(())
	}

	fn remove_watch(&mut self, handle: NativeHandle) -> io::Result<()> {
		if let Some(key) = self.by_handle.remove(&handle) {
			self.watches.remove(key);
		}
		Ok(())
	}

	fn arm_timer(&mut self, handle: NativeHandle, after: Duration) -> io::Result<()> {
		let deadline = Instant::now()
			.checked_add(after)
			.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("timer interval {after:?} overflows the clock")))?;
		self.disarm_timer(handle)?;
		let key = (deadline, self.next_seq);
		self.next_seq += 1;
		self.timers.insert(key, handle);
		self.deadlines.insert(handle, key);
		Ok(())
	}

	fn disarm_timer(&mut self, handle: NativeHandle) -> io::Result<()> {
		if let Some(key) = self.deadlines.remove(&handle) {
			self.timers.remove(&key);
		}
		Ok(())
	}

	fn iterate(&mut self, block: bool, events: &mut Vec<LoopEvent>) -> io::Result<()> {
		if self.is_idle() {
			return Ok(());
		}

		let wait = if block {
			self.next_deadline().map(|at| at.saturating_duration_since(Instant::now()))
		} else {
			Some(Duration::ZERO)
		};

		self.order.clear();
		let mut fds = Vec::with_capacity(self.watches.len());
		for (key, entry) in &self.watches {
			// SAFETY: the descriptor stays registered (and owned by the watch's
			// caller) until `remove_watch`, which cannot run during this call.
			let fd = unsafe { BorrowedFd::borrow_raw(entry.fd) };
			fds.push(PollFd::from_borrowed_fd(fd, interest_to_poll(entry.interest)));
			self.order.push(key);
		}

		let timeout = wait.map(to_timespec);
		let ready = match rustix::event::poll(&mut fds, timeout.as_ref()) {
			Ok(n) => n,
			Err(Errno::INTR) => 0,
			Err(err) => return Err(err.into()),
		};
		trace!(ready, watches = fds.len(), timers = self.timers.len(), "poll.iterate");

		if ready > 0 {
			for (pollfd, key) in fds.iter().zip(&self.order) {
				let revents = pollfd.revents();
				if revents.is_empty() {
					continue;
				}
				let entry = &self.watches[*key];
				let flags = poll_to_flags(revents, entry.interest);
				if !flags.is_empty() {
					events.push(LoopEvent::Watch {
						handle: entry.handle,
						flags,
					});
				}
			}
		}
		drop(fds);

		self.collect_expired(Instant::now(), events);
		Ok(())
	}

	fn is_idle(&self) -> bool {
		self.watches.is_empty() && self.timers.is_empty()
	}

	fn teardown(&mut self) {
		self.watches.clear();
		self.by_handle.clear();
		self.timers.clear();
		self.deadlines.clear();
	}
}
