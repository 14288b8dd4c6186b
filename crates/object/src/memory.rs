//! In-process transport pair.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use crate::connection::Transport;
use crate::message::Message;

type Queue = Rc<RefCell<VecDeque<Message>>>;

/// One end of a connected in-process transport.
///
/// Messages travel through shared queues. A socket pair alongside them makes
/// the receiving end pollable, so a [`crate::Connection`] on it can be
/// attached to a dispatcher. Closing either end hangs up the other.
pub struct MemoryTransport {
	inbox: Queue,
	outbox: Queue,
	bell: UnixStream,
	closed: Rc<Cell<bool>>,
}

impl MemoryTransport {
	pub fn pair() -> io::Result<(Self, Self)> {
		let (left, right) = UnixStream::pair()?;
		left.set_nonblocking(true)?;
		right.set_nonblocking(true)?;
		let forward = Queue::default();
		let backward = Queue::default();
		let closed = Rc::new(Cell::new(false));
		Ok((
			Self {
				inbox: Rc::clone(&backward),
				outbox: Rc::clone(&forward),
				bell: left,
				closed: Rc::clone(&closed),
			},
			Self {
				inbox: forward,
				outbox: backward,
				bell: right,
				closed,
			},
		))
	}

	/// Messages received but not yet taken.
	pub fn queued(&self) -> usize {
		self.inbox.borrow().len()
	}

	fn drain_bell(&mut self) -> io::Result<()> {
		let mut buf = [0u8; 64];
		loop {
			match self.bell.read(&mut buf) {
				Ok(0) => return Ok(()),
				Ok(_) => {}
				Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
				Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
				Err(err) => return Err(err),
			}
		}
	}
}

impl Transport for MemoryTransport {
	fn send(&mut self, message: &Message) -> io::Result<()> {
		if self.closed.get() {
			return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport is closed"));
		}
		self.outbox.borrow_mut().push_back(message.clone());
		match self.bell.write(&[1]) {
			Ok(_) => Ok(()),
			// The peer already has unread wake-ups.
			Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
			Err(err) => Err(err),
		}
	}

	fn receive(&mut self) -> io::Result<Option<Message>> {
		self.drain_bell()?;
		Ok(self.inbox.borrow_mut().pop_front())
	}

	fn raw_fd(&self) -> Option<RawFd> {
		Some(self.bell.as_raw_fd())
	}

	fn close(&mut self) {
		self.closed.set(true);
		let _ = self.bell.shutdown(Shutdown::Both);
	}
}
