//! Dispatcher behaviour against a backend whose readiness is scripted by the test.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use busline_core::{Error, Facility, LifecycleToken, NativeHandle, lifecycle};
use busline_mainloop::{Backend, Dispatcher, EventLoop, LoopEvent, RunMode, Timeout, Watch, WatchFlags};

#[derive(Default)]
struct Script {
	calls: Vec<String>,
	batches: VecDeque<Vec<LoopEvent>>,
	fail_iterate: Option<i32>,
	fail_stop: bool,
	fail_arm: bool,
	teardowns: u32,
	watches: HashSet<NativeHandle>,
	timers: HashSet<NativeHandle>,
}

struct ScriptedBackend(Rc<RefCell<Script>>);

fn names(flags: WatchFlags) -> String {
	flags.names().collect::<Vec<_>>().join("|")
}

impl Backend for ScriptedBackend {
	fn name(&self) -> &'static str {
		"scripted"
	}

	fn add_watch(&mut self, handle: NativeHandle, _fd: RawFd, interest: WatchFlags) -> io::Result<()> {
		let mut s = self.0.borrow_mut();
		s.calls.push(format!("add_watch {}", names(interest)));
		s.watches.insert(handle);
		Ok(())
	}

	fn modify_watch(&mut self, _handle: NativeHandle, interest: WatchFlags) -> io::Result<()> {
		self.0.borrow_mut().calls.push(format!("modify_watch {}", names(interest)));
		Ok(())
	}

	fn remove_watch(&mut self, handle: NativeHandle) -> io::Result<()> {
		let mut s = self.0.borrow_mut();
		s.calls.push("remove_watch".into());
		s.watches.remove(&handle);
		Ok(())
	}

	fn arm_timer(&mut self, handle: NativeHandle, after: Duration) -> io::Result<()> {
		let mut s = self.0.borrow_mut();
		if s.fail_arm {
			return Err(io::Error::from_raw_os_error(12));
		}
		s.calls.push(format!("arm_timer {}ms", after.as_millis()));
		s.timers.insert(handle);
		Ok(())
	}

	fn disarm_timer(&mut self, handle: NativeHandle) -> io::Result<()> {
		let mut s = self.0.borrow_mut();
		s.calls.push("disarm_timer".into());
		s.timers.remove(&handle);
		Ok(())
	}

	fn iterate(&mut self, _block: bool, events: &mut Vec<LoopEvent>) -> io::Result<()> {
		let mut s = self.0.borrow_mut();
		if let Some(code) = s.fail_iterate {
			return Err(io::Error::from_raw_os_error(code));
		}
		if let Some(batch) = s.batches.pop_front() {
			for event in &batch {
				if let LoopEvent::Timer { handle } = event {
					s.timers.remove(handle);
				}
			}
			events.extend(batch);
		}
		Ok(())
	}

	fn stop(&mut self) -> io::Result<()> {
		if self.0.borrow().fail_stop {
			return Err(io::Error::from_raw_os_error(5));
		}
		Ok(())
	}

	fn is_idle(&self) -> bool {
		let s = self.0.borrow();
		s.watches.is_empty() && s.timers.is_empty()
	}

	fn teardown(&mut self) {
		self.0.borrow_mut().teardowns += 1;
	}
}

fn scripted() -> (ScriptedBackend, Rc<RefCell<Script>>) {
	let script = Rc::new(RefCell::new(Script::default()));
	(ScriptedBackend(Rc::clone(&script)), script)
}

fn counting_watch(dispatcher: &Dispatcher, fd: RawFd, calls: &Rc<Cell<u32>>) -> Watch {
	let calls = Rc::clone(calls);
	Watch::new(
		dispatcher,
		fd,
		WatchFlags::READABLE,
		move |_, _, _| {
			calls.set(calls.get() + 1);
			Ok(())
		},
		None,
	)
	.unwrap()
}

#[test]
fn foreign_loop_outlives_its_wrapper() {
	lifecycle::init().unwrap();
	let (backend, script) = scripted();
	let main_loop = EventLoop::with_backend(backend).unwrap();
	let dispatcher = Dispatcher::with_loop(&main_loop).unwrap();
	assert!(!dispatcher.owns_loop());

	let (_tx, rx) = UnixStream::pair().unwrap();
	let calls = Rc::new(Cell::new(0));
	let watch = counting_watch(&dispatcher, rx.as_raw_fd(), &calls);

	drop(main_loop);
	assert_eq!(script.borrow().teardowns, 0);

	script.borrow_mut().batches.push_back(vec![LoopEvent::Watch {
		handle: watch.handle(),
		flags: WatchFlags::READABLE,
	}]);
	assert_eq!(dispatcher.run(RunMode::NoWait).unwrap(), 1);
	assert_eq!(calls.get(), 1);

	drop(dispatcher);
	assert_eq!(script.borrow().teardowns, 0, "the watch still needs the loop");
	drop(watch);
	assert_eq!(script.borrow().teardowns, 1);
	assert_eq!(script.borrow().calls.last().map(String::as_str), Some("remove_watch"));
}

#[test]
fn owned_loop_is_torn_down_with_dispatcher() {
	lifecycle::init().unwrap();
	let (backend, script) = scripted();
	let dispatcher = Dispatcher::with_backend(backend).unwrap();
	assert!(dispatcher.owns_loop());
	assert_eq!(dispatcher.backend_name(), "scripted");

	drop(dispatcher);
	assert_eq!(script.borrow().teardowns, 1);
	assert!(lifecycle::shutdown());
}

#[test]
fn backend_failures_carry_loop_facility_and_code() {
	lifecycle::init().unwrap();
	let (backend, script) = scripted();
	let dispatcher = Dispatcher::with_backend(backend).unwrap();

	script.borrow_mut().fail_iterate = Some(22);
	let err = dispatcher.run(RunMode::NoWait).unwrap_err();
	assert!(matches!(
		err,
		Error::Native {
			facility: Facility::Loop,
			code: 22,
			..
		}
	));
	assert!(!dispatcher.is_running());

	script.borrow_mut().fail_stop = true;
	let err = dispatcher.stop().unwrap_err();
	assert_eq!(err.facility(), Some(Facility::Loop));
}

#[test]
fn events_for_dropped_watches_are_ignored() {
	lifecycle::init().unwrap();
	let (backend, script) = scripted();
	let dispatcher = Dispatcher::with_backend(backend).unwrap();
	let (_tx, rx) = UnixStream::pair().unwrap();
	let calls = Rc::new(Cell::new(0));

	let watch = counting_watch(&dispatcher, rx.as_raw_fd(), &calls);
	let stale = watch.handle();
	drop(watch);

	let keep = counting_watch(&dispatcher, rx.as_raw_fd(), &calls);
	script.borrow_mut().batches.push_back(vec![
		LoopEvent::Watch {
			handle: stale,
			flags: WatchFlags::READABLE,
		},
		LoopEvent::Timer { handle: stale },
	]);
	assert_eq!(dispatcher.run(RunMode::NoWait).unwrap(), 0);
	assert_eq!(calls.get(), 0);
	assert_eq!(LifecycleToken::acquire().unwrap().live_handles(), 1);
	drop(keep);
}

#[test]
fn enable_state_drives_backend_registration() {
	lifecycle::init().unwrap();
	let (backend, script) = scripted();
	let dispatcher = Dispatcher::with_backend(backend).unwrap();
	let (_tx, rx) = UnixStream::pair().unwrap();

	let watch = Watch::new(&dispatcher, rx.as_raw_fd(), WatchFlags::READABLE, |_, _, _| Ok(()), None).unwrap();
	watch.set_flags(WatchFlags::READABLE | WatchFlags::WRITABLE).unwrap();
	watch.set_enabled(false).unwrap();
	watch.set_enabled(false).unwrap();
	watch.set_flags(WatchFlags::WRITABLE).unwrap();
	watch.set_enabled(true).unwrap();

	let timeout = Timeout::new(&dispatcher, Duration::from_millis(250), false, |_, _| Ok(()), None).unwrap();
	timeout.set_enabled(true).unwrap();
	timeout.set_interval(Duration::from_millis(500)).unwrap();
	timeout.set_enabled(false).unwrap();
	drop((watch, timeout));

	assert_eq!(
		script.borrow().calls,
		[
			"add_watch readable",
			"modify_watch readable|writable",
			"remove_watch",
			"add_watch writable",
			"arm_timer 250ms",
			"disarm_timer",
			"remove_watch",
		]
	);
}

#[test]
fn timer_rearmed_or_disabled_earlier_in_iteration_is_skipped() {
	lifecycle::init().unwrap();
	let (backend, script) = scripted();
	let dispatcher = Dispatcher::with_backend(backend).unwrap();
	let (_tx, rx) = UnixStream::pair().unwrap();
	let fired = Rc::new(Cell::new(0));

	let f = Rc::clone(&fired);
	let timeout = Timeout::new(
		&dispatcher,
		Duration::from_millis(10),
		true,
		move |_, _| {
			f.set(f.get() + 1);
			Ok(())
		},
		None,
	)
	.unwrap();
	timeout.set_enabled(true).unwrap();

	let t = timeout.clone();
	let watch = Watch::new(
		&dispatcher,
		rx.as_raw_fd(),
		WatchFlags::READABLE,
		move |_, _, _| {
			t.set_enabled(false)?;
			t.set_enabled(true)?;
			Ok(())
		},
		None,
	)
	.unwrap();

	script.borrow_mut().batches.push_back(vec![
		LoopEvent::Watch {
			handle: watch.handle(),
			flags: WatchFlags::READABLE,
		},
		LoopEvent::Timer {
			handle: timeout.handle(),
		},
	]);
	assert_eq!(dispatcher.run(RunMode::NoWait).unwrap(), 1);
	assert_eq!(fired.get(), 0);
	assert!(timeout.is_enabled());

	script.borrow_mut().batches.push_back(vec![LoopEvent::Timer {
		handle: timeout.handle(),
	}]);
	assert_eq!(dispatcher.run(RunMode::Once).unwrap(), 1);
	assert_eq!(fired.get(), 1);

	drop(watch);
	timeout.set_enabled(false).unwrap();
}

#[test]
fn failed_rearm_disables_repeating_timeout() {
	lifecycle::init().unwrap();
	let (backend, script) = scripted();
	let dispatcher = Dispatcher::with_backend(backend).unwrap();

	let timeout = Timeout::new(&dispatcher, Duration::from_millis(10), true, |_, _| Ok(()), None).unwrap();
	timeout.set_enabled(true).unwrap();
	let weak = timeout.downgrade();
	drop(timeout);

	{
		let mut s = script.borrow_mut();
		s.fail_arm = true;
		s.batches.push_back(vec![LoopEvent::Timer {
			handle: weak.upgrade().unwrap().handle(),
		}]);
	}
	assert_eq!(dispatcher.run(RunMode::NoWait).unwrap(), 1);
	assert!(weak.is_released());
	assert_eq!(LifecycleToken::acquire().unwrap().live_handles(), 0);
}

#[test]
fn failed_enable_leaves_timeout_disabled() {
	lifecycle::init().unwrap();
	let (backend, script) = scripted();
	let dispatcher = Dispatcher::with_backend(backend).unwrap();
	let timeout = Timeout::new(&dispatcher, Duration::from_millis(10), false, |_, _| Ok(()), None).unwrap();

	script.borrow_mut().fail_arm = true;
	let err = timeout.set_enabled(true).unwrap_err();
	assert!(matches!(err, Error::Native { code: 12, .. }));
	assert!(!timeout.is_enabled());

	let weak = timeout.downgrade();
	drop(timeout);
	assert!(weak.is_released());
}
