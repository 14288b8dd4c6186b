//! Outgoing calls: reply matching, cancellation, timeouts and disconnection.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use busline_core::{Error, LifecycleToken, lifecycle};
use busline_mainloop::{Dispatcher, RunMode};
use busline_object::{
	CallState, Connection, HandlerResult, Interface, MemoryTransport, Message, MessageType, MethodSpec, PendingCall, ServiceObject, Transport,
	error_names,
};

type Replies = Rc<RefCell<Vec<Message>>>;

fn setup() -> (Connection, MemoryTransport) {
	lifecycle::init().unwrap();
	let (local, peer) = MemoryTransport::pair().unwrap();
	(Connection::new(local).unwrap(), peer)
}

fn ping() -> Message {
	Message::method_call(Some("org.example.Service"), "/org/example", Some("org.example.Echo"), "Ping").unwrap()
}

fn recorder(replies: &Replies) -> impl Fn(&PendingCall, &Message, Option<&busline_core::UserData>) -> anyhow::Result<()> + 'static {
	let replies = Rc::clone(replies);
	move |_, reply, _| {
		replies.borrow_mut().push(reply.clone());
		Ok(())
	}
}

#[test]
fn reply_completes_the_call_once() {
	let (conn, mut peer) = setup();
	let replies = Replies::default();
	let call = conn.call(ping(), recorder(&replies), None).unwrap();
	assert_eq!(call.state(), CallState::Waiting);
	assert_eq!(conn.pending_calls().len(), 1);

	let sent = peer.receive().unwrap().expect("call on the wire");
	assert_eq!(sent.serial(), call.serial());
	peer.send(&Message::method_return(&sent)).unwrap();
	peer.send(&Message::method_return(&sent)).unwrap();
	assert_eq!(conn.read_incoming().unwrap(), 2);

	assert_eq!(replies.borrow().len(), 1);
	assert_eq!(call.state(), CallState::Completed);
	assert_eq!(call.reply().map(|m| m.kind()), Some(MessageType::MethodReturn));
	assert!(conn.pending_calls().is_empty());
	assert!(matches!(call.cancel(), Err(Error::CallCompleted)));
	assert!(matches!(call.set_data(None), Err(Error::CallCompleted)));
}

#[test]
fn error_replies_are_delivered_as_is() {
	let (conn, mut peer) = setup();
	let replies = Replies::default();
	conn.call(ping(), recorder(&replies), None).unwrap();

	let sent = peer.receive().unwrap().unwrap();
	peer.send(&Message::error(&sent, "org.example.Error.Busy", "try later").unwrap()).unwrap();
	conn.read_incoming().unwrap();

	let replies = replies.borrow();
	assert_eq!(replies[0].error_name(), Some("org.example.Error.Busy"));
	assert_eq!(replies[0].error_text(), Some("try later"));
}

#[test]
fn calls_complete_without_a_caller_handle() {
	let (conn, mut peer) = setup();
	let replies = Replies::default();
	drop(conn.call(ping(), recorder(&replies), None).unwrap());

	let sent = peer.receive().unwrap().unwrap();
	peer.send(&Message::method_return(&sent)).unwrap();
	conn.read_incoming().unwrap();
	assert_eq!(replies.borrow().len(), 1);
}

#[test]
fn cancelled_calls_ignore_their_reply() {
	let (conn, mut peer) = setup();
	let replies = Replies::default();
	let call = conn.call(ping(), recorder(&replies), None).unwrap();
	call.cancel().unwrap();
	assert_eq!(call.state(), CallState::Cancelled);
	assert!(matches!(call.cancel(), Err(Error::CallCompleted)));
	assert!(conn.pending_calls().is_empty());

	let sent = peer.receive().unwrap().unwrap();
	peer.send(&Message::method_return(&sent)).unwrap();
	conn.read_incoming().unwrap();
	assert!(replies.borrow().is_empty());
	assert!(call.reply().is_none());
}

#[test]
fn handler_can_be_replaced_while_waiting() {
	let (conn, mut peer) = setup();
	let first = Replies::default();
	let second = Replies::default();
	let call = conn.call(ping(), recorder(&first), None).unwrap();
	call.set_handler(Some(Rc::new(recorder(&second)))).unwrap();
	call.set_data(Some(Rc::new(1u8))).unwrap();
	assert!(call.data().is_some());

	let sent = peer.receive().unwrap().unwrap();
	peer.send(&Message::method_return(&sent)).unwrap();
	conn.read_incoming().unwrap();
	assert!(first.borrow().is_empty());
	assert_eq!(second.borrow().len(), 1);
	assert!(call.data().is_none());
}

#[test]
fn only_method_calls_expecting_a_reply_are_tracked() {
	let (conn, _peer) = setup();
	let signal = Message::signal("/org/example", "org.example.Echo", "Pinged").unwrap();
	assert!(matches!(conn.call(signal, |_, _, _| Ok(()), None), Err(Error::InvalidArgument(_))));
	let silent = ping().with_no_reply(true);
	assert!(matches!(conn.call(silent, |_, _, _| Ok(()), None), Err(Error::InvalidArgument(_))));
	assert!(conn.pending_calls().is_empty());
}

#[test]
fn close_fails_waiting_calls_with_disconnected() {
	let (conn, _peer) = setup();
	let replies = Replies::default();
	let first = conn.call(ping(), recorder(&replies), None).unwrap();
	let second = conn.call(ping(), recorder(&replies), None).unwrap();
	assert!(first.serial() < second.serial());

	conn.close();
	conn.close();

	let names: Vec<_> = replies.borrow().iter().map(|m| (m.reply_serial(), m.error_name().map(str::to_owned))).collect();
	assert_eq!(
		names,
		[
			(Some(first.serial()), Some(error_names::DISCONNECTED.to_owned())),
			(Some(second.serial()), Some(error_names::DISCONNECTED.to_owned())),
		]
	);
	assert!(!conn.is_open());
	assert!(matches!(conn.send(ping()), Err(Error::Disconnected)));
	assert!(matches!(conn.call(ping(), |_, _, _| Ok(()), None), Err(Error::Disconnected)));
}

#[test]
fn dropping_the_connection_fails_waiting_calls() {
	let (conn, _peer) = setup();
	let replies = Replies::default();
	let call = conn.call(ping(), recorder(&replies), None).unwrap();
	drop(conn);
	assert_eq!(call.reply().and_then(|m| m.error_name().map(str::to_owned)).as_deref(), Some(error_names::DISCONNECTED));
	assert_eq!(replies.borrow().len(), 1);
}

#[test]
fn send_failures_roll_the_call_back() {
	let (conn, peer) = setup();
	let mut peer = peer;
	peer.close();
	let replies = Replies::default();
	let err = conn.call(ping(), recorder(&replies), None).unwrap_err();
	assert!(matches!(err, Error::Native { .. }));
	assert!(conn.pending_calls().is_empty());
	assert!(replies.borrow().is_empty());
}

#[test]
fn attach_needs_a_pollable_transport_once() {
	struct Deaf;
	impl Transport for Deaf {
		fn send(&mut self, _: &Message) -> std::io::Result<()> {
			Ok(())
		}

		fn receive(&mut self) -> std::io::Result<Option<Message>> {
			Ok(None)
		}
	}

	lifecycle::init().unwrap();
	let dispatcher = Dispatcher::new().unwrap();
	let deaf = Connection::new(Deaf).unwrap();
	assert!(matches!(deaf.attach(&dispatcher), Err(Error::InvalidArgument(_))));

	let (local, _peer) = MemoryTransport::pair().unwrap();
	let conn = Connection::new(local).unwrap();
	conn.attach(&dispatcher).unwrap();
	assert!(matches!(conn.attach(&dispatcher), Err(Error::InvalidArgument(_))));
}

#[test]
fn unanswered_calls_time_out_with_no_reply() {
	let (conn, _peer) = setup();
	let dispatcher = Dispatcher::new().unwrap();
	conn.attach(&dispatcher).unwrap();
	let before = LifecycleToken::acquire().unwrap().live_handles();

	let replies = Replies::default();
	let seen = Rc::clone(&replies);
	let stopper = dispatcher.clone();
	let call = conn
		.call_with_timeout(
			ping(),
			Some(Duration::from_millis(20)),
			move |_, reply, _| {
				seen.borrow_mut().push(reply.clone());
				stopper.stop()?;
				Ok(())
			},
			None,
		)
		.unwrap();

	dispatcher.run(RunMode::Wait).unwrap();

	assert_eq!(replies.borrow().len(), 1);
	assert_eq!(replies.borrow()[0].error_name(), Some(error_names::NO_REPLY));
	assert_eq!(call.state(), CallState::Completed);
	assert!(conn.pending_calls().is_empty());
	assert_eq!(LifecycleToken::acquire().unwrap().live_handles(), before);
}

#[test]
fn attached_connections_exchange_calls_and_replies() {
	lifecycle::init().unwrap();
	let dispatcher = Dispatcher::new().unwrap();
	let (client_end, server_end) = MemoryTransport::pair().unwrap();
	let client = Connection::new(client_end).unwrap();
	let server = Connection::new(server_end).unwrap();
	client.attach(&dispatcher).unwrap();
	server.attach(&dispatcher).unwrap();

	let echo = Interface::new("org.example.Echo").unwrap().with_handler(|_, connection, msg, _| {
		connection.send(Message::method_return(msg).with_body("s", b"pong".to_vec())?)?;
		Ok(HandlerResult::Handled)
	});
	echo.register_methods(&[MethodSpec::new("Ping")]).unwrap();
	let object = ServiceObject::new("/org/example").unwrap();
	object.add_interface(&echo).unwrap();
	server.register_object(&object).unwrap();

	let replies = Replies::default();
	let seen = Rc::clone(&replies);
	let stopper = dispatcher.clone();
	client
		.call(
			ping(),
			move |_, reply, _| {
				seen.borrow_mut().push(reply.clone());
				stopper.stop()?;
				Ok(())
			},
			None,
		)
		.unwrap();

	dispatcher.run(RunMode::Wait).unwrap();

	let replies = replies.borrow();
	assert_eq!(replies.len(), 1);
	assert_eq!(replies[0].kind(), MessageType::MethodReturn);
	assert_eq!(replies[0].body(), b"pong");
}

#[test]
fn peer_hangup_closes_an_attached_connection() {
	let (conn, peer) = setup();
	let dispatcher = Dispatcher::new().unwrap();
	conn.attach(&dispatcher).unwrap();

	let replies = Replies::default();
	let seen = Rc::clone(&replies);
	let stopper = dispatcher.clone();
	conn.call_with_timeout(
		ping(),
		None,
		move |_, reply, _| {
			seen.borrow_mut().push(reply.clone());
			stopper.stop()?;
			Ok(())
		},
		None,
	)
	.unwrap();
	drop(peer);

	dispatcher.run(RunMode::Wait).unwrap();

	assert!(!conn.is_open());
	assert_eq!(replies.borrow()[0].error_name(), Some(error_names::DISCONNECTED));
}

#[test]
fn oversized_reply_timeouts_are_clamped() {
	let (conn, _peer) = setup();
	let dispatcher = Dispatcher::new().unwrap();
	conn.attach(&dispatcher).unwrap();

	let call = conn.call_with_timeout(ping(), Some(Duration::MAX), |_, _, _| Ok(()), None).unwrap();
	assert_eq!(call.state(), CallState::Waiting);
	call.cancel().unwrap();

	conn.set_default_timeout(Some(Duration::MAX));
	let call = conn.call(ping(), |_, _, _| Ok(()), None).unwrap();
	assert_eq!(call.state(), CallState::Waiting);
}

#[test]
fn closing_releases_the_dispatcher() {
	let (conn, _peer) = setup();
	let dispatcher = Dispatcher::new().unwrap();
	conn.attach(&dispatcher).unwrap();
	assert!(conn.dispatcher().is_some_and(|d| d.backend_name() == dispatcher.backend_name()));
	let before = LifecycleToken::acquire().unwrap().live_handles();

	conn.close();

	assert!(conn.dispatcher().is_none());
	assert_eq!(LifecycleToken::acquire().unwrap().live_handles(), before - 1);
	assert_eq!(dispatcher.run(RunMode::Wait).unwrap(), 0);
	assert!(matches!(conn.attach(&dispatcher), Err(Error::Disconnected)));
}
