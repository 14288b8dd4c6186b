//! Service objects, interfaces and connections.
//!
//! A [`Connection`] owns a [`Transport`] and a table of [`ServiceObject`]s
//! keyed by path. Incoming method calls are routed to the object at their
//! path, then to its [`Interface`]s, then to the object's own handler.
//! Outgoing calls are tracked as [`PendingCall`]s until a reply, a timeout or
//! disconnection completes them.

mod connection;
pub mod descriptor;
mod interface;
mod memory;
pub mod message;
mod object;
mod pending;

pub use connection::{Connection, Transport};
pub use descriptor::{Access, Arg, ArgSpec, Direction, Method, MethodSpec, Property, PropertySpec, Signal, SignalSpec};
pub use interface::{Interface, InterfaceHandler};
pub use memory::MemoryTransport;
pub use message::{Message, MessageType, error_names};
pub use object::{HandlerResult, ObjectHandler, ServiceObject};
pub use pending::{CallState, PendingCall, PendingHandler};
