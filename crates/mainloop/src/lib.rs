//! Main-loop integration for busline.
//!
//! A [`Dispatcher`] drives a [`Backend`] and routes readiness to [`Watch`]es
//! and [`Timeout`]s through the module's handle registry. Handlers run on the
//! thread that calls [`Dispatcher::run`], after the backend call has returned,
//! so they may freely create, change or drop watches and timeouts.

pub mod backend;
mod dispatcher;
mod flags;
pub mod poll;
mod timeout;
mod watch;

pub use backend::{Backend, LoopEvent};
pub use dispatcher::{Dispatcher, EventLoop, RunMode};
pub use flags::WatchFlags;
pub use poll::PollBackend;
pub use timeout::{Timeout, TimeoutHandler, WeakTimeout};
pub use watch::{Watch, WatchHandler};
