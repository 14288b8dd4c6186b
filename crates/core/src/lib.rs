//! Core of the busline D-Bus binding layer.
//!
//! This crate holds the pieces every other busline crate builds on:
//!
//! - [`lifecycle`]: the init/shutdown gate that keeps the protocol engine alive
//!   while any dependent object exists.
//! - [`registry`]: the weak index from native handles back to their wrappers.
//! - [`callback`]: handler/user-data pairs and the guarded call boundary.
//! - [`names`]: D-Bus name, path and signature validation.
//! - [`config`]: TOML configuration.
//!
//! Everything here is single-threaded. Wrappers are `Rc`-based and stay on the
//! thread that called [`lifecycle::init`].

pub mod callback;
pub mod config;
mod error;
pub mod lifecycle;
pub mod names;
pub mod registry;

pub use callback::{CallbackContext, UserData};
pub use error::{Error, Facility, NameKind, Result};
pub use lifecycle::LifecycleToken;
pub use registry::{HandleRegistry, NativeHandle};
