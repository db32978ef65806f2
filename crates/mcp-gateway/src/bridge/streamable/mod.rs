//! stdio → Streamable HTTP.
//!
//! One path serves POST (client messages), GET (server push) and DELETE
//! (end of session). [`stateful`] pins a child to each session;
//! [`stateless`] spawns a child per POST.

pub mod stateful;
pub mod stateless;
pub mod transport;

pub use stateful::{StatefulBridge, StatefulOptions};
pub use stateless::StatelessBridge;
