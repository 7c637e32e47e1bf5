//! Wire event schema shared by the relay server and the client crate.
//!
//! Both sides speak JSON text frames over the websocket; every frame is one
//! internally-tagged event from the enums in [`events`].

pub mod events;

pub use events::{ClientEvent, ServerEvent};
