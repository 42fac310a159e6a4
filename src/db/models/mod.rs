//! Database models split into separate files.

pub mod event;
pub mod notification;

pub use self::event::*;
pub use self::notification::*;
