pub mod config;
pub mod error;
pub mod event;

pub use error::{EventBusError, Result, VerityError};
pub use event::TransitionKind;
