//! Data plane: the command registry and the dispatcher that drives it.

mod command;
mod dispatcher;

pub use command::Command;
pub use dispatcher::{DispatchSettings, Dispatcher};
