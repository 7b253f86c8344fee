pub mod battery;
pub mod command;

pub use battery::*;
pub use command::*;
