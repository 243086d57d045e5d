pub mod strategy_id;
pub mod event;

pub use strategy_id::*;
pub use event::*;
