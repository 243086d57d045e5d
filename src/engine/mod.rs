pub mod controller;
pub mod facade;
pub mod ingest;

pub use controller::*;
pub use facade::*;
pub use ingest::*;
