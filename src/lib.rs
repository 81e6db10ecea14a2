mod block;
mod board;
mod catalog;
mod config;
mod controller;
mod error;
mod filter;
mod header;
mod impedance;
mod queue;
mod serializer;
mod trigger;
mod tui;
mod utils;

pub use block::*;
pub use board::*;
pub use catalog::*;
pub use config::*;
pub use controller::*;
pub use error::*;
pub use filter::*;
pub use header::*;
pub use impedance::*;
pub use queue::*;
pub use serializer::*;
pub use trigger::*;
pub use tui::*;
pub use utils::*;
