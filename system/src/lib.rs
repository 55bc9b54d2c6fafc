pub extern crate bincode;
pub extern crate serde;

mod message;
mod raster;
mod session_state;
mod types;

pub use message::*;
pub use raster::*;
pub use session_state::*;
pub use types::*;
