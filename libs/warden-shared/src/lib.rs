pub mod codec;
pub mod models;

pub use codec::{ClientRecord, CodecError, InboundSettings};
pub use models::*;
