mod error;
mod frame;
mod settings;
mod stream;
mod varint;

pub use error::*;
pub use frame::*;
pub use settings::*;
pub use stream::*;
pub use varint::*;

pub mod qpack;
