mod client;
mod connection;
mod cookie;
mod datagram;
mod early_data;
mod error;
mod socks;
mod stream;
mod streams;
mod time;
mod transport;

pub use client::*;
pub use connection::*;
pub use cookie::*;
pub use datagram::*;
pub use early_data::*;
pub use error::*;
pub use socks::*;
pub use stream::*;
pub use streams::*;
pub use time::*;
pub use transport::*;
