pub mod abi;
pub mod config;
pub mod decode;
pub mod encode;
pub mod lock;
pub mod memory;
pub mod socket;
pub mod store;

pub use config::*;
pub use decode::{DecodeError, decode};
pub use encode::{EncodedTable, encode};
pub use lock::*;
pub use memory::*;
pub use socket::*;
pub use store::*;

// ip_tables sockopt backend: blob codec, raw socket, xtables lock
