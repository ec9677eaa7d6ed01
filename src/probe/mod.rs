pub mod checksum;
pub mod correlate;
pub mod interface;
pub mod mock;
pub mod port;
pub mod socket;
pub mod tcp;

pub use checksum::*;
pub use correlate::*;
pub use interface::*;
pub use port::*;
pub use socket::*;
pub use tcp::*;
