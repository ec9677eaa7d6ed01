pub mod session;
pub mod stats;

pub use session::*;
pub use stats::*;
