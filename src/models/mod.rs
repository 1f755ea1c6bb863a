pub mod account;
pub mod order;
pub mod trade;
pub mod transaction;

pub use account::*;
pub use order::*;
pub use trade::*;
pub use transaction::*;
