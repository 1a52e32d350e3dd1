pub mod asset;
pub mod balance;
pub mod ledger;
pub mod order;

pub use asset::*;
pub use balance::*;
pub use ledger::*;
pub use order::*;
