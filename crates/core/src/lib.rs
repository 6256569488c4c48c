//! Core data types for the KOL trade monitor.

pub mod address;
pub mod balance;
pub mod mint;
pub mod retry;
pub mod trade;

pub use address::*;
pub use balance::*;
pub use mint::*;
pub use retry::*;
pub use trade::*;
