//! Trade alert delivery.
//!
//! This crate provides:
//! - Message rendering for chat (HTML) and mail (text + HTML)
//! - Telegram delivery with front-door rotation
//! - SMTP delivery with sticky sender failover
//! - Token market data with a bounded cache and request rate counters

pub mod channel;
pub mod error;
pub mod format;
pub mod mail;
pub mod market;
pub mod router;
pub mod telegram;

pub use channel::*;
pub use error::*;
pub use format::*;
pub use mail::*;
pub use market::*;
pub use router::*;
pub use telegram::*;
