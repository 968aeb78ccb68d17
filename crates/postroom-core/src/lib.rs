//! Postroom Core - SMTP to chat room bridge
//!
//! Each chat room the bot joins can claim a mailbox. Inbound mail becomes
//! room messages grouped into threads, replies in those threads go back out
//! as email, and room commands manage the mailbox and the abuse guard.

pub mod bridge;
pub mod chat;
pub mod delivery;
pub mod email;
pub mod guard;
pub mod locks;
pub mod queue;
pub mod registry;
pub mod settings;
pub mod smtp;
pub mod threads;

#[cfg(test)]
mod test_support;

pub use bridge::{Bridge, BridgeParts};
pub use chat::{ChatClient, Dispatcher, MatrixClient};
pub use delivery::{SmtpMailer, Transport};
pub use email::DkimSigner;
pub use guard::{AbuseGuard, Dnsbl, ResolverLookup, SenderValidator};
pub use smtp::SmtpServer;
