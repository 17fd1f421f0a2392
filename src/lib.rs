//! Yggdrasil - MMO login server
//!
//! The authentication authority of the server cluster: it brokers client
//! logins, issues one-time tickets redeemed by the char-servers, and
//! keeps the distributed view of online players coherent.

/// Server configuration (`key: value` files with imports)
pub mod config;
/// Account records and the pluggable store (file or SQL)
pub mod account;
/// Network policy: subnet remap, dynamic IP bans, DNSBL
pub mod network;
/// The login server core: sessions, tickets, presence, inter-server
pub mod login;
