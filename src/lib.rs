//! webarc - recursive web archiver.
//!
//! A wget-style crawler with a durable, resumable URL queue and WARC 1.0
//! output: discovered links feed back into the frontier, every URL is
//! fetched at most once, and each exchange can be recorded bit-for-bit into
//! the archive.
//!
//! The crate is organized by pipeline stage: [`urlnorm`] canonicalizes URLs,
//! [`frontier`] persists them, [`filters`] and [`robots`] gate them,
//! [`fetch`] performs the exchange, [`warc`] records it, [`writer`]
//! materializes bodies, [`scrape`] discovers children, and [`engine`] drives
//! the whole loop under [`stats`] and [`hooks`] observation.

pub mod cli;
pub mod config;
pub mod cookies;
pub mod engine;
pub mod fetch;
pub mod filters;
pub mod frontier;
pub mod hooks;
pub mod models;
pub mod robots;
pub mod scrape;
pub mod stats;
pub mod urlnorm;
pub mod waiter;
pub mod warc;
pub mod writer;
