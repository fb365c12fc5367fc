//! Searches LDAP directories for complete result sets even when the server
//! cuts single searches off at a size limit.
//!
//! [`engine::SearchEngine`] probes with a plain search first and switches to
//! paging, and from there to filter-based range chunking, when the result
//! looks truncated.

pub mod config;
pub mod dedup;
pub mod directory;
pub mod engine;
pub mod error;
pub mod filter;
pub mod ldap;
pub mod ldif;
pub mod memory;
pub mod request;
pub mod truncation;
