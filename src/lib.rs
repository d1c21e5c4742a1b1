//! Read-only query API over a corpus of CADF audit events, scoped per
//! tenant, with token authentication against an external identity
//! provider and optional id→name enrichment of returned events.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod identity;
pub mod logging;
pub mod policy;
pub mod server;
pub mod storage;
