//! Outbound protocol engine
//!
//! The initiator side of the four distributed operations. Each runs on the
//! client pool, fans per-target work out to the protocol pool, and reports
//! one aggregate notification. Transport failures stay confined to the
//! per-target task that hit them.

mod backup;
mod delete;
mod reclaim;
mod restore;
