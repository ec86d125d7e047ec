//! Premium collection, commission splitting, settlement and commission payout
//! over a mobile-money gateway.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
