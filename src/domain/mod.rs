//! Domain model: payments, commission splits, settlement batches, payout
//! line items and transfers, plus the ports the application layer depends on.

pub mod audit;
pub mod gateway;
pub mod ids;
pub mod money;
pub mod payment;
pub mod phone;
pub mod ports;
pub mod rate;
pub mod settlement;
pub mod transfer;
