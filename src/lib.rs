//! Parlay betting intermediary: quoting, hedging, ledger, and settlement
//! for multi-leg parlays built on top of a single-outcome prediction
//! market venue.

pub mod api;
pub mod config;
pub mod db;
pub mod db_retry;
pub mod error;
pub mod exchange;
pub mod hedging;
pub mod ledger;
pub mod models;
pub mod quote;
pub mod settlement;
