//! Real-time price distribution backend: one multiplexed upstream kline
//! stream fanned out to any number of subscribers, with a REST warm-up
//! fetch so new subscriptions see a price before the first tick lands.

pub mod config;
pub mod connector;
pub mod errors;
pub mod feed;
pub mod models;
pub mod rest;
pub mod symbol;
pub mod web;
