pub mod aggregate;
pub mod commands;
pub mod config;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod market_data;
pub mod models;
pub mod param_utils;
pub mod performance;
pub mod planner;
pub mod portfolio;
pub mod progress;
pub mod simulation;
pub mod strategy;
pub mod strategy_utils;
pub mod temporal;
pub mod worker;
