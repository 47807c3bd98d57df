pub mod app;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod filter;
pub mod ledger;
pub mod models;
pub mod output;
pub mod report;
pub mod scheduler;
pub mod session;
