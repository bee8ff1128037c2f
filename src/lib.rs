pub mod app;
pub mod config;
pub mod consolidate;
pub mod domain;
pub mod duplicates;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod manifest;
pub mod normalize;
pub mod output;
pub mod ratelimit;
pub mod retry;
pub mod scheduler;
pub mod transfer;
pub mod verify;
