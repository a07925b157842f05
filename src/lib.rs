pub mod billing;
pub mod charging_engine;
pub mod config;
pub mod connectors;
pub mod error;
pub mod job_queue;
pub mod matching;
pub mod routes;
