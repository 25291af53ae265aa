pub mod compat;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod migration;
pub mod model;
pub mod outbox;
pub mod remote;
