pub mod api;
pub mod auth;
pub mod billing;
pub mod cache;
pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod model;
pub mod notify;
pub mod outbox;
pub mod rate_limit;
pub mod sanitize;
pub mod transitions;
pub mod validation;
pub mod webhook;
pub mod workflow;
