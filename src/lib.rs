pub mod cache;
pub mod config;
pub mod consistency;
pub mod context;
pub mod controller;
pub mod db;
pub mod error;
pub mod identity;
pub mod journal;
pub mod lock;
pub mod mapping;
pub mod model;
pub mod pipeline;
pub mod reconcile;
pub mod source;
pub mod target;
pub mod tracker;
