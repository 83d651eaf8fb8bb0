pub mod action;
pub mod agent;
pub mod config;
pub mod engine;
pub mod event;
pub mod infusion;
pub mod lifecycle;
pub mod observe;
pub mod ore;
pub mod qi;
pub mod state;
pub mod stats;
pub mod store;
pub mod structure;
pub mod validator;
pub mod view;
pub mod wallet;
pub mod world;
pub mod zone;

#[cfg(test)]
pub(crate) mod testkit;
