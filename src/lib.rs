pub mod config;
pub mod dispatcher;
pub mod error;
pub mod factory;
pub mod identity;
pub mod llm;
pub mod metrics;
pub mod mqtt;
pub mod prompt;
pub mod registry;
pub mod session;
pub mod signing;
pub mod tools;
pub mod transport;
pub mod wallet_gateway;
pub mod wallet_store;
