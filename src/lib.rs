pub mod config;
pub mod contracts;
pub mod messaging;
pub mod metrics;
pub mod resolvers;
