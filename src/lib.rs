pub mod admission;
pub mod config;
pub mod error;
pub mod job;
pub mod maintenance;
pub mod metadata;
pub mod orchestrator;
pub mod progress;
pub mod quota;
pub mod registry;
pub mod resolver;
pub mod routes;
pub mod supervisor;
pub mod validation;
