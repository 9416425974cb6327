//! Serverless GraphQL API over Postgres.
//!
//! The function resolves its deployment, loads database credentials from the
//! secret store once per execution environment, builds a single lazy pool and
//! a GraphQL request handler, and bridges API Gateway proxy invocations onto
//! that handler.

pub mod config;
pub mod database;
pub mod deployment;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod logging;
pub mod secrets;

pub use config::{CredentialSource, RuntimeConfig};
pub use envelope::{InvocationEnvelope, ResponseEnvelope};
pub use error::{Error, Result};
pub use handler::{function_handler, InitPhase, InvocationBridge};
