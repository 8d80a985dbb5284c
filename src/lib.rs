//! Sentinel -- Autonomous Blockchain Security Agent
//!
//! A self-directed agent that monitors on-chain and social signals,
//! generates its own analysis and quarantine code, and executes it in an
//! isolated sandbox on a bounded retry loop.

pub mod types;
pub mod error;
pub mod config;
pub mod state;
pub mod sandbox;
pub mod codegen;
pub mod intel;
pub mod monitor;
pub mod agent;
pub mod scheduler;
