//! Code generation: prompt rendering, the inference client, and extraction
//! of executable source from model responses.

pub mod client;
pub mod extract;
pub mod prompts;

pub use client::HttpGenerator;
pub use extract::extract_code;
