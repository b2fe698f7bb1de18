//! genforge library crate
//!
//! Turns a streamed code-generation completion into a project tree on disk, repairs the
//! usual dependency and import mistakes, and verifies the result with the project's own
//! build. The binary is a thin CLI over [`pipeline::Pipeline`].

pub mod build;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod project;
pub mod repair;
pub mod util;
