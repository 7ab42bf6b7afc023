//! Addressable shell sessions for agents.
//!
//! A [`session::SessionRegistry`] owns pty- or pipe-backed shells, captures
//! their output into bounded buffers and publishes every lifecycle step on a
//! sequence-ordered [`events::EventBus`]. [`tools::TerminalTools`] is the
//! control surface; [`mcp`] exposes it as MCP tools over stdio.

pub mod config;
pub mod error;
pub mod events;
pub mod mcp;
pub mod session;
pub mod tools;
pub mod utils;
