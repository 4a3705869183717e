//! CLI subcommands.
//!
//! - `chat`: interactive terminal chat over all tool servers
//! - `tools`: `list-tools` and one-shot `call`
//!
//! The gateway subcommand lives in [`crate::gateway`].

pub mod chat;
pub mod tools;
