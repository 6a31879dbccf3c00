//! A Raft consensus kernel with PreVote, driving a replicated application.
//!
//! Each node is a single event loop ([`node`]) that owns all consensus state
//! and hands work to three collaborators over channels: a transport
//! ([`transport`] over TCP, or [`network`] in-process), the replicated
//! application ([`app`]) and durable storage ([`storage`]). The role state
//! machine lives in [`role`]; [`runtime`] wires everything together.
//!
//! # Modules
//!
//! - [`log`]: log keys, entries and the shared [`log::LogStore`]
//! - [`message`]: peer protocol messages and the JSON-line wire envelope
//! - [`meta`]: node metadata, both configuration and persisted state
//! - [`role`]: Follower, Candidate and Leader behind the [`role::Role`] trait
//! - [`node`]: the event loop, term filtering and role switching
//! - [`sync`]: clients waiting for their writes to commit
//! - [`error`]: typed errors and the fatal/non-fatal split
//! - [`console`], [`cli`]: operator console and command-line arguments

pub mod app;
pub mod cli;
pub mod console;
pub mod error;
pub mod log;
pub mod message;
pub mod meta;
pub mod network;
pub mod node;
pub mod role;
pub mod runtime;
pub mod storage;
pub mod sync;
pub mod transport;
