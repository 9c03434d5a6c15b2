//! `decree` is a minimalistic crate that exposes the building blocks of
//! an event-sourced command-handling backend.
//!
//! The source of truth of such a backend is the Journal, an append-only
//! log of Domain Events; the outside world is reached through the Outbox,
//! a durable queue of notifications committed atomically with the events
//! that caused them.
//!
//! The crate revolves around a handful of concepts:
//!
//! * [Model], the user-supplied pair of pure functions describing a
//!   Domain: folding events into state, and deciding commands;
//! * [Decision], the three-valued result of a command evaluation, and
//!   [Response], which layers the outbound notifications over it;
//! * [journal], the append-only Event Stream storage with optimistic
//!   locking, and [outbox], the at-least-once delivery buffer;
//! * [repository::Repository], reconstructing Aggregate states from
//!   [snapshot]s and Event Stream tails;
//! * [handler::EventSourced], the transactional command handler tying
//!   everything together, wired up by a [Backend];
//! * [scenario::Scenario], a given/when/then harness to test [Model]
//!   implementations through the full pipeline.
//!
//! Storage is pluggable through the capability traits in [journal],
//! [outbox], [snapshot] and [notify]; the [inmemory] driver implements
//! all of them and backs the test harness.

pub mod backend;
pub mod command;
pub mod decision;
pub mod event;
pub mod handler;
pub mod inmemory;
pub mod journal;
pub mod message;
pub mod model;
pub mod notify;
pub mod outbox;
pub mod repository;
pub mod response;
pub mod scenario;
pub mod snapshot;
pub mod version;

pub use crate::backend::{Backend, Config};
pub use crate::decision::{Decision, NonEmpty};
pub use crate::message::Message;
pub use crate::model::Model;
pub use crate::response::Response;
pub use crate::version::{SeqNr, Version};
