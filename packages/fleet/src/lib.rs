// Fleet - distributed job scheduler for browser-automation workers
//
// This crate provides the scheduling core: worker registration and
// heartbeats, at-most-once job claiming over a shared Postgres queue, the
// job state machine with human-in-the-loop pause/resume, callback fan-out
// to the external orchestrator, encrypted browser-session persistence, and
// per-user/platform admission control.
//
// Browser drivers, LLM clients, and the per-job-type handlers are external
// collaborators consumed through the trait seams in `kernel`.

pub mod config;
pub mod kernel;
pub mod server;

pub use config::*;
