//! Real-time position sync for rehearsal sessions.
//!
//! A hub relays a leader's song, line, word, and auto-scroll changes to every
//! follower in the same session. The hub side lives in `routes`, `services`,
//! and `state`; the participant side in `net` and `position`.

pub mod catalog;
pub mod config;
pub mod dedup;
pub mod event;
pub mod frame;
pub mod net;
pub mod position;
pub mod routes;
pub mod services;
pub mod state;
