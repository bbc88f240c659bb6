//! Participant-side networking: the hub connection, typed replies, and
//! hedged command emission.

pub mod connection;
pub mod reliable;
pub mod reply;
