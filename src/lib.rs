//! Lifeline - emergency session orchestration for a campus safety app.
//!
//! # Overview
//!
//! Lifeline owns the lifecycle of an emergency session: a student reports
//! an emergency, the coordinator persists a session record, starts
//! continuous location tracking and audio capture, fans out notifications
//! to responders, volunteers, and emergency contacts, and mirrors remote
//! updates until the session reaches a terminal status.
//!
//! The core is built for partial failure: permission denials and
//! unreachable collaborators degrade individual capabilities without ever
//! failing session creation, and losing connectivity falls back to a
//! local-only session that still captures location and audio.
//!
//! # Modules
//!
//! - [`model`]: Session, update, and status types, with the declared
//!   transition table
//! - [`coordinator`]: The session state machine and side-effect sequencing
//! - [`location`]: One-shot and continuous positioning, geocoding, and
//!   proximity search
//! - [`audio`]: Exclusive emergency recording with upload-on-stop
//! - [`notify`]: Responder, volunteer, and contact fan-out
//! - [`gateways`]: Push and SMS delivery clients
//! - [`backend`]: Document store, auth, and connectivity contracts
//! - [`storage`]: Local key-value persistence
//! - [`session`]: Auth-session cache with lazy expiry
//! - [`geo`]: Haversine distance and radius filtering
//! - [`hazard`]: Hazard-report upvote toggle

pub mod audio;
pub mod backend;
pub mod coordinator;
pub mod error;
pub mod gateways;
pub mod geo;
pub mod hazard;
pub mod location;
pub mod model;
pub mod notify;
pub mod observers;
pub mod session;
pub mod storage;
