// SPDX-License-Identifier: MIT
//
// Pit Boss LAN Controller
// https://github.com/pitboss-lan/pitboss-lan

//! Pit Boss LAN Controller Core
//!
//! This crate is the core of a LAN-only controller for Pit Boss WiFi
//! pellet grills. It continuously reconciles a grill's observable state
//! (temperatures, component outputs, errors, authentication clock) with a
//! local model and emits typed state updates for a home-automation host.
//!
//! # Architecture
//!
//! The library is organized into modules representing core concerns:
//! - `codec`: byte-evolving cipher, key derivation, hex plumbing
//! - `http`: connection-per-request client for the grill's endpoints
//! - `auth`: password fetch and time-keyed dual-token cache
//! - `rpc`: typed RPC endpoints and MCU command encoding
//! - `status`: decoding of the `sc_11`/`sc_12` status blobs
//! - `fields`: host-supplied per-device key-value store
//! - `reducer`: pure fold of poll results into derived state
//! - `panic`: lost-while-cooking arbitration
//! - `scheduler`: adaptive health-check interval policy
//! - `discovery`: rate-limited, resumable subnet rediscovery
//! - `controller`: per-device orchestration and lifecycle
//!
//! # Design principles
//!
//! 1. **Pure cores**: reduction, interval policy, and rate limiting are
//!    side-effect free and take the clock as an argument
//! 2. **Single mutator**: all per-device state flows through the
//!    controller; collaborators observe events
//! 3. **Total decoding**: malformed grill output degrades to defensive
//!    defaults, never to a panic

pub mod auth;
pub mod codec;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod fields;
pub mod http;
pub mod panic;
pub mod reducer;
pub mod rpc;
pub mod scheduler;
pub mod state;
pub mod status;

pub use controller::{Command, GrillController};
pub use error::{Error, Result};
pub use state::{DerivedState, StateUpdate};
pub use status::{Status, Temperature, Unit};

/// Library version for host compatibility reporting.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
