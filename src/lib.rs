//! Core machinery for installing, expanding and updating an on-premises
//! clustered application across a fleet of machines.
//!
//! The crate is organized around four subsystems:
//!
//! - [`plan`] resolves the active cluster operation across the reachable
//!   state stores and dispatches phase-level actions to type-specific plan
//!   drivers.
//! - [`rpc`] maintains a reconnecting, health-checked group of remote agents
//!   and dispatches commands to them over streaming gRPC.
//! - [`signals`] turns termination signals and explicit triggers into an
//!   orderly shutdown of registered workers.
//! - [`storage`], [`localenv`] and [`ops`] define the seams to the state
//!   stores and the wizard operator the resolver composes over.

pub mod defaults;
pub mod error;
pub mod localenv;
pub mod ops;
pub mod plan;
pub mod rpc;
pub mod signals;
pub mod storage;

pub use error::{Error, Result};
