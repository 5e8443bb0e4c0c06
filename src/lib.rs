//! Graft - In-process GUI Loop Grafting for Debugger Hosts
//!
//! A debugger inspector plugin needs a GUI event loop, but the process it
//! is loaded into - the debugger's RPC server - was never designed to run
//! one. Graft solves this without any cooperation from the host:
//!
//! - `probe` wraps the platform services needed to look inside the host
//! - `inject` resolves the host's private symbols, fingerprints the live
//!   connection object on its heap and rewrites that object's dispatch
//!   table while the host is frozen
//! - `relay` stands behind the rewritten table: a background thread drains
//!   the real channel while the host's own blocking read, intercepted,
//!   pumps the embedded GUI until data arrives
//! - `diag` collects the injection log in a ring the host can dump
//! - `host` carries the activation entry point and the narrow seams to the
//!   host console and the GUI subsystem
//!
//! Success is silent; failure leaves the host exactly as it was.

pub mod diag;
pub mod host;
pub mod inject;
pub mod probe;
pub mod relay;
