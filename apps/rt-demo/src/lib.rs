//! Shared plumbing for the `echo-server`/`echo-client` demo binaries —
//! not the router layer (spec.md §1), just enough config loading to avoid
//! duplicating it between the two bins.

pub mod config;
