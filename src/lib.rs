//! Purpose: Embedded record store library used by the `tabula` CLI, server, and tests.
//! Exports: `api` (stable programmatic surface), `core` (storage engine internals).
//! Role: Owns durability, schema enforcement, and transaction semantics; adapters only call in.
//! Invariants: The engine never logs or prints; every failure is a returned `Error`.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
pub mod table_paths;
