//! Client side of the remote agent runtime.
//!
//! The runtime exposes a send / poll / clear message API with no completion
//! event. `executor` sends a command and waits for the message log to go
//! quiet (`quiescence`) under a deadline measured on a `clock`.

pub mod client;
pub mod clock;
pub mod executor;
pub mod quiescence;
pub mod types;
