//! Human-gated development workflow.
//!
//! | Module          | Responsibility                                        |
//! |-----------------|-------------------------------------------------------|
//! | `models`        | Persisted entities and their closed status enums      |
//! | `db`            | SQLite storage and the async `DbHandle`               |
//! | `pipeline`      | The fixed, numbered list of phases                    |
//! | `locks`         | Per-project advisory locks                            |
//! | `gates`         | Approval gate lifecycle                               |
//! | `topics`        | Conversation topic segmentation                       |
//! | `state_machine` | `advance` / `resolve` / `retry`                       |
//! | `orchestrator`  | Service object wiring the above together              |

pub mod db;
pub mod gates;
pub mod locks;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod state_machine;
pub mod topics;

pub use orchestrator::Orchestrator;
