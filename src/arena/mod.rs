//! Arena module - memory a decoded message tree lives in.
//!
//! Every decoded message occupies one contiguous, 16-byte aligned buffer:
//! ```text
//! ┌─────────────┬──────────────────┬────────────────────────────────┐
//! │ root struct │ dynamic region   │ tail: arrays, strings, bytes   │
//! └─────────────┴──────────────────┴────────────────────────────────┘
//! ```
//! Pointer slots inside the buffer hold either machine addresses or
//! offsets from the start of the buffer, see [`Addressing`].

mod context;
mod memory;

pub use context::{Addressing, LoadContext, LoadTables};
pub use memory::{AlignedBuffer, ArenaBuffer, ArenaMemory, DryRun};
