//! Purpose: Segment storage primitives: a length-framed append-only store and a memory-mapped offset index.
//! Exports: `api` (store, index, errors, validation).
//! Role: Library backing the `framelog` CLI and any segment layer built on top.
//! Invariants: All on-disk integers are big-endian; frames are `[u64 len][payload]`, entries `[u32 off][u64 pos]`.
//! Invariants: Store and Index each serialize their operations behind one exclusive lock.
pub mod api;
mod core;
