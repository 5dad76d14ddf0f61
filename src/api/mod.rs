//! Purpose: Define the stable public Rust API boundary for framelog.
//! Exports: `Store`, `Index`, their options, entry/append values, errors and validation.
//! Role: Public, additive-only surface used by the CLI and by segment implementations.
//! Invariants: This module is the only public path to storage primitives.
//! Invariants: On-disk widths and byte order are constants, never runtime settings.

mod validation;

pub use crate::core::encoding::{ENT_WIDTH, IndexEntry, LAST_ENTRY, LEN_WIDTH, OFF_WIDTH, POS_WIDTH};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::index::{DEFAULT_MAX_INDEX_BYTES, Index, IndexOptions};
pub use crate::core::store::{Appended, DEFAULT_BUFFER_CAPACITY, Store, StoreOptions};
pub use validation::{ValidationIssue, ValidationReport, ValidationStatus, validate};
