// Core modules implementing the frame store, the offset index and error modeling.
pub mod encoding;
pub mod error;
pub mod index;
mod lock;
pub mod store;
