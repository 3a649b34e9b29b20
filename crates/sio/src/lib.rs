#![forbid(unsafe_code)]
//! Public API facade.
//!
//! Re-exports the scheduler, allocator, block, tree and journal crates
//! under one namespace. The CLI and downstream users depend on this crate.

pub use sio_error::{Result, SioError};
pub use sio_types::{
    BlockNumber, CommitId, KeyPriority, ObjectIdentifier, OpId, Priority, StreamId,
};

pub mod sched {
    pub use sio_sched::*;
}

pub mod allocator {
    pub use sio_alloc::*;
}

pub mod block {
    pub use sio_block::*;
}

pub mod btree {
    pub use sio_btree::*;
}

pub mod journal {
    pub use sio_journal::*;
}
