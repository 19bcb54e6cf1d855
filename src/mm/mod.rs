//! Memory management: the static page pool and the translation tables built
//! from it.

mod paging;
mod pool;

pub use paging::{HypStage1, PageTable, PageTableFormat, Stage2};
pub use pool::{Frame, PagePool};

#[cfg(test)]
pub(crate) use pool::test_pool;
