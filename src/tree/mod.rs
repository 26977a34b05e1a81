mod arena;
mod cache;
mod queue;

pub(crate) use arena::{Arena, DirNode, NO_HEAP_INDEX, NodeId};
pub(crate) use cache::FdCache;
pub(crate) use queue::{QueueOrder, VisitQueue};
