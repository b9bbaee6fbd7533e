//! Memory management: caller-supplied regions, the dynamic memory pool and
//! the partition pool.
//!
//! Both pools keep their bookkeeping headers inside the pooled memory itself
//! and share the kernel's suspension protocol with every other blocking
//! object.

pub(crate) mod dynamic;
pub(crate) mod partition;
pub mod region;
pub(crate) mod slab;

pub use dynamic::{MemoryPoolInfo, OVERHEAD as MEMORY_OVERHEAD};
pub use partition::{PartitionPoolInfo, OVERHEAD as PARTITION_OVERHEAD};
pub use region::{Region, GRANULE};

use slab::slab_id;

slab_id!(
    /// Identity of a dynamic memory pool.
    MemoryPoolId
);

slab_id!(
    /// Identity of a partition pool.
    PartitionPoolId
);
