//! Support primitives shared by the rest of the workspace: a hybrid
//! read/write lock, a blocking ring buffer, a generational slot array, an
//! open-addressing hash map, and the reader-side RCU wrapper used by the
//! physical memory map.

pub mod array;
pub mod hashmap;
pub mod rcu;
pub mod ring;
pub mod rwlock;

pub use array::{Handle, SlotArray};
pub use hashmap::OpenHashMap;
pub use rcu::Rcu;
pub use ring::RingBuffer;
pub use rwlock::HybridRwLock;
