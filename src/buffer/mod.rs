//! Byte buffers that cross realm boundaries.
//!
//! # Contents
//!
//! - [`BackingStore`]: Owned raw storage, movable between threads
//! - [`ArrayBuffer`]: Realm-local buffer, transferable by detaching
//! - [`SharedArrayBuffer`]: Realm-local view of shareable memory
//! - [`SharedSegment`]: Refcounted reference to shared memory

mod array_buffer;
mod backing;
mod segment;
mod shared;

pub use self::array_buffer::ArrayBuffer;
pub use self::backing::BackingStore;
pub use self::segment::SharedSegment;
pub use self::shared::SharedArrayBuffer;
