#[cfg(not(loom))]
pub(crate) mod export {
  pub(crate) mod alloc {
    pub(crate) use std::alloc::Layout;
    pub(crate) use std::alloc::alloc;
    pub(crate) use std::alloc::dealloc;
  }

  pub(crate) mod sync {
    pub(crate) mod atomic {
      pub(crate) use std::sync::atomic::AtomicUsize;
      pub(crate) use std::sync::atomic::Ordering;
      pub(crate) use std::sync::atomic::fence;
    }
  }
}

#[cfg(loom)]
pub(crate) mod export {
  pub(crate) mod alloc {
    pub(crate) use loom::alloc::Layout;
    pub(crate) use loom::alloc::alloc;
    pub(crate) use loom::alloc::dealloc;
  }

  pub(crate) mod sync {
    pub(crate) mod atomic {
      pub(crate) use loom::sync::atomic::AtomicUsize;
      pub(crate) use loom::sync::atomic::Ordering;
      pub(crate) use loom::sync::atomic::fence;
    }
  }
}

#[doc(inline)]
pub(crate) use self::export::*;
