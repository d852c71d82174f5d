//! Per-call scoped arena.
//!
//! Marshalling frequently needs storage whose lifetime matches a single
//! script-to-native call: argument values, temporary strings, array backing.
//! The arena owns those allocations, runs the registered destructor of each
//! non-trivially-destructible one when the call ends, and releases every
//! callback trampoline registered during the call.
//!
//! The "next allocation" override lets a recursive marshaller redirect the
//! next allocation into caller-provided storage (a struct field, an array
//! element) instead of a fresh buffer, so nested values are written in place
//! with no extra copy.

use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::ptr::{self, NonNull};

use quickbind_reflect::TypeRef;
use rquickjs::Ctx;

use crate::bridge::callbacks;

struct Allocation {
    ty: TypeRef,
    ptr: NonNull<u8>,
    layout: Layout,
}

/// The lifetime-free part of a call context. Asynchronous call proxies move
/// the arena into the job so argument storage survives until the completion
/// drain; everything else goes through [`CallContext`].
#[derive(Default)]
pub struct CallArena {
    allocations: Vec<Allocation>,
    callbacks: Vec<*const c_void>,
    next_target: Option<NonNull<u8>>,
    did_allocate: bool,
}

impl CallArena {
    /// Allocates storage for one value of `ty`, honouring a pending
    /// allocation target.
    pub fn alloc(&mut self, ty: &TypeRef) -> *mut u8 {
        if let Some(target) = self.next_target.take() {
            return target.as_ptr();
        }
        if ty.size() == 0 {
            return NonNull::<u8>::dangling().as_ptr();
        }
        let layout = Layout::from_size_align(ty.size(), ty.align()).expect("bad type layout");
        let ptr = unsafe { alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };
        self.allocations.push(Allocation { ty: ty.clone(), ptr, layout });
        self.did_allocate = true;
        ptr.as_ptr()
    }

    /// Directs the next `alloc` call at caller-provided storage.
    pub fn set_next_allocation(&mut self, target: *mut u8) {
        self.next_target = NonNull::new(target);
    }

    pub fn clear_next_allocation(&mut self) {
        self.next_target = None;
    }

    /// `true` while an allocation target is pending.
    pub fn has_allocation_target(&self) -> bool {
        self.next_target.is_some()
    }

    /// `true` if any real (arena-owned) allocation happened. Marshallers
    /// that allocate here cannot be used to produce long-lived values.
    pub fn did_allocate(&self) -> bool {
        self.did_allocate
    }

    /// Retains a callback trampoline until the call ends.
    pub fn add_callback(&mut self, trampoline: *const c_void) {
        self.callbacks.push(trampoline);
    }
}

impl Drop for CallArena {
    fn drop(&mut self) {
        for allocation in self.allocations.drain(..) {
            if !allocation.ty.is_trivially_destructible() {
                if let Some(dtor) = allocation.ty.destructor() {
                    let mut this: *mut u8 = allocation.ptr.as_ptr();
                    let slot = (&mut this as *mut *mut u8).cast::<u8>();
                    dtor.call(ptr::null_mut(), &[slot]);
                }
            }
            unsafe { alloc::dealloc(allocation.ptr.as_ptr(), allocation.layout) };
        }
        for trampoline in self.callbacks.drain(..) {
            callbacks::release(trampoline);
        }
    }
}

/// The full call context: the engine context plus the arena. Lives for one
/// synchronous call, or is split apart for an asynchronous one.
pub struct CallContext<'js> {
    pub ctx: Ctx<'js>,
    pub arena: CallArena,
}

impl<'js> CallContext<'js> {
    pub fn new(ctx: Ctx<'js>) -> Self {
        Self { ctx, arena: CallArena::default() }
    }

    /// Rebuilds a context around an arena carried across an asynchronous
    /// suspension.
    pub fn resume(ctx: Ctx<'js>, arena: CallArena) -> Self {
        Self { ctx, arena }
    }

    /// Splits the arena off, leaving destruction to the new owner.
    pub fn into_arena(self) -> CallArena {
        self.arena
    }

    pub fn alloc(&mut self, ty: &TypeRef) -> *mut u8 {
        self.arena.alloc(ty)
    }

    pub fn set_next_allocation(&mut self, target: *mut u8) {
        self.arena.set_next_allocation(target);
    }

    pub fn has_allocation_target(&self) -> bool {
        self.arena.has_allocation_target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickbind_reflect::Registry;

    #[test]
    fn alloc_prefers_the_override_slot() {
        let reg = Registry::new();
        let mut arena = CallArena::default();
        let mut target = 0u32;

        arena.set_next_allocation((&mut target as *mut u32).cast());
        assert!(arena.has_allocation_target());
        let ptr = arena.alloc(&reg.u32_type());
        assert_eq!(ptr, (&mut target as *mut u32).cast());
        assert!(!arena.has_allocation_target());
        assert!(!arena.did_allocate());

        let fresh = arena.alloc(&reg.u32_type());
        assert_ne!(fresh, ptr);
        assert!(arena.did_allocate());
    }

    #[test]
    fn drop_runs_registered_destructors() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Probe(Arc<AtomicUsize>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let reg = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let ty = reg
            .class_of::<Probe>("Probe")
            .unwrap()
            .destructible::<Probe>()
            .finish();

        {
            let mut arena = CallArena::default();
            let ptr = arena.alloc(&ty);
            unsafe { std::ptr::write(ptr.cast::<Probe>(), Probe(hits.clone())) };
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
