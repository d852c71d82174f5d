//! Host-side object lifetime management.
//!
//! One [`HostObjectManager`] exists per non-trivial bound class. It owns a
//! fixed-block memory pool sized for the class, the mapping from host pointer
//! to the script wrapper, and the destructor dispatch. The script engine is
//! notified nothing: instead, the wrapper's native payload ([`HostObject`])
//! runs its `Drop` when QuickJS collects the wrapper, and that drop is the GC
//! listener that returns the block to the pool.

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::mem;
use std::ptr::{self, NonNull};
use std::rc::Rc;

use quickbind_reflect::{NativeFunction, TypeRef};
use rquickjs::class::Trace;
use rquickjs::class::Class;
use rquickjs::{Ctx, Exception, IntoJs, JsLifetime, Object, Value};
use tracing::{error, warn};

/// Distinguished sentinel stored in a destroyed wrapper's pointer slot.
/// Never a valid allocation address.
pub const TOMBSTONE: *mut u8 = usize::MAX as *mut u8;

const BLOCKS_PER_CHUNK: usize = 256;

/// Fixed-block pool backing one bound class.
struct BlockPool {
    block_layout: Layout,
    chunks: Vec<(NonNull<u8>, Layout)>,
    free: Vec<NonNull<u8>>,
    allocs: u64,
    frees: u64,
}

impl BlockPool {
    fn new(size: usize, align: usize) -> Self {
        let size = size.max(1);
        let align = align.max(1);
        // Blocks are laid out back to back inside a chunk, so round the
        // stride up to the alignment.
        let stride = size.div_ceil(align) * align;
        Self {
            block_layout: Layout::from_size_align(stride, align).expect("bad block layout"),
            chunks: Vec::new(),
            free: Vec::new(),
            allocs: 0,
            frees: 0,
        }
    }

    fn grow(&mut self) {
        let stride = self.block_layout.size();
        let layout = Layout::from_size_align(stride * BLOCKS_PER_CHUNK, self.block_layout.align())
            .expect("bad chunk layout");
        let base = unsafe { alloc::alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            alloc::handle_alloc_error(layout);
        };
        self.chunks.push((base, layout));
        for i in (0..BLOCKS_PER_CHUNK).rev() {
            self.free.push(unsafe { NonNull::new_unchecked(base.as_ptr().add(i * stride)) });
        }
    }

    fn alloc(&mut self) -> *mut u8 {
        if self.free.is_empty() {
            self.grow();
        }
        self.allocs += 1;
        self.free.pop().expect("pool grow failed").as_ptr()
    }

    fn free(&mut self, ptr: *mut u8) {
        self.frees += 1;
        if let Some(ptr) = NonNull::new(ptr) {
            self.free.push(ptr);
        }
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        for (base, layout) in self.chunks.drain(..) {
            unsafe { alloc::dealloc(base.as_ptr(), layout) };
        }
    }
}

/// Non-owning reference to a script object. The wrapper must remain
/// collectable while mapped, so the map must not hold a strong engine
/// reference; entries are removed from [`HostObjectManager::free`] before the
/// wrapper's storage can go away, which keeps every stored value reachable
/// when it is read back.
struct WeakScriptRef {
    raw: rquickjs::qjs::JSValue,
}

impl WeakScriptRef {
    fn new(obj: &Object<'_>) -> Self {
        Self { raw: obj.as_value().as_raw() }
    }

    fn get<'js>(&self, ctx: &Ctx<'js>) -> Option<Object<'js>> {
        // SAFETY: the manager removes this entry before the referenced
        // object can be finalized, so `raw` refers to a live value. The
        // reconstructed handle is cloned (which takes a new reference) and
        // the borrowed original is forgotten so the stored reference count
        // is left untouched.
        unsafe {
            let borrowed = Value::from_raw(ctx.clone(), self.raw);
            let kept = borrowed.clone();
            mem::forget(borrowed);
            kept.into_object()
        }
    }
}

enum WrapperSlot {
    /// Reserved by `preemptive_alloc`; no wrapper bound yet.
    Empty,
    Bound(WeakScriptRef),
}

/// Pool, pointer map and destructor dispatch for one non-trivial class.
pub struct HostObjectManager {
    ty: TypeRef,
    dtor: Option<Rc<NativeFunction>>,
    pool: RefCell<BlockPool>,
    live: RefCell<HashMap<usize, WrapperSlot>>,
}

/// Allocation counters, exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub allocs: u64,
    pub frees: u64,
    pub live: usize,
}

impl HostObjectManager {
    pub fn new(ty: TypeRef) -> Rc<Self> {
        let dtor = ty.destructor();
        let pool = BlockPool::new(ty.size(), ty.align());
        Rc::new(Self {
            ty,
            dtor,
            pool: RefCell::new(pool),
            live: RefCell::new(HashMap::new()),
        })
    }

    pub fn ty(&self) -> &TypeRef {
        &self.ty
    }

    /// Reserves a block and binds the given wrapper to it.
    pub fn alloc(self: &Rc<Self>, target: &Object<'_>) -> *mut u8 {
        let ptr = self.pool.borrow_mut().alloc();
        self.live
            .borrow_mut()
            .insert(ptr as usize, WrapperSlot::Bound(WeakScriptRef::new(target)));
        self.attach(target, ptr);
        ptr
    }

    /// Reserves a block with no wrapper; the wrapper is bound later with
    /// [`assign_target`](Self::assign_target).
    pub fn preemptive_alloc(&self) -> *mut u8 {
        let ptr = self.pool.borrow_mut().alloc();
        self.live.borrow_mut().insert(ptr as usize, WrapperSlot::Empty);
        ptr
    }

    /// Binds a wrapper to a previously reserved block.
    pub fn assign_target(self: &Rc<Self>, ptr: *mut u8, target: &Object<'_>) {
        let mut live = self.live.borrow_mut();
        match live.get_mut(&(ptr as usize)) {
            None => {
                error!(
                    ty = self.ty.name(),
                    "attempted to assign a wrapper to a block this manager does not own"
                );
            }
            Some(slot @ WrapperSlot::Empty) => {
                *slot = WrapperSlot::Bound(WeakScriptRef::new(target));
                drop(live);
                self.attach(target, ptr);
            }
            Some(WrapperSlot::Bound(_)) => {
                error!(
                    ty = self.ty.name(),
                    "attempted to assign a wrapper to a block that already has one"
                );
            }
        }
    }

    /// Makes the wrapper's payload responsible for freeing `ptr` when the
    /// engine collects it. A constructor-made wrapper gets its pointer slot
    /// filled here.
    fn attach(self: &Rc<Self>, target: &Object<'_>, ptr: *mut u8) {
        if let Some(class) = Class::<HostObject>::from_object(target) {
            let payload = class.borrow();
            if payload.ptr().is_null() {
                payload.set_ptr(ptr);
            } else {
                debug_assert_eq!(payload.ptr(), ptr);
            }
            payload.bind_manager(self.clone());
        } else {
            error!(ty = self.ty.name(), "wrapper object is missing its native payload");
        }
    }

    /// Unmaps a block and returns it to the pool without running the
    /// destructor. For blocks whose construction never happened (argument
    /// conversion failed after a preemptive allocation).
    pub fn abandon(&self, ptr: *mut u8) {
        if self.live.borrow_mut().remove(&(ptr as usize)).is_none() {
            return;
        }
        self.pool.borrow_mut().free(ptr);
    }

    /// Runs the destructor (if any) and returns the block to the pool.
    /// Double frees and foreign pointers are logged, never fatal.
    pub fn free(&self, ptr: *mut u8) {
        if self.live.borrow_mut().remove(&(ptr as usize)).is_none() {
            error!(
                ty = self.ty.name(),
                "attempted to free a block this manager does not own"
            );
            return;
        }

        if let Some(dtor) = &self.dtor {
            let mut this = ptr;
            let slot = (&mut this as *mut *mut u8).cast::<u8>();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                dtor.call(ptr::null_mut(), &[slot]);
            }));
            if outcome.is_err() {
                error!(ty = self.ty.name(), "destructor failed; block released anyway");
            }
        } else if !self.ty.is_trivially_destructible() {
            warn!(
                ty = self.ty.name(),
                "non-trivially destructible type has no registered destructor"
            );
        }

        self.pool.borrow_mut().free(ptr);
    }

    /// Returns the wrapper already bound to `ptr`, if any, so the same host
    /// object never gets two wrappers.
    pub fn get_target_if_mapped<'js>(&self, ctx: &Ctx<'js>, ptr: *mut u8) -> Option<Object<'js>> {
        match self.live.borrow().get(&(ptr as usize)) {
            None => None,
            // Reserved but not yet bound: the caller is about to wrap it.
            Some(WrapperSlot::Empty) => None,
            Some(WrapperSlot::Bound(weak)) => weak.get(ctx),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.borrow().len()
    }

    pub fn live_mem_size(&self) -> usize {
        self.live.borrow().len() * self.ty.size()
    }

    pub fn stats(&self) -> PoolStats {
        let pool = self.pool.borrow();
        PoolStats { allocs: pool.allocs, frees: pool.frees, live: self.live.borrow().len() }
    }
}

impl Drop for HostObjectManager {
    fn drop(&mut self) {
        // Anything still live at shutdown gets its destructor; the blocks go
        // down with the pool.
        let live = self.live.borrow_mut();
        if let Some(dtor) = &self.dtor {
            for (&addr, slot) in live.iter() {
                if matches!(slot, WrapperSlot::Empty) {
                    warn!(
                        ty = self.ty.name(),
                        "allocation with no wrapper at shutdown; preemptive_alloc without assign_target?"
                    );
                }
                let mut this = addr as *mut u8;
                let this_slot = (&mut this as *mut *mut u8).cast::<u8>();
                dtor.call(ptr::null_mut(), &[this_slot]);
            }
        }
    }
}

/// The native payload of every bound-class wrapper: the three hidden slots
/// (host pointer, type descriptor, externally-owned flag), plus the manager
/// reference that makes GC return the block.
#[rquickjs::class(rename = "NativeObject")]
#[derive(Trace, JsLifetime)]
pub struct HostObject {
    #[qjs(skip_trace)]
    ptr: Cell<*mut u8>,
    #[qjs(skip_trace)]
    ty: TypeRef,
    #[qjs(skip_trace)]
    external: Cell<bool>,
    #[qjs(skip_trace)]
    manager: RefCell<Option<Rc<HostObjectManager>>>,
}

impl HostObject {
    pub fn new(ptr: *mut u8, ty: TypeRef, external: bool) -> Self {
        Self {
            ptr: Cell::new(ptr),
            ty,
            external: Cell::new(external),
            manager: RefCell::new(None),
        }
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.get()
    }

    pub fn set_ptr(&self, ptr: *mut u8) {
        self.ptr.set(ptr);
    }

    pub fn ty(&self) -> &TypeRef {
        &self.ty
    }

    pub fn is_externally_owned(&self) -> bool {
        self.external.get()
    }

    pub fn is_destroyed(&self) -> bool {
        self.ptr.get() == TOMBSTONE
    }

    /// Tombstones the pointer slot, so later uses fail cleanly.
    pub fn mark_destroyed(&self) {
        self.ptr.set(TOMBSTONE);
    }

    pub fn manager(&self) -> Option<Rc<HostObjectManager>> {
        self.manager.borrow().clone()
    }

    fn bind_manager(&self, manager: Rc<HostObjectManager>) {
        *self.manager.borrow_mut() = Some(manager);
    }
}

impl Drop for HostObject {
    fn drop(&mut self) {
        // This is the GC listener: the engine collected the wrapper.
        // Explicitly destroyed wrappers already tombstoned themselves and
        // freed the block through the other entry point.
        if let Some(manager) = self.manager.borrow_mut().take() {
            let ptr = self.ptr.get();
            if ptr != TOMBSTONE && !ptr.is_null() {
                manager.free(ptr);
            }
        }
    }
}

/// Extracts the native payload from a script value, if it is a wrapper.
pub fn wrapper_of<'js>(value: &Value<'js>) -> Option<Class<'js, HostObject>> {
    let obj = value.as_object()?;
    Class::<HostObject>::from_object(obj)
}

/// Creates a wrapper around an existing host pointer without transferring
/// ownership to the pool ("externally owned" unless a manager later binds
/// it). The per-type prototype must already be built.
pub fn instantiate_wrapper<'js>(
    ctx: &Ctx<'js>,
    ty: &TypeRef,
    ptr: *mut u8,
    external: bool,
) -> rquickjs::Result<Object<'js>> {
    let data = crate::bridge::data(ty);
    let Some(proto) = data.prototype(ctx)? else {
        return Err(Exception::throw_type(
            ctx,
            &format!("type '{}' has not been bound to the script context", ty.name()),
        ));
    };
    let instance = Class::instance(ctx.clone(), HostObject::new(ptr, ty.clone(), external))?;
    let value = instance.into_js(ctx)?;
    let Some(obj) = value.into_object() else {
        return Err(Exception::throw_internal(ctx, "wrapper instance is not an object"));
    };
    obj.set_prototype(Some(&proto))?;
    Ok(obj)
}
