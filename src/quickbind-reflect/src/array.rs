use std::alloc::{self, Layout};
use std::mem::{align_of, size_of};
use std::ptr;
use std::sync::Arc;

use crate::function::RawFn;

/// Host-side representation of a bound array value: a heap backing store
/// plus length. The layout is fixed so the bridge can address elements with
/// nothing but the element size.
#[repr(C)]
pub struct HostArray {
    data: *mut u8,
    len: usize,
    cap: usize,
}

impl HostArray {
    /// Constructs an array of `len` uninitialised elements directly into
    /// `place`, which must be valid storage for a `HostArray`.
    ///
    /// # Safety
    /// `place` must be writable `HostArray` storage; the caller must
    /// initialise every element before the array is dropped through the
    /// registered destructor.
    pub unsafe fn construct_in(place: *mut u8, len: usize, elem_size: usize, elem_align: usize) -> *mut u8 {
        let data = if len == 0 || elem_size == 0 {
            ptr::null_mut()
        } else {
            let layout = Layout::from_size_align(elem_size * len, elem_align.max(1))
                .expect("array layout overflow");
            unsafe { alloc::alloc(layout) }
        };
        unsafe {
            ptr::write(place.cast::<HostArray>(), HostArray { data, len, cap: len });
        }
        data
    }

    /// Builds an array from an owned `Vec`, taking ownership of the elements.
    pub fn from_vec<T>(values: Vec<T>) -> Self {
        let len = values.len();
        if len == 0 || size_of::<T>() == 0 {
            return Self { data: ptr::null_mut(), len, cap: len };
        }
        let layout = Layout::array::<T>(len).expect("array layout overflow");
        let data = unsafe { alloc::alloc(layout) };
        let dst = data.cast::<T>();
        for (i, value) in values.into_iter().enumerate() {
            unsafe { ptr::write(dst.add(i), value) };
        }
        Self { data, len, cap: len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn data(&self) -> *mut u8 {
        self.data
    }

    /// Shrinks the logical length without touching storage. Used when
    /// element construction fails part-way so teardown only visits
    /// initialised elements.
    ///
    /// # Safety
    /// `len` must not exceed the number of initialised elements.
    pub unsafe fn set_len(&mut self, len: usize) {
        self.len = len;
    }

    /// Pointer to element `i` given the element size.
    ///
    /// # Safety
    /// `i` must be below `len()` and `elem_size` must match the bound
    /// element type.
    pub unsafe fn elem_ptr(&self, i: usize, elem_size: usize) -> *mut u8 {
        unsafe { self.data.add(i * elem_size) }
    }

    /// Views the backing store as a typed slice.
    ///
    /// # Safety
    /// `T` must be the bound element type and every element initialised.
    pub unsafe fn as_slice<T>(&self) -> &[T] {
        if self.data.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.data.cast::<T>(), self.len) }
        }
    }
}

/// Builds the destructor registered for an array type: runs the element
/// destructor over every element, then releases the backing store. Captures
/// only `Send + Sync` state so it satisfies the raw calling convention.
pub fn array_dtor(elem_size: usize, elem_align: usize, elem_dtor: Option<RawFn>) -> RawFn {
    Arc::new(move |_ret, args| unsafe {
        let this = *args[0].cast::<*mut HostArray>();
        let arr = &mut *this;
        if arr.data.is_null() {
            return;
        }
        if let Some(elem_dtor) = &elem_dtor {
            for i in 0..arr.len {
                let mut elem: *mut u8 = arr.data.add(i * elem_size);
                let slot = (&mut elem as *mut *mut u8).cast::<u8>();
                elem_dtor(ptr::null_mut(), &[slot]);
            }
        }
        let layout = Layout::from_size_align(elem_size * arr.cap, elem_align.max(1))
            .expect("array layout overflow");
        alloc::dealloc(arr.data, layout);
        arr.data = ptr::null_mut();
        arr.len = 0;
        arr.cap = 0;
    })
}

/// Size and alignment of the array representation itself, used when
/// registering array types.
pub fn array_repr_layout() -> (usize, usize) {
    (size_of::<HostArray>(), align_of::<HostArray>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::dtor;

    #[test]
    fn from_vec_round_trips() {
        let mut arr = HostArray::from_vec(vec![1i32, 2, 3]);
        assert_eq!(unsafe { arr.as_slice::<i32>() }, &[1, 2, 3]);

        let raw = array_dtor(size_of::<i32>(), align_of::<i32>(), None);
        let mut this: *mut u8 = (&mut arr as *mut HostArray).cast();
        raw(ptr::null_mut(), &[(&mut this as *mut *mut u8).cast()]);
        assert!(arr.is_empty());
    }

    #[test]
    fn element_destructors_run() {
        let mut arr = HostArray::from_vec(vec![String::from("a"), String::from("b")]);
        let raw = array_dtor(size_of::<String>(), align_of::<String>(), Some(dtor::<String>()));
        let mut this: *mut u8 = (&mut arr as *mut HostArray).cast();
        raw(ptr::null_mut(), &[(&mut this as *mut *mut u8).cast()]);
        assert!(arr.is_empty());
    }
}
