use quickbind_reflect::{TypeFlags, TypeRef};
use rquickjs::{Exception, Value};

use crate::bridge::call_context::CallContext;
use crate::bridge::marshal::Marshal;

/// Numbers, booleans, enums and opaque handles. Conversion reads and writes
/// the exact stored width; script-bound integers widen to `f64`, host-bound
/// numbers truncate with Rust's saturating cast (NaN becomes zero).
pub struct PrimitiveMarshaller {
    ty: TypeRef,
    is_bool: bool,
}

impl PrimitiveMarshaller {
    pub fn new(ty: TypeRef, is_bool: bool) -> Self {
        Self { ty, is_bool }
    }

    fn is_opaque(&self) -> bool {
        self.ty.flags().contains(TypeFlags::OPAQUE)
    }

    fn is_unsigned(&self) -> bool {
        self.ty.flags().intersects(TypeFlags::UNSIGNED | TypeFlags::OPAQUE)
    }

    unsafe fn read_number(&self, ptr: *const u8) -> Option<f64> {
        let flags = self.ty.flags();
        let size = self.ty.size();
        unsafe {
            if flags.intersects(TypeFlags::INTEGRAL | TypeFlags::OPAQUE) {
                if self.is_unsigned() {
                    match size {
                        1 => Some(f64::from(ptr.cast::<u8>().read())),
                        2 => Some(f64::from(ptr.cast::<u16>().read())),
                        4 => Some(f64::from(ptr.cast::<u32>().read())),
                        8 => Some(ptr.cast::<u64>().read() as f64),
                        _ => None,
                    }
                } else {
                    match size {
                        1 => Some(f64::from(ptr.cast::<i8>().read())),
                        2 => Some(f64::from(ptr.cast::<i16>().read())),
                        4 => Some(f64::from(ptr.cast::<i32>().read())),
                        8 => Some(ptr.cast::<i64>().read() as f64),
                        _ => None,
                    }
                }
            } else if flags.contains(TypeFlags::FLOAT) {
                match size {
                    4 => Some(f64::from(ptr.cast::<f32>().read())),
                    8 => Some(ptr.cast::<f64>().read()),
                    _ => None,
                }
            } else {
                None
            }
        }
    }

    unsafe fn write_number(&self, ptr: *mut u8, num: f64) -> bool {
        let flags = self.ty.flags();
        let size = self.ty.size();
        unsafe {
            if flags.intersects(TypeFlags::INTEGRAL | TypeFlags::OPAQUE) {
                if self.is_unsigned() {
                    match size {
                        1 => ptr.cast::<u8>().write(num as u8),
                        2 => ptr.cast::<u16>().write(num as u16),
                        4 => ptr.cast::<u32>().write(num as u32),
                        8 => ptr.cast::<u64>().write(num as u64),
                        _ => return false,
                    }
                } else {
                    match size {
                        1 => ptr.cast::<i8>().write(num as i8),
                        2 => ptr.cast::<i16>().write(num as i16),
                        4 => ptr.cast::<i32>().write(num as i32),
                        8 => ptr.cast::<i64>().write(num as i64),
                        _ => return false,
                    }
                }
            } else if flags.contains(TypeFlags::FLOAT) {
                match size {
                    4 => ptr.cast::<f32>().write(num as f32),
                    8 => ptr.cast::<f64>().write(num),
                    _ => return false,
                }
            } else {
                return false;
            }
        }
        true
    }
}

impl Marshal for PrimitiveMarshaller {
    fn can_accept(&self, value: &Value<'_>) -> bool {
        if self.is_bool {
            return value.is_bool();
        }
        if self.is_opaque() && value.is_null() {
            return true;
        }
        value.is_number()
    }

    fn to_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        ptr: *mut u8,
        _needs_copy: bool,
        _is_host_return: bool,
    ) -> rquickjs::Result<Value<'js>> {
        let ctx = cx.ctx.clone();
        if self.ty.size() == 0 {
            return Ok(Value::new_undefined(ctx));
        }
        if self.is_bool {
            let v = unsafe { ptr.cast::<u8>().read() } != 0;
            return Ok(Value::new_bool(ctx, v));
        }
        match unsafe { self.read_number(ptr) } {
            Some(num) => Ok(Value::new_number(ctx, num)),
            None => Err(Exception::throw_type(
                &ctx,
                &format!("unsupported primitive layout for '{}'", self.ty.name()),
            )),
        }
    }

    fn from_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<*mut u8> {
        let ctx = cx.ctx.clone();
        if self.ty.size() == 0 {
            cx.arena.clear_next_allocation();
            return Ok(std::ptr::NonNull::<u8>::dangling().as_ptr());
        }
        let data = cx.alloc(&self.ty);

        if self.is_bool {
            let Some(v) = value.as_bool() else {
                return Err(Exception::throw_type(&ctx, "value is not a boolean"));
            };
            unsafe { data.cast::<u8>().write(u8::from(v)) };
            return Ok(data);
        }

        let num = if let Some(num) = value.as_number() {
            num
        } else if self.is_opaque() && value.is_null() {
            0.0
        } else if self.is_opaque() {
            return Err(Exception::throw_type(
                &ctx,
                &format!("value is not a valid {}", self.ty.name()),
            ));
        } else {
            return Err(Exception::throw_type(&ctx, "value is not a number"));
        };

        let num = if num.is_nan() { 0.0 } else { num };
        if unsafe { self.write_number(data, num) } {
            Ok(data)
        } else {
            Err(Exception::throw_type(
                &ctx,
                &format!("unsupported primitive layout for '{}'", self.ty.name()),
            ))
        }
    }
}
