//! Raw access to foreign memory. Every function here trusts its pointer
//! argument; callers hold the scope or foreign allocation it points into.

use std::ptr;

use crate::{AbiScalar, Scalar};

/// # Safety
/// `src` must be readable for `kind.size()` bytes.
pub unsafe fn read_scalar(kind: AbiScalar, src: *const u8) -> Scalar {
    // SAFETY: forwarded to the caller; unaligned reads tolerate packed arrays
    unsafe {
        match kind {
            AbiScalar::I8 => Scalar::I8(ptr::read_unaligned(src.cast())),
            AbiScalar::U8 => Scalar::U8(ptr::read_unaligned(src)),
            AbiScalar::I16 => Scalar::I16(ptr::read_unaligned(src.cast())),
            AbiScalar::U16 => Scalar::U16(ptr::read_unaligned(src.cast())),
            AbiScalar::I32 => Scalar::I32(ptr::read_unaligned(src.cast())),
            AbiScalar::U32 => Scalar::U32(ptr::read_unaligned(src.cast())),
            AbiScalar::I64 => Scalar::I64(ptr::read_unaligned(src.cast())),
            AbiScalar::U64 => Scalar::U64(ptr::read_unaligned(src.cast())),
            AbiScalar::F32 => Scalar::F32(ptr::read_unaligned(src.cast())),
            AbiScalar::F64 => Scalar::F64(ptr::read_unaligned(src.cast())),
            AbiScalar::Pointer => {
                Scalar::Pointer(ptr::read_unaligned(src.cast()))
            }
        }
    }
}

/// # Safety
/// `dst` must be writable for `value.kind().size()` bytes.
pub unsafe fn write_scalar(value: Scalar, dst: *mut u8) {
    // SAFETY: forwarded to the caller
    unsafe {
        match value {
            Scalar::I8(v) => ptr::write_unaligned(dst.cast(), v),
            Scalar::U8(v) => ptr::write_unaligned(dst, v),
            Scalar::I16(v) => ptr::write_unaligned(dst.cast(), v),
            Scalar::U16(v) => ptr::write_unaligned(dst.cast(), v),
            Scalar::I32(v) => ptr::write_unaligned(dst.cast(), v),
            Scalar::U32(v) => ptr::write_unaligned(dst.cast(), v),
            Scalar::I64(v) => ptr::write_unaligned(dst.cast(), v),
            Scalar::U64(v) => ptr::write_unaligned(dst.cast(), v),
            Scalar::F32(v) => ptr::write_unaligned(dst.cast(), v),
            Scalar::F64(v) => ptr::write_unaligned(dst.cast(), v),
            Scalar::Pointer(v) => ptr::write_unaligned(dst.cast(), v),
        }
    }
}

/// Bytes of a NUL-terminated string, without the terminator.
///
/// # Safety
/// `src` must point at a NUL-terminated byte sequence that outlives `'a`.
pub unsafe fn read_c_string<'a>(src: *const u8) -> &'a [u8] {
    // SAFETY: forwarded to the caller
    unsafe {
        let len = libc::strlen(src.cast());
        std::slice::from_raw_parts(src, len)
    }
}

/// # Safety
/// `dst` must be writable for `bytes.len()` bytes and not overlap `bytes`.
pub unsafe fn write_bytes(bytes: &[u8], dst: *mut u8) {
    // SAFETY: forwarded to the caller
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
}
