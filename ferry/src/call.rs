use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;

use libffi::middle::{Cif, CodePtr, Type};
use libffi::raw;

use crate::{Buffer, Layout, NativeCallError, align_up};

thread_local! {
    static TLS_CIF_CACHE: RefCell<HashMap<CifCacheKey, Cif>> =
        RefCell::new(HashMap::new());
}

fn with_thread_local_cif<R, FBuild, FUse>(
    key: &CifCacheKey,
    build: FBuild,
    use_cif: FUse,
) -> R
where
    FBuild: FnOnce() -> Cif,
    FUse: FnOnce(&Cif) -> R,
{
    TLS_CIF_CACHE.with(|cache| {
        let mut map = cache.borrow_mut();
        if !map.contains_key(key) {
            map.insert(key.clone(), build());
        }
        use_cif(&map[key])
    })
}

/// Calls that share a function and a signature share one CIF per thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CifCacheKey {
    code: usize,
    descriptor: CallDescriptor,
}

/// Fixed-width machine scalar as seen by the calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiScalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Pointer,
}

impl AbiScalar {
    pub fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::Pointer => size_of::<usize>(),
        }
    }

    fn ffi_type(self) -> Type {
        match self {
            Self::I8 => Type::i8(),
            Self::U8 => Type::u8(),
            Self::I16 => Type::i16(),
            Self::U16 => Type::u16(),
            Self::I32 => Type::i32(),
            Self::U32 => Type::u32(),
            Self::I64 => Type::i64(),
            Self::U64 => Type::u64(),
            Self::F32 => Type::f32(),
            Self::F64 => Type::f64(),
            Self::Pointer => Type::pointer(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AbiType {
    Scalar(AbiScalar),
    /// Passed and returned by value; `elements` are the members in order.
    Aggregate {
        layout: Layout,
        elements: Vec<AbiType>,
    },
}

impl AbiType {
    fn ffi_type(&self) -> Type {
        match self {
            AbiType::Scalar(scalar) => scalar.ffi_type(),
            AbiType::Aggregate { elements, .. } => {
                Type::structure(elements.iter().map(AbiType::ffi_type))
            }
        }
    }
}

/// Machine-level signature of one foreign function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallDescriptor {
    pub params: Vec<AbiType>,
    /// `None` for void.
    pub ret: Option<AbiType>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(usize),
}

impl Scalar {
    pub fn kind(&self) -> AbiScalar {
        match self {
            Scalar::I8(_) => AbiScalar::I8,
            Scalar::U8(_) => AbiScalar::U8,
            Scalar::I16(_) => AbiScalar::I16,
            Scalar::U16(_) => AbiScalar::U16,
            Scalar::I32(_) => AbiScalar::I32,
            Scalar::U32(_) => AbiScalar::U32,
            Scalar::I64(_) => AbiScalar::I64,
            Scalar::U64(_) => AbiScalar::U64,
            Scalar::F32(_) => AbiScalar::F32,
            Scalar::F64(_) => AbiScalar::F64,
            Scalar::Pointer(_) => AbiScalar::Pointer,
        }
    }

    fn as_arg_ptr(&self) -> *mut c_void {
        match self {
            Scalar::I8(v) => v as *const _ as *mut c_void,
            Scalar::U8(v) => v as *const _ as *mut c_void,
            Scalar::I16(v) => v as *const _ as *mut c_void,
            Scalar::U16(v) => v as *const _ as *mut c_void,
            Scalar::I32(v) => v as *const _ as *mut c_void,
            Scalar::U32(v) => v as *const _ as *mut c_void,
            Scalar::I64(v) => v as *const _ as *mut c_void,
            Scalar::U64(v) => v as *const _ as *mut c_void,
            Scalar::F32(v) => v as *const _ as *mut c_void,
            Scalar::F64(v) => v as *const _ as *mut c_void,
            Scalar::Pointer(v) => v as *const _ as *mut c_void,
        }
    }
}

/// A marshalled argument or a raw result.
///
/// `Address` is either a pointer argument or, for by-value aggregates, the
/// location of the aggregate's bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForeignValue {
    Void,
    Scalar(Scalar),
    Address(usize),
}

/// Entry point of a foreign function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeAddress(usize);

impl CodeAddress {
    pub fn new(address: usize) -> Self {
        Self(address)
    }

    pub fn address(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

pub trait CallPrimitive: Send + Sync {
    fn prepare(
        &self,
        code: CodeAddress,
        descriptor: &CallDescriptor,
    ) -> Result<Box<dyn BoundCall>, NativeCallError>;
}

/// A foreign function bound to its machine signature.
pub trait BoundCall: Send + Sync {
    /// Bytes the caller must supply for an aggregate return value.
    fn return_capacity(&self) -> Option<usize>;

    /// # Safety
    /// The bound function must really have the prepared signature, and every
    /// address in `args` must be valid for what the callee does with it.
    unsafe fn invoke(
        &self,
        args: &[ForeignValue],
        ret: Option<Buffer>,
    ) -> Result<ForeignValue, NativeCallError>;
}

/// [`CallPrimitive`] backed by libffi.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibffiCaller;

impl CallPrimitive for LibffiCaller {
    fn prepare(
        &self,
        code: CodeAddress,
        descriptor: &CallDescriptor,
    ) -> Result<Box<dyn BoundCall>, NativeCallError> {
        if code.is_null() {
            return Err(NativeCallError::NullFunction {
                symbol: format!("{:#x}", code.address()),
            });
        }
        let key = CifCacheKey {
            code: code.address(),
            descriptor: descriptor.clone(),
        };
        let return_capacity = match &descriptor.ret {
            Some(AbiType::Aggregate { layout, .. }) => {
                let ffi_size = with_thread_local_cif(
                    &key,
                    || build_cif(descriptor),
                    // SAFETY: the cif was prepared, so rtype is initialized
                    |cif| unsafe { (*(*cif.as_raw_ptr()).rtype).size },
                );
                let size = (layout.size as usize).max(ffi_size);
                Some(align_up(size as u64, 16) as usize)
            }
            _ => None,
        };
        Ok(Box::new(PreparedCall {
            code,
            key,
            return_capacity,
        }))
    }
}

fn build_cif(descriptor: &CallDescriptor) -> Cif {
    Cif::new(
        descriptor.params.iter().map(AbiType::ffi_type),
        descriptor
            .ret
            .as_ref()
            .map_or_else(Type::void, AbiType::ffi_type),
    )
}

#[derive(Debug)]
struct PreparedCall {
    code: CodeAddress,
    key: CifCacheKey,
    return_capacity: Option<usize>,
}

impl PreparedCall {
    fn scalar_args(
        &self,
        args: &[ForeignValue],
    ) -> Result<Vec<Option<Scalar>>, NativeCallError> {
        let mismatch = |index: usize, expected: &AbiType| {
            NativeCallError::ArgumentMismatch {
                index,
                expected: format!("{expected:?}"),
            }
        };
        self.key
            .descriptor
            .params
            .iter()
            .zip(args)
            .enumerate()
            .map(|(index, (param, arg))| match (param, arg) {
                (AbiType::Scalar(kind), ForeignValue::Scalar(scalar))
                    if scalar.kind() == *kind =>
                {
                    Ok(Some(*scalar))
                }
                (
                    AbiType::Scalar(AbiScalar::Pointer),
                    ForeignValue::Address(address),
                ) => Ok(Some(Scalar::Pointer(*address))),
                (AbiType::Aggregate { .. }, ForeignValue::Address(address))
                    if *address != 0 =>
                {
                    Ok(None)
                }
                _ => Err(mismatch(index, param)),
            })
            .collect()
    }
}

impl BoundCall for PreparedCall {
    fn return_capacity(&self) -> Option<usize> {
        self.return_capacity
    }

    unsafe fn invoke(
        &self,
        args: &[ForeignValue],
        ret: Option<Buffer>,
    ) -> Result<ForeignValue, NativeCallError> {
        if args.len() != self.key.descriptor.params.len() {
            return Err(NativeCallError::ArityMismatch {
                expected: self.key.descriptor.params.len(),
                got: args.len(),
            });
        }
        let storage = self.scalar_args(args)?;
        let mut raw_args = storage
            .iter()
            .zip(args)
            .map(|(stored, arg)| match (stored, arg) {
                (Some(scalar), _) => scalar.as_arg_ptr(),
                (None, ForeignValue::Address(address)) => {
                    *address as *mut c_void
                }
                (None, _) => std::ptr::null_mut(),
            })
            .collect::<Vec<_>>();

        let code = CodePtr(self.code.address() as *mut c_void);
        // integral returns narrower than a register come back widened
        let mut word = [0u64; 2];
        let rvalue = match (&self.key.descriptor.ret, ret) {
            (None, _) => std::ptr::null_mut(),
            (Some(AbiType::Scalar(_)), _) => word.as_mut_ptr() as *mut c_void,
            (Some(AbiType::Aggregate { .. }), Some(buffer)) => {
                let required = self.return_capacity.unwrap_or(0);
                if buffer.len() < required {
                    return Err(NativeCallError::ReturnBufferTooSmall {
                        required,
                        got: buffer.len(),
                    });
                }
                buffer.as_ptr() as *mut c_void
            }
            (Some(AbiType::Aggregate { .. }), None) => {
                return Err(NativeCallError::ReturnBufferTooSmall {
                    required: self.return_capacity.unwrap_or(0),
                    got: 0,
                });
            }
        };

        with_thread_local_cif(
            &self.key,
            || build_cif(&self.key.descriptor),
            |cif| {
                // SAFETY: signature and argument addresses are the caller's
                // contract; storage outlives the call
                unsafe {
                    raw::ffi_call(
                        cif.as_raw_ptr(),
                        Some(*code.as_safe_fun()),
                        rvalue,
                        raw_args.as_mut_ptr(),
                    );
                }
            },
        );
        drop(storage);

        Ok(match (&self.key.descriptor.ret, ret) {
            (None, _) => ForeignValue::Void,
            (Some(AbiType::Scalar(kind)), _) => {
                // SAFETY: libffi wrote the return value into `word`
                ForeignValue::Scalar(unsafe { read_return(*kind, &word) })
            }
            (Some(AbiType::Aggregate { .. }), Some(buffer)) => {
                ForeignValue::Address(buffer.address())
            }
            (Some(AbiType::Aggregate { .. }), None) => ForeignValue::Void,
        })
    }
}

unsafe fn read_return(kind: AbiScalar, word: &[u64; 2]) -> Scalar {
    let src = word.as_ptr() as *const u8;
    // SAFETY: word is 16 bytes and 8-byte aligned
    unsafe {
        let widened = std::ptr::read(src as *const raw::ffi_arg) as u64;
        match kind {
            AbiScalar::I8 => Scalar::I8(widened as i8),
            AbiScalar::U8 => Scalar::U8(widened as u8),
            AbiScalar::I16 => Scalar::I16(widened as i16),
            AbiScalar::U16 => Scalar::U16(widened as u16),
            AbiScalar::I32 => Scalar::I32(widened as i32),
            AbiScalar::U32 => Scalar::U32(widened as u32),
            AbiScalar::I64 => Scalar::I64(std::ptr::read(src as *const i64)),
            AbiScalar::U64 => Scalar::U64(std::ptr::read(src as *const u64)),
            AbiScalar::F32 => Scalar::F32(std::ptr::read(src as *const f32)),
            AbiScalar::F64 => Scalar::F64(std::ptr::read(src as *const f64)),
            AbiScalar::Pointer => {
                Scalar::Pointer(std::ptr::read(src as *const usize))
            }
        }
    }
}
