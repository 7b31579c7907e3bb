use std::collections::HashMap;

use crate::memory::{read_c_string, read_scalar};
use crate::{
    AbiScalar, ForeignValue, LayoutCalculator, LayoutError, MarshalError,
    MarshalledCell, Ref, Scalar, ScalarKind, TypeDesc, Value,
};

/// Per-call state of the result marshaller.
///
/// A pointer to a cell marshalled for this call with write-back decodes into
/// that cell. Every other pointee gets a fresh [`Ref`], shared by all
/// pointers to the same address so that pointer cycles decode into cyclic
/// cells.
pub struct UnmarshalContext<'a> {
    layouts: &'a LayoutCalculator,
    cells: HashMap<(usize, TypeDesc), Ref>,
    decoded: HashMap<(usize, TypeDesc), Ref>,
}

impl<'a> UnmarshalContext<'a> {
    pub fn new(
        layouts: &'a LayoutCalculator,
        cells: &[MarshalledCell],
    ) -> Self {
        Self {
            layouts,
            cells: cells
                .iter()
                .filter(|placed| placed.write_back)
                .map(|placed| {
                    ((placed.address, placed.ty.clone()), placed.cell.clone())
                })
                .collect(),
            decoded: HashMap::new(),
        }
    }

    /// Decodes the raw return value of a call.
    ///
    /// # Safety
    /// Every address reachable from `raw` through `ty` must be readable.
    pub unsafe fn unmarshal_result(
        &mut self,
        raw: &ForeignValue,
        ty: &TypeDesc,
    ) -> Result<Value, MarshalError> {
        match ty {
            TypeDesc::Scalar(kind) => match raw {
                ForeignValue::Scalar(scalar) => value_of(*scalar, *kind),
                _ => Err(raw_mismatch(ty, self.layouts)),
            },
            TypeDesc::Opaque => address_of(raw)
                .map(Value::Address)
                .ok_or_else(|| raw_mismatch(ty, self.layouts)),
            TypeDesc::CString => {
                let address = address_of(raw)
                    .ok_or_else(|| raw_mismatch(ty, self.layouts))?;
                // SAFETY: forwarded to the caller
                unsafe { read_string(address) }
            }
            TypeDesc::Pointer(pointee) => {
                let address = address_of(raw)
                    .ok_or_else(|| raw_mismatch(ty, self.layouts))?;
                // SAFETY: forwarded to the caller
                unsafe { self.read_pointee(address, pointee) }
            }
            TypeDesc::Struct(_) | TypeDesc::FixedArray { .. } => match raw {
                ForeignValue::Address(address) if *address != 0 => {
                    // SAFETY: forwarded to the caller
                    unsafe { self.read_value(ty, *address as *const u8) }
                }
                _ => Err(raw_mismatch(ty, self.layouts)),
            },
        }
    }

    /// Stores the value found at `address` into `cell`.
    ///
    /// A cell that was already refreshed while decoding another pointer to
    /// the same address is left alone.
    ///
    /// # Safety
    /// `address` must hold a readable value of type `ty`.
    pub unsafe fn writeback_reference(
        &mut self,
        address: usize,
        ty: &TypeDesc,
        cell: &Ref,
    ) -> Result<(), MarshalError> {
        let key = (address, ty.clone());
        if self.decoded.contains_key(&key) {
            return Ok(());
        }
        self.decoded.insert(key, cell.clone());
        // SAFETY: forwarded to the caller
        let value = unsafe { self.read_value(ty, address as *const u8)? };
        cell.set(value);
        Ok(())
    }

    /// # Safety
    /// `src` must hold a readable value of type `ty`.
    pub unsafe fn read_value(
        &mut self,
        ty: &TypeDesc,
        src: *const u8,
    ) -> Result<Value, MarshalError> {
        let platform = *self.layouts.platform();
        match ty {
            TypeDesc::Scalar(kind) => {
                // SAFETY: src holds a scalar of this kind
                let scalar = unsafe { read_scalar(kind.abi(&platform), src) };
                value_of(scalar, *kind)
            }
            TypeDesc::Opaque => {
                // SAFETY: src holds a pointer
                Ok(Value::Address(unsafe { read_pointer(src) }))
            }
            TypeDesc::CString => {
                // SAFETY: src holds a pointer to a C string or null
                unsafe { read_string(read_pointer(src)) }
            }
            TypeDesc::Pointer(pointee) => {
                // SAFETY: src holds a pointer
                let address = unsafe { read_pointer(src) };
                // SAFETY: a non-null pointee is readable by contract
                unsafe { self.read_pointee(address, pointee) }
            }
            TypeDesc::Struct(id) => {
                let layouts = self.layouts;
                let layout = layouts.struct_layout(*id)?;
                let defs = layouts
                    .table()
                    .get(*id)
                    .and_then(|def| def.fields.as_deref())
                    .unwrap_or_default();
                let mut fields = Vec::with_capacity(defs.len());
                for (def, offset) in defs.iter().zip(&layout.offsets) {
                    // SAFETY: the field lies inside the struct
                    let field = unsafe {
                        self.read_value(&def.ty, src.add(*offset as usize))?
                    };
                    fields.push(field);
                }
                Ok(Value::Struct(fields))
            }
            TypeDesc::FixedArray {
                element,
                length: Some(length),
            } => {
                let stride = self.layouts.layout_of(element)?.stride() as usize;
                let mut items = Vec::with_capacity(*length);
                for i in 0..*length {
                    // SAFETY: element i lies inside the array
                    let item = unsafe {
                        self.read_value(element, src.add(i * stride))?
                    };
                    items.push(item);
                }
                Ok(Value::Array(items))
            }
            TypeDesc::FixedArray { length: None, .. } => {
                Err(LayoutError::UnresolvedLength {
                    ty: ty.describe(self.layouts.table()),
                }
                .into())
            }
        }
    }

    /// Decodes the value at `address` into a reference cell, or
    /// [`Value::Null`] for a null pointer.
    ///
    /// # Safety
    /// A non-null `address` must hold a readable value of type `pointee`.
    pub unsafe fn read_pointee(
        &mut self,
        address: usize,
        pointee: &TypeDesc,
    ) -> Result<Value, MarshalError> {
        if address == 0 {
            return Ok(Value::Null);
        }
        let key = (address, pointee.clone());
        if let Some(cell) = self.decoded.get(&key) {
            return Ok(Value::Ref(cell.clone()));
        }
        let cell = match self.cells.get(&key) {
            Some(cell) => cell.clone(),
            None => Ref::new(Value::Null),
        };
        self.decoded.insert(key, cell.clone());
        // SAFETY: forwarded to the caller
        let value = unsafe { self.read_value(pointee, address as *const u8)? };
        cell.set(value);
        Ok(Value::Ref(cell))
    }
}

fn raw_mismatch(ty: &TypeDesc, layouts: &LayoutCalculator) -> MarshalError {
    MarshalError::TypeMismatch {
        expected: ty.describe(layouts.table()),
        got: "foreign value of another shape",
    }
}

fn address_of(raw: &ForeignValue) -> Option<usize> {
    match raw {
        ForeignValue::Address(address) => Some(*address),
        ForeignValue::Scalar(Scalar::Pointer(address)) => Some(*address),
        _ => None,
    }
}

unsafe fn read_pointer(src: *const u8) -> usize {
    // SAFETY: forwarded to the caller
    match unsafe { read_scalar(AbiScalar::Pointer, src) } {
        Scalar::Pointer(address) => address,
        _ => 0,
    }
}

/// Reads a NUL-terminated single-byte ASCII string.
unsafe fn read_string(address: usize) -> Result<Value, MarshalError> {
    if address == 0 {
        return Ok(Value::Null);
    }
    // SAFETY: forwarded to the caller
    let bytes = unsafe { read_c_string(address as *const u8) };
    if let Some(position) = bytes.iter().position(|b| !b.is_ascii()) {
        return Err(MarshalError::Encoding {
            detail: format!(
                "byte {:#04x} at offset {position}",
                bytes[position]
            ),
        });
    }
    Ok(Value::String(bytes.iter().map(|&b| b as char).collect()))
}

/// Converts a machine scalar back to the managed value of `kind`.
pub fn value_of(
    scalar: Scalar,
    kind: ScalarKind,
) -> Result<Value, MarshalError> {
    Ok(match (kind, scalar) {
        (ScalarKind::Bool, Scalar::U8(v)) => Value::Bool(v != 0),
        (ScalarKind::I8, Scalar::I8(v)) => Value::I8(v),
        (ScalarKind::U8, Scalar::U8(v)) => Value::U8(v),
        (ScalarKind::I16, Scalar::I16(v)) => Value::I16(v),
        (ScalarKind::U16, Scalar::U16(v)) => Value::U16(v),
        (ScalarKind::I32, Scalar::I32(v)) => Value::I32(v),
        (ScalarKind::U32, Scalar::U32(v)) => Value::U32(v),
        (ScalarKind::I64, Scalar::I64(v)) => Value::I64(v),
        (ScalarKind::U64, Scalar::U64(v)) => Value::U64(v),
        (ScalarKind::F32, Scalar::F32(v)) => Value::F32(v),
        (ScalarKind::F64, Scalar::F64(v)) => Value::F64(v),
        (ScalarKind::Long, Scalar::I32(v)) => Value::Long(v.into()),
        (ScalarKind::Long, Scalar::I64(v)) => Value::Long(v),
        (ScalarKind::ULong, Scalar::U32(v)) => Value::ULong(v.into()),
        (ScalarKind::ULong, Scalar::U64(v)) => Value::ULong(v),
        (ScalarKind::Size, Scalar::U32(v)) => Value::Size(v.into()),
        (ScalarKind::Size, Scalar::U64(v)) => Value::Size(v),
        _ => {
            return Err(MarshalError::TypeMismatch {
                expected: kind.name().to_string(),
                got: "foreign scalar of another width",
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{Arena, Field, MarshalContext, Platform, TypeTable};

    fn calculator(table: TypeTable) -> LayoutCalculator {
        LayoutCalculator::new(Arc::new(table), Platform::host())
    }

    fn round_trip(
        calc: &LayoutCalculator,
        value: &Value,
        ty: &TypeDesc,
    ) -> Value {
        let mut arena = Arena::new(256);
        let mut marshal = MarshalContext::new(calc, &mut arena);
        let raw = marshal.marshal_argument(value, ty).unwrap();
        let cells = marshal.finish();
        let mut unmarshal = UnmarshalContext::new(calc, &cells);
        // SAFETY: raw points into the live arena
        unsafe { unmarshal.unmarshal_result(&raw, ty).unwrap() }
    }

    #[test]
    fn nested_struct_round_trip() {
        let mut table = TypeTable::new();
        let simple = table
            .define_struct(
                "SimpleStruct",
                [("s_int", TypeDesc::I32), ("s_long", TypeDesc::I64)],
            )
            .unwrap();
        let complex = table
            .define_struct(
                "ComplexStruct",
                [
                    ("id", TypeDesc::I32),
                    ("flag", TypeDesc::BOOL),
                    ("inner", TypeDesc::Struct(simple)),
                    ("many", TypeDesc::array(TypeDesc::Struct(simple), 3)),
                    ("ratio", TypeDesc::F32),
                    ("count", TypeDesc::LONG),
                    ("message", TypeDesc::CString),
                ],
            )
            .unwrap();
        let calc = calculator(table);
        let simple_value = |n: i32| {
            Value::Struct(vec![Value::I32(n), Value::I64(i64::from(n) * 100)])
        };
        let value = Value::Struct(vec![
            Value::I32(55),
            Value::Bool(true),
            simple_value(1),
            Value::Array(vec![
                simple_value(2),
                simple_value(3),
                simple_value(4),
            ]),
            Value::F32(0.25),
            Value::Long(-12),
            Value::from("the quick brown fox"),
        ]);
        assert_eq!(
            round_trip(&calc, &value, &TypeDesc::Struct(complex)),
            value
        );
    }

    #[test]
    fn array_of_structs_round_trip() {
        let mut table = TypeTable::new();
        let pair = table
            .define_struct("Pair", [("a", TypeDesc::I32), ("b", TypeDesc::I64)])
            .unwrap();
        let calc = calculator(table);
        let ty = TypeDesc::array(TypeDesc::Struct(pair), 3);
        let value = Value::Array(
            (0..3)
                .map(|i| {
                    Value::Struct(vec![
                        Value::I32(i),
                        Value::I64(-i64::from(i)),
                    ])
                })
                .collect(),
        );
        assert_eq!(round_trip(&calc, &value, &ty), value);
    }

    #[test]
    fn scalars_round_trip_through_platform_widths() {
        let calc = calculator(TypeTable::new());
        for (value, ty) in [
            (Value::Long(-5), TypeDesc::LONG),
            (Value::ULong(7), TypeDesc::ULONG),
            (Value::Size(4096), TypeDesc::SIZE),
            (Value::Bool(false), TypeDesc::BOOL),
            (Value::U16(65535), TypeDesc::U16),
            (Value::F64(-0.5), TypeDesc::F64),
        ] {
            assert_eq!(round_trip(&calc, &value, &ty), value);
        }
        assert_eq!(
            value_of(Scalar::I32(-1), ScalarKind::Long),
            Ok(Value::Long(-1))
        );
    }

    #[test]
    fn non_ascii_bytes_are_rejected() {
        let raw = b"caf\xe9\0";
        // SAFETY: raw is NUL terminated
        let err = unsafe { read_string(raw.as_ptr() as usize) }.unwrap_err();
        assert!(matches!(err, MarshalError::Encoding { .. }));
        // SAFETY: null is never dereferenced
        assert_eq!(unsafe { read_string(0) }, Ok(Value::Null));
    }

    #[test]
    fn pointer_cycle_decodes_into_one_cell() {
        let mut table = TypeTable::new();
        let node = table.declare("Node");
        table
            .define(
                node,
                vec![
                    Field {
                        name: "value".to_string(),
                        ty: TypeDesc::I32,
                    },
                    Field {
                        name: "next".to_string(),
                        ty: TypeDesc::pointer(TypeDesc::Struct(node)),
                    },
                ],
            )
            .unwrap();
        let calc = calculator(table);
        let node_ty = TypeDesc::Struct(node);
        let next_offset = calc.struct_layout(node).unwrap().offsets[1] as usize;

        let mut arena = Arena::new(128);
        let mut marshal = MarshalContext::new(&calc, &mut arena);
        let raw = marshal
            .marshal_argument(
                &Value::Struct(vec![Value::I32(3), Value::Null]),
                &node_ty,
            )
            .unwrap();
        let ForeignValue::Address(address) = raw else {
            panic!("struct should be passed by address");
        };
        // SAFETY: point the node at itself inside the live arena
        unsafe {
            crate::memory::write_scalar(
                Scalar::Pointer(address),
                (address + next_offset) as *mut u8,
            )
        };
        let cells = marshal.finish();
        let mut unmarshal = UnmarshalContext::new(&calc, &cells);
        // SAFETY: address is a live node
        let decoded = unsafe {
            unmarshal
                .read_pointee(address, &node_ty)
                .unwrap()
        };
        let Value::Ref(cell) = decoded else {
            panic!("pointer should decode into a cell");
        };
        let Value::Struct(fields) = cell.get() else {
            panic!("node should decode into a struct");
        };
        assert_eq!(fields[0], Value::I32(3));
        let Value::Ref(next) = &fields[1] else {
            panic!("next should be a cell");
        };
        assert!(next.ptr_eq(&cell));
        cell.set(Value::Null);
    }

    #[test]
    fn write_back_updates_recorded_cell_in_place() {
        let calc = calculator(TypeTable::new());
        let ty = TypeDesc::unsized_array(TypeDesc::I32);
        let cell = Ref::new(Value::Array(vec![
            Value::I32(1),
            Value::I32(2),
            Value::I32(3),
        ]));
        let alias = cell.clone();

        let mut arena = Arena::new(64);
        let mut marshal = MarshalContext::new(&calc, &mut arena);
        let address = marshal.marshal_reference(&cell, &ty, true).unwrap();
        // SAFETY: the first element lives at the buffer start
        unsafe {
            crate::memory::write_scalar(Scalar::I32(5), address as *mut u8)
        };
        let cells = marshal.finish();
        let mut unmarshal = UnmarshalContext::new(&calc, &cells);
        for placed in &cells {
            // SAFETY: buffers are live until the arena drops
            unsafe {
                unmarshal
                    .writeback_reference(
                        placed.address,
                        &placed.ty,
                        &placed.cell,
                    )
                    .unwrap()
            };
        }
        assert_eq!(
            alias.get(),
            Value::Array(vec![Value::I32(5), Value::I32(2), Value::I32(3)])
        );
    }

    #[test]
    fn mismatched_raw_shape_is_an_error() {
        let calc = calculator(TypeTable::new());
        let mut unmarshal = UnmarshalContext::new(&calc, &[]);
        // SAFETY: rejected before any memory is touched
        let err = unsafe {
            unmarshal.unmarshal_result(&ForeignValue::Void, &TypeDesc::I32)
        };
        assert!(matches!(err, Err(MarshalError::TypeMismatch { .. })));
    }
}
