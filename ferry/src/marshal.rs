use std::collections::HashMap;

use crate::memory::{write_bytes, write_scalar};
use crate::{
    AbiScalar, Buffer, ForeignValue, Layout, LayoutCalculator, MarshalError,
    Parameter, PassingMode, Platform, Ref, Scalar, ScalarKind, Scope, TypeDesc,
    Value,
};

/// A reference cell whose value was copied into a scope buffer.
#[derive(Debug, Clone)]
pub struct MarshalledCell {
    pub address: usize,
    pub cell: Ref,
    /// Type of the value stored at `address`, with any runtime array length
    /// resolved.
    pub ty: TypeDesc,
    pub write_back: bool,
}

/// Per-call state of the argument marshaller.
///
/// Every buffer comes from `scope`. Cells are placed once per call: a cell
/// that shows up again, through an alias or a pointer cycle, reuses its
/// buffer.
pub struct MarshalContext<'a> {
    layouts: &'a LayoutCalculator,
    scope: &'a mut dyn Scope,
    cells: Vec<MarshalledCell>,
    placed: HashMap<usize, usize>,
}

impl<'a> MarshalContext<'a> {
    pub fn new(
        layouts: &'a LayoutCalculator,
        scope: &'a mut dyn Scope,
    ) -> Self {
        Self {
            layouts,
            scope,
            cells: Vec::new(),
            placed: HashMap::new(),
        }
    }

    fn platform(&self) -> &Platform {
        self.layouts.platform()
    }

    pub fn marshal_parameter(
        &mut self,
        value: &Value,
        param: &Parameter,
    ) -> Result<ForeignValue, MarshalError> {
        match param.mode {
            PassingMode::ByValue => self.marshal_argument(value, &param.ty),
            PassingMode::ByReference { write_back } => match value {
                Value::Ref(cell) => self
                    .marshal_reference(cell, &param.ty, write_back)
                    .map(ForeignValue::Address),
                Value::Null => Ok(ForeignValue::Address(0)),
                Value::Address(address) => Ok(ForeignValue::Address(*address)),
                other => Err(MarshalError::TypeMismatch {
                    expected: format!(
                        "reference to {}",
                        param.ty.describe(self.layouts.table())
                    ),
                    got: other.kind_name(),
                }),
            },
        }
    }

    pub fn marshal_argument(
        &mut self,
        value: &Value,
        ty: &TypeDesc,
    ) -> Result<ForeignValue, MarshalError> {
        match ty {
            TypeDesc::Scalar(kind) => Ok(ForeignValue::Scalar(scalar_of(
                value,
                *kind,
                self.platform(),
            )?)),
            TypeDesc::Opaque => Ok(ForeignValue::Scalar(Scalar::Pointer(
                self.pointer_of(value, ty)?,
            ))),
            TypeDesc::CString => match value {
                Value::Null => Ok(ForeignValue::Address(0)),
                Value::String(text) => {
                    self.place_string(text).map(ForeignValue::Address)
                }
                other => Err(self.mismatch(ty, other)),
            },
            TypeDesc::Pointer(pointee) => match value {
                Value::Null => Ok(ForeignValue::Address(0)),
                Value::Address(address) => Ok(ForeignValue::Address(*address)),
                Value::Ref(cell) => self
                    .marshal_reference(cell, pointee, true)
                    .map(ForeignValue::Address),
                other => Err(self.mismatch(ty, other)),
            },
            TypeDesc::Struct(_) | TypeDesc::FixedArray { .. } => {
                let (ty, layout) = self.resolve(value, ty)?;
                let address = self.allocate(&layout)?;
                // SAFETY: freshly allocated with the layout of `ty`
                unsafe {
                    self.write_value(value, &ty, address as *mut u8, true)?
                };
                Ok(ForeignValue::Address(address))
            }
        }
    }

    /// Copies the cell's value into a fresh buffer and records the cell.
    /// Returns the buffer address.
    pub fn marshal_reference(
        &mut self,
        cell: &Ref,
        pointee: &TypeDesc,
        write_back: bool,
    ) -> Result<usize, MarshalError> {
        if let Some(&index) = self.placed.get(&cell.key()) {
            let placed = &mut self.cells[index];
            placed.write_back |= write_back;
            return Ok(placed.address);
        }

        let value = cell.get();
        let (ty, layout) = self.resolve(&value, pointee)?;
        let address = self.allocate(&layout)?;
        self.placed.insert(cell.key(), self.cells.len());
        self.cells.push(MarshalledCell {
            address,
            cell: cell.clone(),
            ty: ty.clone(),
            write_back,
        });
        // SAFETY: freshly allocated with the layout of `ty`
        unsafe {
            self.write_value(&value, &ty, address as *mut u8, write_back)?
        };
        Ok(address)
    }

    /// Encodes `value` as `ty` at `dst`.
    ///
    /// Pointers reached inside `value` are placed in their own buffers;
    /// `write_back` is inherited by the cells they come from.
    ///
    /// # Safety
    /// `dst` must be writable for the size of `ty`'s layout.
    pub unsafe fn write_value(
        &mut self,
        value: &Value,
        ty: &TypeDesc,
        dst: *mut u8,
        write_back: bool,
    ) -> Result<(), MarshalError> {
        match ty {
            TypeDesc::Scalar(kind) => {
                let scalar = scalar_of(value, *kind, self.platform())?;
                // SAFETY: dst holds a scalar of this kind
                unsafe { write_scalar(scalar, dst) };
            }
            TypeDesc::Opaque => {
                let address = self.pointer_of(value, ty)?;
                // SAFETY: dst holds a pointer
                unsafe { write_scalar(Scalar::Pointer(address), dst) };
            }
            TypeDesc::CString => {
                let address = match value {
                    Value::Null => 0,
                    Value::String(text) => self.place_string(text)?,
                    other => return Err(self.mismatch(ty, other)),
                };
                // SAFETY: dst holds a pointer
                unsafe { write_scalar(Scalar::Pointer(address), dst) };
            }
            TypeDesc::Pointer(pointee) => {
                let address = match value {
                    Value::Null => 0,
                    Value::Address(address) => *address,
                    Value::Ref(cell) => {
                        self.marshal_reference(cell, pointee, write_back)?
                    }
                    other => return Err(self.mismatch(ty, other)),
                };
                // SAFETY: dst holds a pointer
                unsafe { write_scalar(Scalar::Pointer(address), dst) };
            }
            TypeDesc::Struct(id) => {
                let Value::Struct(fields) = value else {
                    return Err(self.mismatch(ty, value));
                };
                let layouts = self.layouts;
                let layout = layouts.struct_layout(*id)?;
                let defs = layouts
                    .table()
                    .get(*id)
                    .and_then(|def| def.fields.as_deref())
                    .unwrap_or_default();
                if defs.len() != fields.len() {
                    return Err(MarshalError::FieldCount {
                        ty: ty.describe(layouts.table()),
                        expected: defs.len(),
                        got: fields.len(),
                    });
                }
                for ((def, field), offset) in
                    defs.iter().zip(fields).zip(&layout.offsets)
                {
                    // SAFETY: field lies inside the struct at its offset
                    unsafe {
                        self.write_value(
                            field,
                            &def.ty,
                            dst.add(*offset as usize),
                            write_back,
                        )?
                    };
                }
            }
            TypeDesc::FixedArray { element, length } => {
                let Value::Array(items) = value else {
                    return Err(self.mismatch(ty, value));
                };
                if let Some(declared) = length {
                    if *declared != items.len() {
                        return Err(MarshalError::LengthMismatch {
                            declared: *declared,
                            actual: items.len(),
                        });
                    }
                }
                let stride = self.layouts.layout_of(element)?.stride() as usize;
                for (i, item) in items.iter().enumerate() {
                    // SAFETY: element i lies at i * stride inside the array
                    unsafe {
                        self.write_value(
                            item,
                            element,
                            dst.add(i * stride),
                            write_back,
                        )?
                    };
                }
            }
        }
        Ok(())
    }

    /// Places `text` as a NUL-terminated ASCII string and returns its
    /// address.
    pub fn place_string(&mut self, text: &str) -> Result<usize, MarshalError> {
        if let Some(bad) = text.chars().find(|c| !c.is_ascii() || *c == '\0') {
            return Err(MarshalError::Encoding {
                detail: format!("character {bad:?} in {text:?}"),
            });
        }
        let buffer = self.scope.allocate(text.len() + 1, 1)?;
        // SAFETY: buffer holds len + 1 zeroed bytes
        unsafe { write_bytes(text.as_bytes(), buffer.as_ptr()) };
        Ok(buffer.address())
    }

    /// Scope memory for something the call writes, such as an aggregate
    /// return value.
    pub fn allocate_buffer(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<Buffer, MarshalError> {
        Ok(self.scope.allocate(size, align)?)
    }

    pub fn cells(&self) -> &[MarshalledCell] {
        &self.cells
    }

    pub fn finish(self) -> Vec<MarshalledCell> {
        self.cells
    }

    /// Resolves a runtime array length from `value` and returns the type
    /// with its layout.
    fn resolve(
        &self,
        value: &Value,
        ty: &TypeDesc,
    ) -> Result<(TypeDesc, Layout), MarshalError> {
        match (ty, value) {
            (
                TypeDesc::FixedArray {
                    element,
                    length: None,
                },
                Value::Array(items),
            ) => {
                let resolved =
                    TypeDesc::array((**element).clone(), items.len());
                let layout = self.layouts.array_layout(element, items.len())?;
                Ok((resolved, layout))
            }
            _ => Ok((ty.clone(), self.layouts.layout_of(ty)?)),
        }
    }

    fn allocate(&mut self, layout: &Layout) -> Result<usize, MarshalError> {
        let buffer = self
            .scope
            .allocate(layout.stride() as usize, layout.align as usize)?;
        Ok(buffer.address())
    }

    fn pointer_of(
        &self,
        value: &Value,
        ty: &TypeDesc,
    ) -> Result<usize, MarshalError> {
        match value {
            Value::Address(address) => Ok(*address),
            Value::Null => Ok(0),
            other => Err(self.mismatch(ty, other)),
        }
    }

    fn mismatch(&self, ty: &TypeDesc, value: &Value) -> MarshalError {
        MarshalError::TypeMismatch {
            expected: ty.describe(self.layouts.table()),
            got: value.kind_name(),
        }
    }
}

fn integer_of(value: &Value) -> Option<i128> {
    match *value {
        Value::I8(v) => Some(v.into()),
        Value::U8(v) => Some(v.into()),
        Value::I16(v) => Some(v.into()),
        Value::U16(v) => Some(v.into()),
        Value::I32(v) => Some(v.into()),
        Value::U32(v) => Some(v.into()),
        Value::I64(v) | Value::Long(v) => Some(v.into()),
        Value::U64(v) | Value::ULong(v) | Value::Size(v) => Some(v.into()),
        _ => None,
    }
}

/// Converts a managed scalar to the machine scalar for `kind`, checking
/// that integers fit.
pub fn scalar_of(
    value: &Value,
    kind: ScalarKind,
    platform: &Platform,
) -> Result<Scalar, MarshalError> {
    let mismatch = || MarshalError::TypeMismatch {
        expected: kind.name().to_string(),
        got: value.kind_name(),
    };
    match kind {
        ScalarKind::Bool => match value {
            Value::Bool(b) => Ok(Scalar::U8(*b as u8)),
            _ => Err(mismatch()),
        },
        ScalarKind::F32 => match *value {
            Value::F32(v) => Ok(Scalar::F32(v)),
            Value::F64(v) => Ok(Scalar::F32(v as f32)),
            _ => Err(mismatch()),
        },
        ScalarKind::F64 => match *value {
            Value::F32(v) => Ok(Scalar::F64(v.into())),
            Value::F64(v) => Ok(Scalar::F64(v)),
            _ => Err(mismatch()),
        },
        _ => {
            let n = integer_of(value).ok_or_else(mismatch)?;
            let overflow = |_| MarshalError::OutOfRange {
                kind: kind.name(),
                value: n.to_string(),
            };
            Ok(match kind.abi(platform) {
                AbiScalar::I8 => Scalar::I8(n.try_into().map_err(overflow)?),
                AbiScalar::U8 => Scalar::U8(n.try_into().map_err(overflow)?),
                AbiScalar::I16 => Scalar::I16(n.try_into().map_err(overflow)?),
                AbiScalar::U16 => Scalar::U16(n.try_into().map_err(overflow)?),
                AbiScalar::I32 => Scalar::I32(n.try_into().map_err(overflow)?),
                AbiScalar::U32 => Scalar::U32(n.try_into().map_err(overflow)?),
                AbiScalar::I64 => Scalar::I64(n.try_into().map_err(overflow)?),
                AbiScalar::U64 => Scalar::U64(n.try_into().map_err(overflow)?),
                AbiScalar::F32
                | AbiScalar::F64
                | AbiScalar::Pointer => return Err(mismatch()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::{read_c_string, read_scalar};
    use crate::{Arena, Field, TypeTable};

    fn calculator(table: TypeTable) -> LayoutCalculator {
        LayoutCalculator::new(Arc::new(table), Platform::host())
    }

    fn read_i32(address: usize) -> i32 {
        // SAFETY: test addresses come from a live arena
        match unsafe { read_scalar(AbiScalar::I32, address as *const u8) } {
            Scalar::I32(v) => v,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn read_pointer(address: usize) -> usize {
        // SAFETY: test addresses come from a live arena
        match unsafe { read_scalar(AbiScalar::Pointer, address as *const u8) } {
            Scalar::Pointer(v) => v,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn struct_fields_land_at_their_offsets() {
        let mut table = TypeTable::new();
        let id = table
            .define_struct(
                "Simple",
                [
                    ("a", TypeDesc::I8),
                    ("b", TypeDesc::I32),
                    ("c", TypeDesc::I64),
                ],
            )
            .unwrap();
        let calc = calculator(table);
        let mut arena = Arena::new(256);
        let mut ctx = MarshalContext::new(&calc, &mut arena);
        let value = Value::Struct(vec![
            Value::I8(1),
            Value::I32(-2),
            Value::I64(3),
        ]);

        let ForeignValue::Address(address) =
            ctx.marshal_argument(&value, &TypeDesc::Struct(id)).unwrap()
        else {
            panic!("struct should be passed by address");
        };
        assert_eq!(read_i32(address + 4), -2);
        // SAFETY: live arena
        let c = unsafe {
            read_scalar(AbiScalar::I64, (address + 8) as *const u8)
        };
        assert_eq!(c, Scalar::I64(3));
    }

    #[test]
    fn scalars_are_range_checked() {
        let platform = Platform::host();
        assert_eq!(
            scalar_of(&Value::I32(200), ScalarKind::U8, &platform),
            Ok(Scalar::U8(200))
        );
        assert!(matches!(
            scalar_of(&Value::I32(-1), ScalarKind::U32, &platform),
            Err(MarshalError::OutOfRange { .. })
        ));
        assert!(matches!(
            scalar_of(
                &Value::I64(i64::MAX),
                ScalarKind::Long,
                &Platform::LLP64
            ),
            Err(MarshalError::OutOfRange { .. })
        ));
        assert_eq!(
            scalar_of(&Value::Long(-7), ScalarKind::Long, &Platform::LP64),
            Ok(Scalar::I64(-7))
        );
        assert_eq!(
            scalar_of(&Value::Bool(true), ScalarKind::Bool, &platform),
            Ok(Scalar::U8(1))
        );
        assert!(matches!(
            scalar_of(&Value::F64(1.0), ScalarKind::I32, &platform),
            Err(MarshalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn strings_are_ascii_and_nul_terminated() {
        let calc = calculator(TypeTable::new());
        let mut arena = Arena::new(64);
        let mut ctx = MarshalContext::new(&calc, &mut arena);

        let address = ctx.place_string("hello, world").unwrap();
        // SAFETY: placed string is NUL terminated
        assert_eq!(
            unsafe { read_c_string(address as *const u8) },
            b"hello, world"
        );

        assert!(matches!(
            ctx.marshal_argument(&Value::from("caf\u{e9}"), &TypeDesc::CString),
            Err(MarshalError::Encoding { .. })
        ));
        assert!(matches!(
            ctx.place_string("a\0b"),
            Err(MarshalError::Encoding { .. })
        ));
        assert_eq!(
            ctx.marshal_argument(&Value::Null, &TypeDesc::CString),
            Ok(ForeignValue::Address(0))
        );
    }

    #[test]
    fn declared_length_must_match() {
        let calc = calculator(TypeTable::new());
        let mut arena = Arena::new(64);
        let mut ctx = MarshalContext::new(&calc, &mut arena);
        let err = ctx
            .marshal_argument(
                &Value::Array(vec![Value::I32(1), Value::I32(2)]),
                &TypeDesc::array(TypeDesc::I32, 3),
            )
            .unwrap_err();
        assert_eq!(
            err,
            MarshalError::LengthMismatch {
                declared: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn runtime_length_comes_from_the_value() {
        let calc = calculator(TypeTable::new());
        let mut arena = Arena::new(64);
        let mut ctx = MarshalContext::new(&calc, &mut arena);
        let cell = Ref::new(Value::Array(vec![
            Value::F64(1.0),
            Value::F64(2.0),
            Value::F64(3.0),
        ]));
        let ty = TypeDesc::unsized_array(TypeDesc::F64);
        ctx.marshal_reference(&cell, &ty, true).unwrap();
        let cells = ctx.finish();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].ty, TypeDesc::array(TypeDesc::F64, 3));
    }

    #[test]
    fn raw_address_passes_through_a_reference_parameter() {
        let calc = calculator(TypeTable::new());
        let mut arena = Arena::new(64);
        let mut ctx = MarshalContext::new(&calc, &mut arena);
        let param = Parameter {
            name: "out".to_string(),
            ty: TypeDesc::I32,
            mode: PassingMode::ByReference { write_back: true },
        };
        assert_eq!(
            ctx.marshal_parameter(&Value::Address(0x1000), &param),
            Ok(ForeignValue::Address(0x1000))
        );
        assert!(ctx.cells().is_empty());
        assert!(matches!(
            ctx.marshal_parameter(&Value::I32(3), &param),
            Err(MarshalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn aliased_cells_share_one_buffer() {
        let mut table = TypeTable::new();
        let id = table
            .define_struct(
                "TwoPointers",
                [
                    ("a", TypeDesc::pointer(TypeDesc::I32)),
                    ("b", TypeDesc::pointer(TypeDesc::I32)),
                ],
            )
            .unwrap();
        let calc = calculator(table);
        let mut arena = Arena::new(128);
        let mut ctx = MarshalContext::new(&calc, &mut arena);
        let shared = Ref::new(9i32);
        let value = Value::Struct(vec![
            Value::Ref(shared.clone()),
            Value::Ref(shared.clone()),
        ]);
        let ForeignValue::Address(address) =
            ctx.marshal_argument(&value, &TypeDesc::Struct(id)).unwrap()
        else {
            panic!("struct should be passed by address");
        };
        let first = read_pointer(address);
        let second = read_pointer(address + size_of::<usize>());
        assert_eq!(first, second);
        assert_eq!(read_i32(first), 9);
        assert_eq!(ctx.cells().len(), 1);
    }

    #[test]
    fn pointer_cycles_terminate() {
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
        let mut arena = Arena::new(128);
        let mut ctx = MarshalContext::new(&calc, &mut arena);

        let head = Ref::new(Value::Null);
        head.set(Value::Struct(vec![Value::I32(1), Value::Ref(head.clone())]));
        let address = ctx
            .marshal_reference(&head, &TypeDesc::Struct(node), true)
            .unwrap();
        let next_offset = calc.struct_layout(node).unwrap().offsets[1] as usize;
        assert_eq!(read_pointer(address + next_offset), address);
        // break the cycle so the cell is freed
        head.set(Value::Null);
    }

    #[test]
    fn field_count_is_checked() {
        let mut table = TypeTable::new();
        let id = table
            .define_struct("Pair", [("a", TypeDesc::I32), ("b", TypeDesc::I32)])
            .unwrap();
        let calc = calculator(table);
        let mut arena = Arena::new(64);
        let mut ctx = MarshalContext::new(&calc, &mut arena);
        assert!(matches!(
            ctx.marshal_argument(
                &Value::Struct(vec![Value::I32(1)]),
                &TypeDesc::Struct(id)
            ),
            Err(MarshalError::FieldCount {
                expected: 2,
                got: 1,
                ..
            })
        ));
    }
}
