use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::{
    AbiScalar, AbiType, Field, LayoutError, Platform, StructId, TypeDesc,
    TypeTable,
};

/// Foreign memory shape of a type.
///
/// `extent` is the end of the last byte that belongs to the value, before
/// any trailing padding. Arrays pack their last element without padding, so
/// for them `size == extent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layout {
    pub size: u64,
    pub align: u64,
    pub extent: u64,
}

impl Layout {
    pub fn scalar(width: u64) -> Layout {
        Layout {
            size: width,
            align: width,
            extent: width,
        }
    }

    /// Distance between consecutive elements of this type in an array.
    pub fn stride(&self) -> u64 {
        align_up(self.size, self.align)
    }
}

pub fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}

/// Largest object size any buffer can hold.
const MAX_SIZE: u64 = isize::MAX as u64;

/// Most array elements a by-value aggregate may describe to the caller.
const MAX_ABI_ELEMENTS: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub layout: Layout,
    /// Byte offset of every field, in declaration order.
    pub offsets: Vec<u64>,
}

/// Computes layouts for the types of one [`TypeTable`].
///
/// Lookups never touch foreign memory. Struct layouts are computed on
/// demand; [`LayoutCalculator::prepare`] caches everything reachable from a
/// type so that later lookups borrow instead of recomputing.
#[derive(Debug, Clone)]
pub struct LayoutCalculator {
    table: Arc<TypeTable>,
    platform: Platform,
    structs: HashMap<StructId, StructLayout>,
}

impl LayoutCalculator {
    pub fn new(table: Arc<TypeTable>, platform: Platform) -> Self {
        Self {
            table,
            platform,
            structs: HashMap::new(),
        }
    }

    pub fn table(&self) -> &TypeTable {
        &self.table
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn layout_of(&self, ty: &TypeDesc) -> Result<Layout, LayoutError> {
        self.layout_in(ty, &mut Vec::new())
    }

    pub fn struct_layout(
        &self,
        id: StructId,
    ) -> Result<Cow<'_, StructLayout>, LayoutError> {
        if let Some(cached) = self.structs.get(&id) {
            return Ok(Cow::Borrowed(cached));
        }
        self.compute_struct(id, &mut Vec::new()).map(Cow::Owned)
    }

    pub fn array_layout(
        &self,
        element: &TypeDesc,
        length: usize,
    ) -> Result<Layout, LayoutError> {
        self.array_in(element, length, &mut Vec::new())
    }

    /// Caches the layout of every struct reachable from `ty`, following
    /// pointers as well as by-value containment.
    pub fn prepare(&mut self, ty: &TypeDesc) -> Result<(), LayoutError> {
        let table = Arc::clone(&self.table);
        let mut pending = vec![ty];
        let mut seen = HashSet::new();
        while let Some(ty) = pending.pop() {
            match ty {
                TypeDesc::Struct(id) => {
                    if !seen.insert(*id) {
                        continue;
                    }
                    if !self.structs.contains_key(id) {
                        let layout = self.compute_struct(*id, &mut Vec::new())?;
                        log::debug!(
                            "layout of {}: size {} align {} offsets {:?}",
                            ty.describe(&table),
                            layout.layout.size,
                            layout.layout.align,
                            layout.offsets
                        );
                        self.structs.insert(*id, layout);
                    }
                    if let Some(fields) =
                        table.get(*id).and_then(|def| def.fields.as_ref())
                    {
                        pending.extend(fields.iter().map(|f| &f.ty));
                    }
                }
                TypeDesc::FixedArray { element, .. } => {
                    pending.push(&**element)
                }
                TypeDesc::Pointer(pointee) => pending.push(&**pointee),
                TypeDesc::Scalar(_) | TypeDesc::CString | TypeDesc::Opaque => {}
            }
        }
        Ok(())
    }

    /// Machine-level shape used to describe `ty` to the call primitive.
    ///
    /// Aggregates list their scalar leaves; an array contributes one entry
    /// per element.
    pub fn abi_type(&self, ty: &TypeDesc) -> Result<AbiType, LayoutError> {
        match ty {
            TypeDesc::Scalar(kind) => {
                Ok(AbiType::Scalar(kind.abi(&self.platform)))
            }
            TypeDesc::Pointer(_) | TypeDesc::CString | TypeDesc::Opaque => {
                Ok(AbiType::Scalar(AbiScalar::Pointer))
            }
            TypeDesc::Struct(id) => {
                let layout = self.struct_layout(*id)?.layout;
                let fields = self.fields_of(*id)?;
                let elements = fields
                    .iter()
                    .map(|f| self.abi_type(&f.ty))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(AbiType::Aggregate { layout, elements })
            }
            TypeDesc::FixedArray { element, length } => {
                let length = length.ok_or_else(|| {
                    LayoutError::UnresolvedLength {
                        ty: ty.describe(&self.table),
                    }
                })?;
                let layout = self.array_layout(element, length)?;
                if length > MAX_ABI_ELEMENTS {
                    return Err(LayoutError::Unsupported {
                        ty: ty.describe(&self.table),
                        reason: "array has too many elements to pass by value",
                    });
                }
                let element = self.abi_type(element)?;
                Ok(AbiType::Aggregate {
                    layout,
                    elements: vec![element; length],
                })
            }
        }
    }

    fn layout_in(
        &self,
        ty: &TypeDesc,
        path: &mut Vec<StructId>,
    ) -> Result<Layout, LayoutError> {
        match ty {
            TypeDesc::Scalar(kind) => {
                Ok(Layout::scalar(kind.size(&self.platform)))
            }
            TypeDesc::Pointer(_) | TypeDesc::CString | TypeDesc::Opaque => {
                Ok(Layout::scalar(self.platform.pointer_size))
            }
            TypeDesc::Struct(id) => {
                if let Some(cached) = self.structs.get(id) {
                    return Ok(cached.layout);
                }
                Ok(self.compute_struct(*id, path)?.layout)
            }
            TypeDesc::FixedArray {
                element,
                length: Some(length),
            } => self.array_in(element, *length, path),
            TypeDesc::FixedArray { length: None, .. } => {
                Err(LayoutError::UnresolvedLength {
                    ty: ty.describe(&self.table),
                })
            }
        }
    }

    fn array_in(
        &self,
        element: &TypeDesc,
        length: usize,
        path: &mut Vec<StructId>,
    ) -> Result<Layout, LayoutError> {
        if length == 0 {
            return Err(LayoutError::Unsupported {
                ty: TypeDesc::array(element.clone(), 0).describe(&self.table),
                reason: "zero-length array",
            });
        }
        let layout = self.layout_in(element, path)?;
        let size = (length as u64 - 1)
            .checked_mul(layout.stride())
            .and_then(|body| body.checked_add(layout.extent))
            .filter(|&size| size <= MAX_SIZE)
            .ok_or_else(|| LayoutError::Unsupported {
                ty: TypeDesc::array(element.clone(), length)
                    .describe(&self.table),
                reason: "array size overflows the address space",
            })?;
        Ok(Layout {
            size,
            align: layout.align,
            extent: size,
        })
    }

    fn fields_of(
        &self,
        id: StructId,
    ) -> Result<&[Field], LayoutError> {
        let unsupported = |reason| LayoutError::Unsupported {
            ty: TypeDesc::Struct(id).describe(&self.table),
            reason,
        };
        let def = self
            .table
            .get(id)
            .ok_or_else(|| unsupported("struct is not in the type table"))?;
        let fields = def
            .fields
            .as_deref()
            .ok_or_else(|| unsupported("struct is declared but not defined"))?;
        if fields.is_empty() {
            return Err(unsupported("struct has no fields"));
        }
        Ok(fields)
    }

    fn compute_struct(
        &self,
        id: StructId,
        path: &mut Vec<StructId>,
    ) -> Result<StructLayout, LayoutError> {
        if let Some(cached) = self.structs.get(&id) {
            return Ok(cached.clone());
        }
        if path.contains(&id) {
            return Err(LayoutError::Unsupported {
                ty: TypeDesc::Struct(id).describe(&self.table),
                reason: "struct contains itself by value",
            });
        }
        let fields = self.fields_of(id)?;

        path.push(id);
        let mut offsets = Vec::with_capacity(fields.len());
        let mut running = 0;
        let mut align = 1;
        for field in fields {
            let layout = match self.layout_in(&field.ty, path) {
                Ok(layout) => layout,
                Err(err) => {
                    path.pop();
                    return Err(err);
                }
            };
            let offset = align_up(running, layout.align);
            offsets.push(offset);
            running = offset + layout.size;
            align = align.max(layout.align);
            if running > MAX_SIZE {
                path.pop();
                return Err(LayoutError::Unsupported {
                    ty: TypeDesc::Struct(id).describe(&self.table),
                    reason: "struct size overflows the address space",
                });
            }
        }
        path.pop();

        Ok(StructLayout {
            layout: Layout {
                size: align_up(running, align),
                align,
                extent: running,
            },
            offsets,
        })
    }
}
