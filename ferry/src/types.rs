use std::collections::HashMap;

use crate::{AbiScalar, Platform, TypeTableError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    /// One-byte C char used as a truth value.
    Bool,
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
    /// C `long`, 4 or 8 bytes depending on the platform.
    Long,
    ULong,
    /// `size_t`.
    Size,
}

impl ScalarKind {
    pub fn size(self, platform: &Platform) -> u64 {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::Long | Self::ULong => platform.long_size,
            Self::Size => platform.pointer_size,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Long => "long",
            Self::ULong => "unsigned long",
            Self::Size => "size_t",
        }
    }

    /// The fixed-width machine type this kind is passed as.
    pub fn abi(self, platform: &Platform) -> AbiScalar {
        let wide = |bytes: u64, signed: bool| match (bytes, signed) {
            (4, true) => AbiScalar::I32,
            (4, false) => AbiScalar::U32,
            (_, true) => AbiScalar::I64,
            (_, false) => AbiScalar::U64,
        };
        match self {
            Self::Bool | Self::U8 => AbiScalar::U8,
            Self::I8 => AbiScalar::I8,
            Self::I16 => AbiScalar::I16,
            Self::U16 => AbiScalar::U16,
            Self::I32 => AbiScalar::I32,
            Self::U32 => AbiScalar::U32,
            Self::I64 => AbiScalar::I64,
            Self::U64 => AbiScalar::U64,
            Self::F32 => AbiScalar::F32,
            Self::F64 => AbiScalar::F64,
            Self::Long => wide(platform.long_size, true),
            Self::ULong => wide(platform.long_size, false),
            Self::Size => wide(platform.pointer_size, false),
        }
    }
}

/// Index of a struct inside its [`TypeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructId(u32);

impl StructId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Description of a foreign type.
///
/// Structs are referenced by id so that recursive shapes such as
/// `struct Node { Node* next; }` can be written down. Whether a shape is
/// actually acceptable is decided by [`crate::TypeValidator`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    Scalar(ScalarKind),
    Struct(StructId),
    FixedArray {
        element: Box<TypeDesc>,
        /// `None` when the length is only known at call time.
        length: Option<usize>,
    },
    Pointer(Box<TypeDesc>),
    /// NUL-terminated single-byte ASCII text.
    CString,
    /// An address with no known pointee.
    Opaque,
}

impl TypeDesc {
    pub const BOOL: TypeDesc = TypeDesc::Scalar(ScalarKind::Bool);
    pub const I8: TypeDesc = TypeDesc::Scalar(ScalarKind::I8);
    pub const U8: TypeDesc = TypeDesc::Scalar(ScalarKind::U8);
    pub const I16: TypeDesc = TypeDesc::Scalar(ScalarKind::I16);
    pub const U16: TypeDesc = TypeDesc::Scalar(ScalarKind::U16);
    pub const I32: TypeDesc = TypeDesc::Scalar(ScalarKind::I32);
    pub const U32: TypeDesc = TypeDesc::Scalar(ScalarKind::U32);
    pub const I64: TypeDesc = TypeDesc::Scalar(ScalarKind::I64);
    pub const U64: TypeDesc = TypeDesc::Scalar(ScalarKind::U64);
    pub const F32: TypeDesc = TypeDesc::Scalar(ScalarKind::F32);
    pub const F64: TypeDesc = TypeDesc::Scalar(ScalarKind::F64);
    pub const LONG: TypeDesc = TypeDesc::Scalar(ScalarKind::Long);
    pub const ULONG: TypeDesc = TypeDesc::Scalar(ScalarKind::ULong);
    pub const SIZE: TypeDesc = TypeDesc::Scalar(ScalarKind::Size);

    pub fn array(element: TypeDesc, length: usize) -> TypeDesc {
        TypeDesc::FixedArray {
            element: Box::new(element),
            length: Some(length),
        }
    }

    pub fn unsized_array(element: TypeDesc) -> TypeDesc {
        TypeDesc::FixedArray {
            element: Box::new(element),
            length: None,
        }
    }

    pub fn pointer(pointee: TypeDesc) -> TypeDesc {
        TypeDesc::Pointer(Box::new(pointee))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, TypeDesc::Scalar(_) | TypeDesc::Opaque)
    }

    /// Human readable rendering, C-like.
    pub fn describe(&self, table: &TypeTable) -> String {
        match self {
            TypeDesc::Scalar(kind) => kind.name().to_string(),
            TypeDesc::Struct(id) => match table.get(*id) {
                Some(def) => format!("struct {}", def.name),
                None => format!("struct #{}", id.index()),
            },
            TypeDesc::FixedArray {
                element,
                length: Some(n),
            } => format!("{}[{n}]", element.describe(table)),
            TypeDesc::FixedArray {
                element,
                length: None,
            } => format!("{}[]", element.describe(table)),
            TypeDesc::Pointer(pointee) => {
                format!("{}*", pointee.describe(table))
            }
            TypeDesc::CString => "char*".to_string(),
            TypeDesc::Opaque => "void*".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: TypeDesc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDef {
    pub name: String,
    /// `None` while the struct is only forward declared.
    pub fields: Option<Vec<Field>>,
}

/// Owns every struct shape of one interface.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    structs: Vec<StructDef>,
    by_name: HashMap<String, StructId>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward declares `name`; declaring an existing name returns its id.
    pub fn declare(&mut self, name: &str) -> StructId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = StructId(self.structs.len() as u32);
        self.structs.push(StructDef {
            name: name.to_string(),
            fields: None,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn define(
        &mut self,
        id: StructId,
        fields: Vec<Field>,
    ) -> Result<(), TypeTableError> {
        let def = self
            .structs
            .get_mut(id.index())
            .ok_or(TypeTableError::UnknownStruct { index: id.index() })?;
        if def.fields.is_some() {
            return Err(TypeTableError::AlreadyDefined {
                name: def.name.clone(),
            });
        }
        def.fields = Some(fields);
        Ok(())
    }

    pub fn define_struct<'a, I>(
        &mut self,
        name: &str,
        fields: I,
    ) -> Result<StructId, TypeTableError>
    where
        I: IntoIterator<Item = (&'a str, TypeDesc)>,
    {
        let id = self.declare(name);
        let fields = fields
            .into_iter()
            .map(|(name, ty)| Field {
                name: name.to_string(),
                ty,
            })
            .collect();
        self.define(id, fields)?;
        Ok(id)
    }

    pub fn get(&self, id: StructId) -> Option<&StructDef> {
        self.structs.get(id.index())
    }

    pub fn lookup(&self, name: &str) -> Option<StructId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.structs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_declaration_allows_self_pointer() {
        let mut table = TypeTable::new();
        let node = table.declare("Node");
        table
            .define(
                node,
                vec![Field {
                    name: "next".to_string(),
                    ty: TypeDesc::pointer(TypeDesc::Struct(node)),
                }],
            )
            .expect("define node");
        assert_eq!(table.lookup("Node"), Some(node));
        assert_eq!(
            TypeDesc::pointer(TypeDesc::Struct(node)).describe(&table),
            "struct Node*"
        );
    }

    #[test]
    fn defining_twice_is_rejected() {
        let mut table = TypeTable::new();
        table
            .define_struct("Point", [("x", TypeDesc::I32)])
            .expect("first definition");
        let err = table
            .define_struct("Point", [("y", TypeDesc::I32)])
            .unwrap_err();
        assert_eq!(
            err,
            TypeTableError::AlreadyDefined {
                name: "Point".to_string()
            }
        );
    }

    #[test]
    fn long_follows_platform_width() {
        assert_eq!(ScalarKind::Long.size(&Platform::LP64), 8);
        assert_eq!(ScalarKind::Long.size(&Platform::LLP64), 4);
        assert_eq!(ScalarKind::Long.abi(&Platform::LLP64), AbiScalar::I32);
        assert_eq!(ScalarKind::ULong.abi(&Platform::LP64), AbiScalar::U64);
        assert_eq!(ScalarKind::Size.abi(&Platform::ILP32), AbiScalar::U32);
        assert_eq!(ScalarKind::Bool.abi(&Platform::LP64), AbiScalar::U8);
    }

    #[test]
    fn describe_renders_arrays() {
        let table = TypeTable::new();
        assert_eq!(
            TypeDesc::array(TypeDesc::F64, 10).describe(&table),
            "f64[10]"
        );
        assert_eq!(
            TypeDesc::pointer(TypeDesc::unsized_array(TypeDesc::F64))
                .describe(&table),
            "f64[]*"
        );
    }
}
