use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::{
    InvalidTypeError, InvalidTypeReason, PassingMode, StructId, TypeDesc,
    TypeTable,
};

/// Checks that a type graph can be laid out.
///
/// Every struct reachable by value must be defined, non-empty and must not
/// contain itself. Pointers may close cycles: a pointee is checked as a
/// separate root instead of extending the containment path. Structs that
/// passed are remembered for the lifetime of the validator.
#[derive(Debug)]
pub struct TypeValidator {
    table: Arc<TypeTable>,
    verified: HashSet<StructId>,
}

impl TypeValidator {
    pub fn new(table: Arc<TypeTable>) -> Self {
        Self {
            table,
            verified: HashSet::new(),
        }
    }

    pub fn validate(&mut self, ty: &TypeDesc) -> Result<(), InvalidTypeError> {
        let table = Arc::clone(&self.table);
        self.run(&table, ty)
    }

    /// Like [`TypeValidator::validate`], except that the value behind a
    /// by-reference parameter may be an array whose length is only known
    /// at call time.
    pub fn validate_parameter(
        &mut self,
        ty: &TypeDesc,
        mode: PassingMode,
    ) -> Result<(), InvalidTypeError> {
        let table = Arc::clone(&self.table);
        match (mode, ty) {
            (
                PassingMode::ByReference { .. },
                TypeDesc::FixedArray {
                    element,
                    length: None,
                },
            ) => self.run(&table, element),
            _ => self.run(&table, ty),
        }
    }

    pub fn validate_return(
        &mut self,
        ty: Option<&TypeDesc>,
    ) -> Result<(), InvalidTypeError> {
        match ty {
            Some(ty) => self.validate(ty),
            None => Ok(()),
        }
    }

    pub fn is_verified(&self, id: StructId) -> bool {
        self.verified.contains(&id)
    }

    fn run<'a>(
        &mut self,
        table: &'a TypeTable,
        root: &'a TypeDesc,
    ) -> Result<(), InvalidTypeError> {
        let mut pending = VecDeque::from([root]);
        while let Some(ty) = pending.pop_front() {
            let mut path = Vec::new();
            let mut local = HashSet::new();
            self.visit(table, ty, &mut path, &mut local, &mut pending)?;
            self.verified.extend(local);
        }
        Ok(())
    }

    fn visit<'a>(
        &self,
        table: &'a TypeTable,
        ty: &'a TypeDesc,
        path: &mut Vec<StructId>,
        local: &mut HashSet<StructId>,
        pending: &mut VecDeque<&'a TypeDesc>,
    ) -> Result<(), InvalidTypeError> {
        let invalid = |reason| InvalidTypeError {
            ty: ty.describe(table),
            reason,
        };
        match ty {
            TypeDesc::Scalar(_) | TypeDesc::CString | TypeDesc::Opaque => {
                Ok(())
            }
            TypeDesc::Pointer(pointee) => {
                pending.push_back(pointee);
                Ok(())
            }
            TypeDesc::FixedArray { length: None, .. } => {
                Err(invalid(InvalidTypeReason::UnannotatedArrayLength))
            }
            TypeDesc::FixedArray {
                length: Some(0), ..
            } => Err(invalid(InvalidTypeReason::ZeroLengthArray)),
            TypeDesc::FixedArray { element, .. } => {
                self.visit(table, element, path, local, pending)
            }
            TypeDesc::Struct(id) => {
                if self.verified.contains(id) || local.contains(id) {
                    return Ok(());
                }
                if let Some(start) = path.iter().position(|p| p == id) {
                    let path = path[start..]
                        .iter()
                        .chain(std::iter::once(id))
                        .map(|id| TypeDesc::Struct(*id).describe(table))
                        .collect();
                    return Err(invalid(InvalidTypeReason::ValueCycle { path }));
                }
                let def = table
                    .get(*id)
                    .ok_or_else(|| invalid(InvalidTypeReason::UnknownStruct))?;
                let fields = def.fields.as_ref().ok_or_else(|| {
                    invalid(InvalidTypeReason::UndefinedStruct {
                        name: def.name.clone(),
                    })
                })?;
                if fields.is_empty() {
                    return Err(invalid(InvalidTypeReason::EmptyStruct {
                        name: def.name.clone(),
                    }));
                }

                path.push(*id);
                for field in fields {
                    if let Err(err) =
                        self.visit(table, &field.ty, path, local, pending)
                    {
                        path.pop();
                        return Err(err);
                    }
                }
                path.pop();
                local.insert(*id);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Field;

    fn field(name: &str, ty: TypeDesc) -> Field {
        Field {
            name: name.to_string(),
            ty,
        }
    }

    #[test]
    fn value_cycle_is_rejected() {
        let mut table = TypeTable::new();
        let a = table.declare("A");
        let b = table.declare("B");
        table.define(a, vec![field("b", TypeDesc::Struct(b))]).unwrap();
        table.define(b, vec![field("a", TypeDesc::Struct(a))]).unwrap();
        let mut validator = TypeValidator::new(Arc::new(table));

        let err = validator.validate(&TypeDesc::Struct(a)).unwrap_err();
        assert_eq!(
            err.reason,
            InvalidTypeReason::ValueCycle {
                path: vec![
                    "struct A".to_string(),
                    "struct B".to_string(),
                    "struct A".to_string()
                ]
            }
        );
    }

    #[test]
    fn cycle_through_pointer_is_accepted() {
        let mut table = TypeTable::new();
        let a = table.declare("A");
        let b = table.declare("B");
        table
            .define(a, vec![field("b", TypeDesc::pointer(TypeDesc::Struct(b)))])
            .unwrap();
        table
            .define(
                b,
                vec![
                    field("a", TypeDesc::Struct(a)),
                    field("n", TypeDesc::I32),
                ],
            )
            .unwrap();
        let mut validator = TypeValidator::new(Arc::new(table));

        validator.validate(&TypeDesc::Struct(a)).unwrap();
        validator.validate(&TypeDesc::Struct(b)).unwrap();
        assert!(validator.is_verified(a));
        assert!(validator.is_verified(b));
    }

    #[test]
    fn self_referential_list_is_accepted() {
        let mut table = TypeTable::new();
        let node = table.declare("Node");
        table
            .define(
                node,
                vec![
                    field("value", TypeDesc::I64),
                    field("next", TypeDesc::pointer(TypeDesc::Struct(node))),
                ],
            )
            .unwrap();
        let mut validator = TypeValidator::new(Arc::new(table));
        validator
            .validate(&TypeDesc::pointer(TypeDesc::Struct(node)))
            .unwrap();
    }

    #[test]
    fn unannotated_array_only_behind_reference_parameter() {
        let mut table = TypeTable::new();
        let holder = table
            .define_struct(
                "Holder",
                [("values", TypeDesc::unsized_array(TypeDesc::F64))],
            )
            .unwrap();
        let mut validator = TypeValidator::new(Arc::new(table));
        let doubles = TypeDesc::unsized_array(TypeDesc::F64);

        let err = validator.validate(&TypeDesc::Struct(holder)).unwrap_err();
        assert_eq!(err.reason, InvalidTypeReason::UnannotatedArrayLength);
        assert!(validator.validate(&doubles).is_err());
        assert!(
            validator
                .validate_parameter(&doubles, PassingMode::ByValue)
                .is_err()
        );
        validator
            .validate_parameter(
                &doubles,
                PassingMode::ByReference { write_back: true },
            )
            .unwrap();
        assert!(
            validator
                .validate_parameter(
                    &TypeDesc::unsized_array(doubles.clone()),
                    PassingMode::ByReference { write_back: true },
                )
                .is_err()
        );
    }

    #[test]
    fn pointer_inside_struct_to_unsized_array_is_rejected() {
        let mut table = TypeTable::new();
        let holder = table
            .define_struct(
                "Holder",
                [(
                    "values",
                    TypeDesc::pointer(TypeDesc::unsized_array(TypeDesc::F64)),
                )],
            )
            .unwrap();
        let mut validator = TypeValidator::new(Arc::new(table));
        let err = validator.validate(&TypeDesc::Struct(holder)).unwrap_err();
        assert_eq!(err.reason, InvalidTypeReason::UnannotatedArrayLength);
    }

    #[test]
    fn under_defined_structs_are_rejected() {
        let mut table = TypeTable::new();
        let forward = table.declare("Forward");
        let empty = table
            .define_struct("Empty", Vec::<(&str, TypeDesc)>::new())
            .unwrap();
        let mut validator = TypeValidator::new(Arc::new(table));

        assert_eq!(
            validator
                .validate(&TypeDesc::pointer(TypeDesc::Struct(forward)))
                .unwrap_err()
                .reason,
            InvalidTypeReason::UndefinedStruct {
                name: "Forward".to_string()
            }
        );
        assert_eq!(
            validator.validate(&TypeDesc::Struct(empty)).unwrap_err().reason,
            InvalidTypeReason::EmptyStruct {
                name: "Empty".to_string()
            }
        );
        assert_eq!(
            validator
                .validate(&TypeDesc::array(TypeDesc::I8, 0))
                .unwrap_err()
                .reason,
            InvalidTypeReason::ZeroLengthArray
        );
    }

    #[test]
    fn struct_from_another_table_is_unknown() {
        let mut other = TypeTable::new();
        other.declare("A");
        let foreign = other.declare("B");
        let mut validator = TypeValidator::new(Arc::new(TypeTable::new()));
        let err = validator.validate(&TypeDesc::Struct(foreign)).unwrap_err();
        assert_eq!(err.reason, InvalidTypeReason::UnknownStruct);
    }

    #[test]
    fn void_return_is_valid() {
        let mut validator = TypeValidator::new(Arc::new(TypeTable::new()));
        validator.validate_return(None).unwrap();
        validator.validate_return(Some(&TypeDesc::CString)).unwrap();
    }
}
