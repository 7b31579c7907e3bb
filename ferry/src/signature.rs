use crate::{
    AbiScalar, AbiType, BindError, CallDescriptor, LayoutCalculator,
    OperationDecl, TypeDesc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassingMode {
    ByValue,
    /// The argument is a [`crate::Ref`] whose value is handed to the callee
    /// through a temporary buffer. With `write_back` the buffer is decoded
    /// into the cell after the call.
    ByReference { write_back: bool },
}

impl PassingMode {
    pub fn is_by_reference(self) -> bool {
        matches!(self, PassingMode::ByReference { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    /// For by-reference parameters this is the type behind the pointer.
    pub ty: TypeDesc,
    pub mode: PassingMode,
}

/// Normalized description of one foreign operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSignature {
    pub name: String,
    pub symbol: String,
    pub params: Vec<Parameter>,
    pub ret: Option<TypeDesc>,
}

impl OperationSignature {
    /// A by-value `Pointer(T)` parameter becomes a by-reference `T` that is
    /// written back.
    pub fn from_decl(decl: &OperationDecl) -> Self {
        let params = decl
            .params
            .iter()
            .map(|param| match (&param.ty, param.mode) {
                (TypeDesc::Pointer(pointee), PassingMode::ByValue) => {
                    Parameter {
                        name: param.name.clone(),
                        ty: (**pointee).clone(),
                        mode: PassingMode::ByReference { write_back: true },
                    }
                }
                (ty, mode) => Parameter {
                    name: param.name.clone(),
                    ty: ty.clone(),
                    mode,
                },
            })
            .collect();
        Self {
            name: decl.name.clone(),
            symbol: decl.symbol.clone().unwrap_or_else(|| decl.name.clone()),
            params,
            ret: decl.ret.clone(),
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Whether a call has to allocate temporary foreign memory.
    pub fn needs_scope(&self) -> bool {
        let params = self.params.iter().any(|param| {
            param.mode.is_by_reference() || !param.ty.is_scalar()
        });
        let ret = matches!(
            self.ret,
            Some(TypeDesc::Struct(_) | TypeDesc::FixedArray { .. })
        );
        params || ret
    }

    pub fn call_descriptor(
        &self,
        layouts: &LayoutCalculator,
    ) -> Result<CallDescriptor, BindError> {
        let layout_error = |item: &str, source| BindError::Layout {
            operation: self.name.clone(),
            item: item.to_string(),
            source,
        };
        let params = self
            .params
            .iter()
            .map(|param| match (param.mode, &param.ty) {
                (PassingMode::ByReference { .. }, _)
                | (PassingMode::ByValue, TypeDesc::FixedArray { .. }) => {
                    Ok(AbiType::Scalar(AbiScalar::Pointer))
                }
                (PassingMode::ByValue, ty) => layouts
                    .abi_type(ty)
                    .map_err(|err| layout_error(&param.name, err)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let ret = match &self.ret {
            None => None,
            Some(TypeDesc::FixedArray { .. }) => {
                return Err(BindError::UnsupportedSignature {
                    operation: self.name.clone(),
                    reason: "arrays cannot be returned by value",
                });
            }
            Some(ty) => Some(
                layouts
                    .abi_type(ty)
                    .map_err(|err| layout_error("return", err))?,
            ),
        };
        Ok(CallDescriptor { params, ret })
    }
}
