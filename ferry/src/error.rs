use std::{error::Error, fmt};

use crate::CallPhase;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeTableError {
    AlreadyDefined { name: String },
    UnknownStruct { index: usize },
}

impl fmt::Display for TypeTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTableError::AlreadyDefined { name } => {
                write!(f, "struct `{name}` is already defined")
            }
            TypeTableError::UnknownStruct { index } => {
                write!(f, "no struct with index {index} in this type table")
            }
        }
    }
}

impl Error for TypeTableError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// A by-value array (or the target of a pointer-to-array) has no
    /// statically known length.
    UnresolvedLength { ty: String },
    Unsupported { ty: String, reason: &'static str },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::UnresolvedLength { ty } => {
                write!(f, "array length of `{ty}` is not statically known")
            }
            LayoutError::Unsupported { ty, reason } => {
                write!(f, "unsupported type `{ty}`: {reason}")
            }
        }
    }
}

impl Error for LayoutError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidTypeReason {
    /// Structs that contain themselves by value, listed along the cycle.
    ValueCycle { path: Vec<String> },
    UnannotatedArrayLength,
    ZeroLengthArray,
    UndefinedStruct { name: String },
    EmptyStruct { name: String },
    UnknownStruct,
}

impl fmt::Display for InvalidTypeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidTypeReason::ValueCycle { path } => {
                write!(
                    f,
                    "struct contains itself by value ({})",
                    path.join(" -> ")
                )
            }
            InvalidTypeReason::UnannotatedArrayLength => {
                f.write_str("array embedded by value needs a static length")
            }
            InvalidTypeReason::ZeroLengthArray => {
                f.write_str("array length must be at least 1")
            }
            InvalidTypeReason::UndefinedStruct { name } => {
                write!(f, "struct `{name}` is declared but never defined")
            }
            InvalidTypeReason::EmptyStruct { name } => {
                write!(f, "struct `{name}` has no fields")
            }
            InvalidTypeReason::UnknownStruct => {
                f.write_str("struct is not in the interface type table")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTypeError {
    pub ty: String,
    pub reason: InvalidTypeReason,
}

impl fmt::Display for InvalidTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid type `{}`: {}", self.ty, self.reason)
    }
}

impl Error for InvalidTypeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    OutOfMemory { size: usize, align: usize },
    InvalidAlignment { align: usize },
    Release { message: String },
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeError::OutOfMemory { size, align } => write!(
                f,
                "failed to allocate {size} bytes (align {align}) for call scope"
            ),
            ScopeError::InvalidAlignment { align } => {
                write!(f, "alignment {align} is not a power of two")
            }
            ScopeError::Release { message } => {
                write!(f, "failed to release call scope: {message}")
            }
        }
    }
}

impl Error for ScopeError {}

/// Closing a call scope failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceReleaseError {
    pub source: ScopeError,
}

impl fmt::Display for ResourceReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource release failed: {}", self.source)
    }
}

impl Error for ResourceReleaseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCallError {
    NullFunction { symbol: String },
    ArityMismatch { expected: usize, got: usize },
    ArgumentMismatch { index: usize, expected: String },
    ReturnBufferTooSmall { required: usize, got: usize },
    Failed { message: String },
}

impl fmt::Display for NativeCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeCallError::NullFunction { symbol } => {
                write!(f, "function pointer for `{symbol}` is null")
            }
            NativeCallError::ArityMismatch { expected, got } => write!(
                f,
                "native call expects {expected} arguments, got {got}"
            ),
            NativeCallError::ArgumentMismatch { index, expected } => write!(
                f,
                "native argument {index} does not match its slot, \
                 expected {expected}"
            ),
            NativeCallError::ReturnBufferTooSmall { required, got } => write!(
                f,
                "return buffer holds {got} bytes, \
                 native return needs {required}"
            ),
            NativeCallError::Failed { message } => {
                write!(f, "native call failed: {message}")
            }
        }
    }
}

impl Error for NativeCallError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    TypeMismatch { expected: String, got: &'static str },
    OutOfRange { kind: &'static str, value: String },
    FieldCount { ty: String, expected: usize, got: usize },
    /// A runtime array length disagrees with its declared length.
    LengthMismatch { declared: usize, actual: usize },
    /// Text outside the single-byte ASCII range, or an interior NUL.
    Encoding { detail: String },
    Layout(LayoutError),
    Scope(ScopeError),
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalError::TypeMismatch { expected, got } => {
                write!(f, "expected a value of type `{expected}`, got {got}")
            }
            MarshalError::OutOfRange { kind, value } => {
                write!(f, "value {value} does not fit in `{kind}`")
            }
            MarshalError::FieldCount { ty, expected, got } => write!(
                f,
                "`{ty}` has {expected} fields but the value has {got}"
            ),
            MarshalError::LengthMismatch { declared, actual } => write!(
                f,
                "array length mismatch: declared {declared}, got {actual}"
            ),
            MarshalError::Encoding { detail } => {
                write!(f, "string is not single-byte ASCII: {detail}")
            }
            MarshalError::Layout(err) => write!(f, "{err}"),
            MarshalError::Scope(err) => write!(f, "{err}"),
        }
    }
}

impl Error for MarshalError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MarshalError::Layout(err) => Some(err),
            MarshalError::Scope(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LayoutError> for MarshalError {
    fn from(err: LayoutError) -> Self {
        MarshalError::Layout(err)
    }
}

impl From<ScopeError> for MarshalError {
    fn from(err: ScopeError) -> Self {
        MarshalError::Scope(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    ForeignPlatform,
    DuplicateOperation { operation: String },
    InvalidType {
        operation: String,
        item: String,
        source: InvalidTypeError,
    },
    Layout {
        operation: String,
        item: String,
        source: LayoutError,
    },
    UnsupportedSignature {
        operation: String,
        reason: &'static str,
    },
    SymbolNotFound { library: String, symbol: String },
    Prepare {
        operation: String,
        source: NativeCallError,
    },
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindError::ForeignPlatform => f.write_str(
                "cannot bind native calls for a platform other than the host",
            ),
            BindError::DuplicateOperation { operation } => {
                write!(f, "operation `{operation}` is declared twice")
            }
            BindError::InvalidType {
                operation,
                item,
                source,
            } => write!(f, "{operation}({item}): {source}"),
            BindError::Layout {
                operation,
                item,
                source,
            } => write!(f, "{operation}({item}): {source}"),
            BindError::UnsupportedSignature { operation, reason } => {
                write!(f, "unsupported signature for `{operation}`: {reason}")
            }
            BindError::SymbolNotFound { library, symbol } => {
                write!(f, "symbol `{symbol}` not found in library `{library}`")
            }
            BindError::Prepare { operation, source } => {
                write!(
                    f,
                    "failed to prepare native call `{operation}`: {source}"
                )
            }
        }
    }
}

impl Error for BindError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BindError::InvalidType { source, .. } => Some(source),
            BindError::Layout { source, .. } => Some(source),
            BindError::Prepare { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallErrorKind {
    UnknownOperation,
    Arity { expected: usize, got: usize },
    OpenScope(ScopeError),
    Marshal(MarshalError),
    Native(NativeCallError),
    Release(ResourceReleaseError),
}

impl fmt::Display for CallErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallErrorKind::UnknownOperation => f.write_str("no such operation"),
            CallErrorKind::Arity { expected, got } => {
                write!(f, "expected {expected} arguments, got {got}")
            }
            CallErrorKind::OpenScope(err) => write!(f, "{err}"),
            CallErrorKind::Marshal(err) => write!(f, "{err}"),
            CallErrorKind::Native(err) => write!(f, "{err}"),
            CallErrorKind::Release(err) => write!(f, "{err}"),
        }
    }
}

/// A single call failed.
///
/// `suppressed` carries a scope release failure that happened while this
/// error was already being reported; it never replaces `kind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub operation: String,
    pub phase: CallPhase,
    pub kind: CallErrorKind,
    pub suppressed: Option<ResourceReleaseError>,
}

impl CallError {
    pub(crate) fn new(
        operation: &str,
        phase: CallPhase,
        kind: CallErrorKind,
    ) -> Self {
        Self {
            operation: operation.to_string(),
            phase,
            kind,
            suppressed: None,
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "call to `{}` failed during {}: {}",
            self.operation, self.phase, self.kind
        )?;
        if let Some(suppressed) = &self.suppressed {
            write!(f, " (suppressed: {suppressed})")?;
        }
        Ok(())
    }
}

impl Error for CallError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.kind {
            CallErrorKind::OpenScope(err) => Some(err),
            CallErrorKind::Marshal(err) => Some(err),
            CallErrorKind::Native(err) => Some(err),
            CallErrorKind::Release(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppressed_release_is_reported_after_primary() {
        let mut err = CallError::new(
            "passPointerToStruct",
            CallPhase::Call,
            CallErrorKind::Native(NativeCallError::Failed {
                message: "boom".to_string(),
            }),
        );
        err.suppressed = Some(ResourceReleaseError {
            source: ScopeError::Release {
                message: "arena poisoned".to_string(),
            },
        });
        let msg = err.to_string();
        let primary = msg.find("boom").expect("primary cause in message");
        let secondary =
            msg.find("arena poisoned").expect("suppressed cause in message");
        assert!(primary < secondary);
        assert!(matches!(
            err.source().and_then(|s| s.downcast_ref::<NativeCallError>()),
            Some(NativeCallError::Failed { .. })
        ));
    }

    #[test]
    fn bind_error_names_symbol_and_library() {
        let err = BindError::SymbolNotFound {
            library: "jfa_validity".to_string(),
            symbol: "missing".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("missing"));
        assert!(msg.contains("jfa_validity"));
    }

    #[test]
    fn marshal_error_exposes_layout_source() {
        let err: MarshalError = LayoutError::UnresolvedLength {
            ty: "[f64]".to_string(),
        }
        .into();
        assert!(err.source().is_some());
        assert!(err.to_string().contains("[f64]"));
    }
}
