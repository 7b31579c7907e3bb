//! Marshalling compiler for calling C-ABI functions with managed values.
//!
//! An [`Interface`] describes foreign operations over a [`TypeTable`].
//! [`Linker::bind`] validates the types, computes their layouts and
//! resolves every symbol, producing a [`Binding`] of ready adapters.

mod adapter;
mod binding;
mod call;
mod error;
mod layout;
mod marshal;
pub mod memory;
mod platform;
mod resolve;
mod scope;
mod settings;
mod signature;
mod types;
mod unmarshal;
mod validate;
mod value;

pub use adapter::{Adapter, CallPhase};
pub use binding::{Binding, Interface, Linker, OperationDecl, ParamDecl};
pub use call::{
    AbiScalar, AbiType, BoundCall, CallDescriptor, CallPrimitive, CodeAddress,
    ForeignValue, LibffiCaller, Scalar,
};
pub use error::{
    BindError, CallError, CallErrorKind, InvalidTypeError, InvalidTypeReason,
    LayoutError, MarshalError, NativeCallError, ResourceReleaseError,
    ScopeError, TypeTableError,
};
pub use layout::{Layout, LayoutCalculator, StructLayout, align_up};
pub use marshal::{MarshalContext, MarshalledCell, scalar_of};
pub use platform::Platform;
pub use resolve::{DynamicLibraries, SymbolResolver, SymbolTable};
pub use scope::{Arena, ArenaProvider, Buffer, Scope, ScopeProvider};
pub use settings::{LinkerCreateInfo, LinkerSettings};
pub use signature::{OperationSignature, Parameter, PassingMode};
pub use types::{Field, ScalarKind, StructDef, StructId, TypeDesc, TypeTable};
pub use unmarshal::{UnmarshalContext, value_of};
pub use validate::TypeValidator;
pub use value::{Ref, Value};
