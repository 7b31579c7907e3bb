use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::{
    Adapter, ArenaProvider, BindError, CallError, CallErrorKind, CallPhase,
    CallPrimitive, DynamicLibraries, InvalidTypeError, LayoutCalculator,
    LayoutError, LibffiCaller, LinkerCreateInfo, LinkerSettings,
    OperationSignature, PassingMode, ScopeProvider, SymbolResolver, TypeDesc,
    TypeTable, TypeValidator, Value,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDecl {
    pub name: String,
    pub ty: TypeDesc,
    pub mode: PassingMode,
}

/// Declaration of one foreign function as written by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDecl {
    pub name: String,
    /// Native symbol, when it differs from `name`.
    pub symbol: Option<String>,
    pub params: Vec<ParamDecl>,
    pub ret: Option<TypeDesc>,
}

impl OperationDecl {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            symbol: None,
            params: Vec::new(),
            ret: None,
        }
    }

    pub fn symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }

    pub fn param(self, name: &str, ty: TypeDesc) -> Self {
        self.with_param(name, ty, PassingMode::ByValue)
    }

    /// `ty` is the type behind the pointer; the callee's writes are copied
    /// back into the argument's [`crate::Ref`].
    pub fn param_by_ref(self, name: &str, ty: TypeDesc) -> Self {
        self.with_param(name, ty, PassingMode::ByReference { write_back: true })
    }

    /// Like [`OperationDecl::param_by_ref`] without the copy back.
    pub fn param_no_side_effect(self, name: &str, ty: TypeDesc) -> Self {
        self.with_param(
            name,
            ty,
            PassingMode::ByReference { write_back: false },
        )
    }

    pub fn returns(mut self, ty: TypeDesc) -> Self {
        self.ret = Some(ty);
        self
    }

    fn with_param(
        mut self,
        name: &str,
        ty: TypeDesc,
        mode: PassingMode,
    ) -> Self {
        self.params.push(ParamDecl {
            name: name.to_string(),
            ty,
            mode,
        });
        self
    }
}

/// A set of operations sharing one type table.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub types: Arc<TypeTable>,
    pub operations: Vec<OperationDecl>,
}

impl Interface {
    pub fn new(name: &str, types: TypeTable) -> Self {
        Self {
            name: name.to_string(),
            types: Arc::new(types),
            operations: Vec::new(),
        }
    }

    pub fn operation(mut self, decl: OperationDecl) -> Self {
        self.operations.push(decl);
        self
    }
}

pub struct Linker {
    settings: LinkerSettings,
    resolver: Arc<dyn SymbolResolver>,
    primitive: Arc<dyn CallPrimitive>,
    scopes: Arc<dyn ScopeProvider>,
}

impl fmt::Debug for Linker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linker")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Linker {
    pub fn new(info: LinkerCreateInfo) -> Self {
        let settings = LinkerSettings::from(info);
        let resolver = DynamicLibraries::new(settings.search_paths.clone());
        let scopes = ArenaProvider::new(settings.arena_chunk_size);
        Self {
            settings,
            resolver: Arc::new(resolver),
            primitive: Arc::new(LibffiCaller),
            scopes: Arc::new(scopes),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SymbolResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_primitive(mut self, primitive: Arc<dyn CallPrimitive>) -> Self {
        self.primitive = primitive;
        self
    }

    pub fn with_scopes(mut self, scopes: Arc<dyn ScopeProvider>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn settings(&self) -> &LinkerSettings {
        &self.settings
    }

    /// Builds an adapter for every operation of `interface`, resolving
    /// symbols in `library`.
    ///
    /// Either every operation binds or none does.
    ///
    /// # Safety
    /// Each declared signature must match the native function it resolves
    /// to. A mismatch is undefined behavior on the first call.
    pub unsafe fn bind(
        &self,
        interface: &Interface,
        library: &str,
    ) -> Result<Binding, BindError> {
        if !self.settings.platform.is_host() {
            return Err(BindError::ForeignPlatform);
        }

        let mut names = HashSet::new();
        for decl in &interface.operations {
            if !names.insert(decl.name.as_str()) {
                return Err(BindError::DuplicateOperation {
                    operation: decl.name.clone(),
                });
            }
        }

        let signatures: Vec<_> = interface
            .operations
            .iter()
            .map(OperationSignature::from_decl)
            .collect();

        let mut validator = TypeValidator::new(Arc::clone(&interface.types));
        let mut layouts =
            LayoutCalculator::new(
                Arc::clone(&interface.types),
                self.settings.platform,
            );
        for signature in &signatures {
            let invalid = |item: &str, source: InvalidTypeError| {
                BindError::InvalidType {
                    operation: signature.name.clone(),
                    item: item.to_string(),
                    source,
                }
            };
            let layout = |item: &str, source: LayoutError| BindError::Layout {
                operation: signature.name.clone(),
                item: item.to_string(),
                source,
            };
            for param in &signature.params {
                validator
                    .validate_parameter(&param.ty, param.mode)
                    .map_err(|err| invalid(&param.name, err))?;
                layouts
                    .prepare(&param.ty)
                    .map_err(|err| layout(&param.name, err))?;
            }
            validator
                .validate_return(signature.ret.as_ref())
                .map_err(|err| invalid("return", err))?;
            if let Some(ret) = &signature.ret {
                layouts.prepare(ret).map_err(|err| layout("return", err))?;
            }
        }
        let layouts = Arc::new(layouts);

        let mut adapters = Vec::with_capacity(signatures.len());
        let mut index = HashMap::with_capacity(signatures.len());
        for signature in signatures {
            let descriptor = signature.call_descriptor(&layouts)?;
            let code = self
                .resolver
                .lookup(library, &signature.symbol)
                .ok_or_else(|| BindError::SymbolNotFound {
                    library: library.to_string(),
                    symbol: signature.symbol.clone(),
                })?;
            log::debug!(
                "{}::{} -> {library}:{} at {:#x}",
                interface.name,
                signature.name,
                signature.symbol,
                code.address()
            );
            let call = self.primitive.prepare(code, &descriptor).map_err(
                |source| BindError::Prepare {
                    operation: signature.name.clone(),
                    source,
                },
            )?;
            index.insert(signature.name.clone(), adapters.len());
            adapters.push(Adapter::new(
                signature,
                Arc::clone(&layouts),
                call,
                Arc::clone(&self.scopes),
            ));
        }

        log::debug!(
            "bound {} operations of `{}` from `{library}`",
            adapters.len(),
            interface.name
        );
        Ok(Binding {
            adapters,
            index,
            _resolver: Arc::clone(&self.resolver),
        })
    }
}

/// The callable result of [`Linker::bind`].
pub struct Binding {
    adapters: Vec<Adapter>,
    index: HashMap<String, usize>,
    // keeps loaded libraries mapped while adapters point into them
    _resolver: Arc<dyn SymbolResolver>,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("adapters", &self.adapters)
            .finish_non_exhaustive()
    }
}

impl Binding {
    pub fn call(
        &self,
        operation: &str,
        args: &[Value],
    ) -> Result<Value, CallError> {
        match self.operation(operation) {
            Some(adapter) => adapter.invoke(args),
            None => Err(CallError::new(
                operation,
                CallPhase::Start,
                CallErrorKind::UnknownOperation,
            )),
        }
    }

    pub fn operation(&self, name: &str) -> Option<&Adapter> {
        self.index.get(name).map(|&i| &self.adapters[i])
    }

    pub fn operations(&self) -> impl Iterator<Item = &Adapter> {
        self.adapters.iter()
    }
}
