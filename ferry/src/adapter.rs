use std::fmt;
use std::sync::Arc;

use crate::{
    BoundCall, CallError, CallErrorKind, ForeignValue, LayoutCalculator,
    MarshalContext, MarshalError, OperationSignature, ResourceReleaseError,
    Scalar, Scope, ScopeProvider, TypeDesc, UnmarshalContext, Value,
    scalar_of,
};

/// Step of a single call, reported with every [`CallError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    Start,
    DirectCall,
    OpenScope,
    MarshalArgs,
    Call,
    WriteBackRefs,
    UnmarshalResult,
    CloseScope,
    Return,
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallPhase::Start => "start",
            CallPhase::DirectCall => "direct call",
            CallPhase::OpenScope => "scope open",
            CallPhase::MarshalArgs => "argument marshalling",
            CallPhase::Call => "native call",
            CallPhase::WriteBackRefs => "reference write-back",
            CallPhase::UnmarshalResult => "result unmarshalling",
            CallPhase::CloseScope => "scope close",
            CallPhase::Return => "return",
        })
    }
}

/// Callable form of one declared operation.
///
/// Everything that does not depend on the arguments is computed once when
/// the adapter is built; a call only marshals, invokes and unmarshals.
pub struct Adapter {
    signature: OperationSignature,
    layouts: Arc<LayoutCalculator>,
    call: Box<dyn BoundCall>,
    scopes: Arc<dyn ScopeProvider>,
    needs_scope: bool,
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("signature", &self.signature)
            .field("needs_scope", &self.needs_scope)
            .finish_non_exhaustive()
    }
}

impl Adapter {
    pub(crate) fn new(
        signature: OperationSignature,
        layouts: Arc<LayoutCalculator>,
        call: Box<dyn BoundCall>,
        scopes: Arc<dyn ScopeProvider>,
    ) -> Self {
        let needs_scope = signature.needs_scope();
        log::debug!(
            "adapter for `{}`: {} parameters, {} path",
            signature.name,
            signature.arity(),
            if needs_scope { "scoped" } else { "direct" }
        );
        Self {
            signature,
            layouts,
            call,
            scopes,
            needs_scope,
        }
    }

    pub fn signature(&self) -> &OperationSignature {
        &self.signature
    }

    pub fn needs_scope(&self) -> bool {
        self.needs_scope
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Value, CallError> {
        self.trace(CallPhase::Start);
        if args.len() != self.signature.arity() {
            return Err(self.fail(
                CallPhase::Start,
                CallErrorKind::Arity {
                    expected: self.signature.arity(),
                    got: args.len(),
                },
            ));
        }
        let result = if self.needs_scope {
            self.invoke_scoped(args)
        } else {
            self.invoke_direct(args)
        };
        if result.is_ok() {
            self.trace(CallPhase::Return);
        }
        result
    }

    fn invoke_direct(&self, args: &[Value]) -> Result<Value, CallError> {
        self.trace(CallPhase::DirectCall);
        let platform = self.layouts.platform();
        let raw_args = self
            .signature
            .params
            .iter()
            .zip(args)
            .map(|(param, value)| match &param.ty {
                TypeDesc::Scalar(kind) => {
                    scalar_of(value, *kind, platform).map(ForeignValue::Scalar)
                }
                TypeDesc::Opaque => match value {
                    Value::Address(address) => {
                        Ok(ForeignValue::Scalar(Scalar::Pointer(*address)))
                    }
                    Value::Null => Ok(ForeignValue::Scalar(Scalar::Pointer(0))),
                    other => Err(MarshalError::TypeMismatch {
                        expected: "void*".to_string(),
                        got: other.kind_name(),
                    }),
                },
                other => Err(MarshalError::TypeMismatch {
                    expected: other.describe(self.layouts.table()),
                    got: value.kind_name(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                self.fail(CallPhase::DirectCall, CallErrorKind::Marshal(err))
            })?;

        // SAFETY: the binder vouched for the signature; scalar arguments
        // carry no addresses of ours
        let raw = unsafe { self.call.invoke(&raw_args, None) }.map_err(|err| {
            self.fail(CallPhase::DirectCall, CallErrorKind::Native(err))
        })?;

        match &self.signature.ret {
            None => Ok(Value::Void),
            Some(ty) => {
                self.trace(CallPhase::UnmarshalResult);
                let mut ctx = UnmarshalContext::new(&self.layouts, &[]);
                // SAFETY: a returned pointer is readable by the binder's
                // contract
                unsafe { ctx.unmarshal_result(&raw, ty) }.map_err(|err| {
                    self.fail(
                        CallPhase::UnmarshalResult,
                        CallErrorKind::Marshal(err),
                    )
                })
            }
        }
    }

    fn invoke_scoped(&self, args: &[Value]) -> Result<Value, CallError> {
        self.trace(CallPhase::OpenScope);
        let mut scope = self.scopes.new_scope().map_err(|err| {
            self.fail(CallPhase::OpenScope, CallErrorKind::OpenScope(err))
        })?;

        let outcome = self.run_in_scope(scope.as_mut(), args);

        self.trace(CallPhase::CloseScope);
        match (outcome, scope.close()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(source)) => Err(self.fail(
                CallPhase::CloseScope,
                CallErrorKind::Release(ResourceReleaseError { source }),
            )),
            (Err(err), Ok(())) => Err(err),
            (Err(mut err), Err(source)) => {
                log::warn!(
                    "`{}`: scope release failed after {}: {source}",
                    self.signature.name,
                    err.phase
                );
                err.suppressed = Some(ResourceReleaseError { source });
                Err(err)
            }
        }
    }

    fn run_in_scope(
        &self,
        scope: &mut dyn Scope,
        args: &[Value],
    ) -> Result<Value, CallError> {
        let layouts = &*self.layouts;
        let marshal_error = |err: MarshalError| {
            self.fail(CallPhase::MarshalArgs, CallErrorKind::Marshal(err))
        };

        self.trace(CallPhase::MarshalArgs);
        let mut ctx = MarshalContext::new(layouts, scope);
        let mut raw_args = Vec::with_capacity(args.len());
        for (param, value) in self.signature.params.iter().zip(args) {
            let raw = ctx
                .marshal_parameter(value, param)
                .map_err(marshal_error)?;
            raw_args.push(raw);
        }
        let ret_buffer = match self.call.return_capacity() {
            Some(capacity) => Some(
                ctx.allocate_buffer(capacity, 16).map_err(marshal_error)?,
            ),
            None => None,
        };
        let cells = ctx.finish();

        self.trace(CallPhase::Call);
        // SAFETY: the binder vouched for the signature; every address in
        // raw_args and ret_buffer lives in the open scope
        let raw = unsafe { self.call.invoke(&raw_args, ret_buffer) }
            .map_err(|err| {
                self.fail(CallPhase::Call, CallErrorKind::Native(err))
            })?;

        self.trace(CallPhase::WriteBackRefs);
        let mut unmarshal = UnmarshalContext::new(layouts, &cells);
        for placed in cells.iter().filter(|placed| placed.write_back) {
            // SAFETY: placed buffers live in the open scope
            unsafe {
                unmarshal.writeback_reference(
                    placed.address,
                    &placed.ty,
                    &placed.cell,
                )
            }
            .map_err(|err| {
                self.fail(CallPhase::WriteBackRefs, CallErrorKind::Marshal(err))
            })?;
        }

        self.trace(CallPhase::UnmarshalResult);
        match &self.signature.ret {
            None => Ok(Value::Void),
            // SAFETY: aggregate results sit in ret_buffer, pointers are
            // readable by the binder's contract
            Some(ty) => unsafe { unmarshal.unmarshal_result(&raw, ty) }.map_err(
                |err| {
                    self.fail(
                        CallPhase::UnmarshalResult,
                        CallErrorKind::Marshal(err),
                    )
                },
            ),
        }
    }

    fn fail(&self, phase: CallPhase, kind: CallErrorKind) -> CallError {
        CallError::new(&self.signature.name, phase, kind)
    }

    fn trace(&self, phase: CallPhase) {
        log::trace!("`{}`: {phase}", self.signature.name);
    }
}
