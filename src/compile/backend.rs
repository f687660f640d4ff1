//! Code generator contract
//!
//! The engine never generates code itself. A [`CompilerBackend`] turns a
//! request into [`CompiledCode`] or a [`CompileFailure`]; it may consult the
//! request's speculation log to avoid assumptions that already failed.

use std::sync::Arc;

use super::{CompileFailure, CompileRequest, CompiledCode};

pub trait CompilerBackend: Send + Sync {
    fn name(&self) -> &str {
        "backend"
    }

    fn compile(&self, request: &CompileRequest) -> Result<CompiledCode, CompileFailure>;
}

/// "Compiles" a unit into a closure that runs its body.
///
/// The unit switches the frame to the compiled state before invoking the
/// code, so guest bodies observe the tier exactly as they would under a real
/// code generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterpreterBackend;

impl CompilerBackend for InterpreterBackend {
    fn name(&self) -> &str {
        "interpreter"
    }

    fn compile(&self, request: &CompileRequest) -> Result<CompiledCode, CompileFailure> {
        let body = Arc::clone(request.unit().body());
        Ok(CompiledCode::new(request.tier(), body.size(), move |frame| {
            body.execute(frame)
        }))
    }
}
