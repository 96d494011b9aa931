use crate::demangle::demangle_or_raw;
use crate::platform::Platform;
use stackshot_types::{FrameModule, ModuleInfo, StackFrame, SymbolHint};

/// Resolves one captured return address.
///
/// Each step (symbol service, registry scan, debug info, demangling) fills
/// its own fields and a failure in one leaves the others alone; in the worst
/// case the frame carries only its address.
pub fn resolve<P: Platform>(
    platform: &P,
    session: &mut P::Session,
    address: u64,
    modules: &[ModuleInfo],
) -> StackFrame {
    let lookup = lookup_address(address);

    let hint = platform.lookup_symbol(session, lookup);
    let (module, load_bias) = owning_module(address, &hint, modules).unzip();
    let record = platform.lookup_debug(session, lookup, module.as_ref(), load_bias.flatten());

    let raw_symbol = hint.symbol.or(record.symbol);
    let function_name = raw_symbol.as_deref().map(demangle_or_raw);

    tracing::trace!(
        address,
        symbol = raw_symbol.as_deref(),
        module = module.as_ref().map(FrameModule::name),
        has_location = record.location.is_some(),
        "resolved frame"
    );

    StackFrame::new(address)
        .with_symbol(raw_symbol, function_name)
        .with_location(record.location)
        .with_module(module)
}

/// Return addresses point just past the call instruction, which may already
/// belong to the next line or function; symbol and line queries use the byte
/// before it.
pub(crate) fn lookup_address(address: u64) -> u64 {
    address.saturating_sub(1)
}

/// Picks the module owning `address`: the first registry range containing it
/// wins over the symbol service's hint, keeping the hint's path when the
/// registry has none. Only registry matches know the load bias.
fn owning_module(
    address: u64,
    hint: &SymbolHint,
    modules: &[ModuleInfo],
) -> Option<(FrameModule, Option<u64>)> {
    if let Some(info) = modules.iter().find(|info| info.contains(address)) {
        let path = if info.path.is_empty() {
            hint.module_path.as_deref().unwrap_or_default()
        } else {
            info.path.as_str()
        };
        match FrameModule::new(address, info.base, path) {
            Ok(module) => return Some((module, Some(info.load_bias))),
            Err(error) => {
                tracing::debug!(address, %error, "registry match rejected");
            }
        }
    }

    let base = hint.module_base?;
    let path = hint.module_path.as_deref().unwrap_or_default();
    match FrameModule::new(address, base, path) {
        Ok(module) => Some((module, None)),
        Err(error) => {
            tracing::debug!(address, %error, "symbol service module hint rejected");
            None
        }
    }
}
