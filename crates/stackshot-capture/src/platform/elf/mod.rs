//! ELF targets: `dl_iterate_phdr` for the module list, `dladdr` as the
//! symbol service, and the module images' own symbol and DWARF tables for
//! names and lines.

mod debug_info;
mod modules;

use super::{Anchor, Platform, dladdr};
use crate::{DebugInfo, WalkStrategy};
pub use debug_info::{DebugInfoError, DebugSession};
use stackshot_types::{DebugRecord, FrameModule, ModuleInfo, SymbolHint};

#[derive(Debug, Default, Clone, Copy)]
pub struct ElfPlatform;

impl Platform for ElfPlatform {
    type Session = DebugSession;

    fn walk(
        &self,
        anchor: &Anchor,
        strategy: WalkStrategy,
        max_frames: usize,
        skip_frames: usize,
    ) -> Vec<u64> {
        crate::walk::walk(anchor, strategy, max_frames, skip_frames)
    }

    fn enumerate_modules(&self) -> Vec<ModuleInfo> {
        modules::enumerate_modules()
    }

    fn open_session(&self, debug_info: DebugInfo) -> DebugSession {
        DebugSession::new(debug_info == DebugInfo::Load)
    }

    fn lookup_symbol(&self, _session: &mut DebugSession, address: u64) -> SymbolHint {
        dladdr::lookup(address)
    }

    fn lookup_debug(
        &self,
        session: &mut DebugSession,
        address: u64,
        module: Option<&FrameModule>,
        load_bias: Option<u64>,
    ) -> DebugRecord {
        let Some(module) = module else {
            return DebugRecord::default();
        };
        match session.lookup(address, module, load_bias) {
            Ok(record) => record,
            Err(error) => {
                tracing::trace!(address, %error, "no debug info for address");
                DebugRecord::default()
            }
        }
    }
}
