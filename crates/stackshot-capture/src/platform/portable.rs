//! Targets without an ELF loader. Symbols and lines come from the
//! `backtrace` crate's resolver. Module bases come from `dladdr` on Unix and
//! from the unwinder itself on Windows; there is no module registry.

use super::{Anchor, Platform};
use crate::resolve::lookup_address;
use crate::{DebugInfo, WalkStrategy};
use stackshot_types::{DebugRecord, FrameModule, ModuleInfo, SourceLocation, SymbolHint};
use std::cell::RefCell;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PortablePlatform {
    /// Module bases reported by the unwinder, keyed by lookup address.
    walked_bases: RefCell<HashMap<u64, u64>>,
}

/// Holds the location found alongside the last symbol lookup, since the
/// resolver reports both at once.
pub struct PortableSession {
    load_lines: bool,
    last: Option<(u64, Option<SourceLocation>)>,
    walked_bases: HashMap<u64, u64>,
}

impl Platform for PortablePlatform {
    type Session = PortableSession;

    fn walk(
        &self,
        anchor: &Anchor,
        strategy: WalkStrategy,
        max_frames: usize,
        skip_frames: usize,
    ) -> Vec<u64> {
        let frames = crate::walk::walk_frames(anchor, strategy, max_frames, skip_frames);
        let mut bases = self.walked_bases.borrow_mut();
        frames
            .into_iter()
            .map(|frame| {
                if let Some(base) = frame.module_base {
                    bases.insert(lookup_address(frame.ip), base);
                }
                frame.ip
            })
            .collect()
    }

    fn enumerate_modules(&self) -> Vec<ModuleInfo> {
        Vec::new()
    }

    fn open_session(&self, debug_info: DebugInfo) -> PortableSession {
        PortableSession {
            load_lines: debug_info == DebugInfo::Load,
            last: None,
            walked_bases: self.walked_bases.take(),
        }
    }

    fn lookup_symbol(&self, session: &mut PortableSession, address: u64) -> SymbolHint {
        let mut symbol = None::<String>;
        let mut location = None::<SourceLocation>;

        backtrace::resolve(address as usize as *mut std::ffi::c_void, |resolved| {
            if symbol.is_none()
                && let Some(name) = resolved.name()
            {
                symbol = Some(String::from_utf8_lossy(name.as_bytes()).into_owned());
            }
            if location.is_none()
                && let Some(file) = resolved.filename()
            {
                location = Some(SourceLocation::new(
                    file.to_string_lossy(),
                    resolved.lineno(),
                    resolved.colno(),
                ));
            }
        });
        session.last = Some((address, location));

        let loader = loader_hint(address);
        SymbolHint {
            symbol: symbol.or(loader.symbol),
            module_base: loader
                .module_base
                .or_else(|| session.walked_bases.get(&address).copied()),
            module_path: loader.module_path,
        }
    }

    fn lookup_debug(
        &self,
        session: &mut PortableSession,
        address: u64,
        _module: Option<&FrameModule>,
        _load_bias: Option<u64>,
    ) -> DebugRecord {
        if !session.load_lines {
            return DebugRecord::default();
        }
        let location = match session.last.take() {
            Some((last_address, location)) if last_address == address => location,
            _ => None,
        };
        DebugRecord {
            symbol: None,
            location,
        }
    }
}

#[cfg(unix)]
fn loader_hint(address: u64) -> SymbolHint {
    super::dladdr::lookup(address)
}

#[cfg(not(unix))]
fn loader_hint(_address: u64) -> SymbolHint {
    SymbolHint::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwinder_module_base_reaches_the_hint() {
        let platform = PortablePlatform::default();
        platform.walked_bases.borrow_mut().insert(0x10ff, 0x1000);

        let mut session = platform.open_session(DebugInfo::Off);
        assert!(platform.walked_bases.borrow().is_empty());

        let hint = platform.lookup_symbol(&mut session, 0x10ff);
        assert_eq!(hint.module_base, Some(0x1000));
        assert_eq!(
            platform.lookup_debug(&mut session, 0x10ff, None, None),
            DebugRecord::default()
        );
    }

    #[cfg(unix)]
    #[test]
    fn own_code_has_a_module_base() {
        #[inline(never)]
        fn marker() -> u64 {
            std::hint::black_box(3)
        }

        let platform = PortablePlatform::default();
        let mut session = platform.open_session(DebugInfo::Load);
        let address = marker as *const () as usize as u64;
        let hint = platform.lookup_symbol(&mut session, address);
        assert!(hint.module_base.is_some_and(|base| base != 0 && base <= address));
        assert_eq!(marker(), 3);
    }
}
