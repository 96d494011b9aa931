use crate::{DebugInfo, WalkStrategy};
use stackshot_types::{DebugRecord, FrameModule, ModuleInfo, SymbolHint};

#[cfg(unix)]
mod dladdr;
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "illumos",
    target_os = "solaris"
))]
mod elf;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "illumos",
    target_os = "solaris"
)))]
mod portable;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "illumos",
    target_os = "solaris"
))]
pub use elf::{DebugInfoError, DebugSession, ElfPlatform, ElfPlatform as NativePlatform};
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "illumos",
    target_os = "solaris"
)))]
pub use portable::{PortablePlatform, PortablePlatform as NativePlatform, PortableSession};

/// The process-introspection services a capture needs.
///
/// Exactly one implementation is compiled in per target family
/// ([`NativePlatform`]); the resolver and formatter only see this trait.
/// Implementations must not fail loudly: every method returns what it could
/// find and nothing more.
pub trait Platform {
    /// Per-capture scratch state, dropped when the capture returns.
    type Session;

    /// Return addresses above `anchor`, innermost first, after dropping
    /// `skip_frames`, at most `max_frames` of them.
    fn walk(
        &self,
        anchor: &Anchor,
        strategy: WalkStrategy,
        max_frames: usize,
        skip_frames: usize,
    ) -> Vec<u64>;

    fn enumerate_modules(&self) -> Vec<ModuleInfo>;

    fn open_session(&self, debug_info: DebugInfo) -> Self::Session;

    fn lookup_symbol(&self, session: &mut Self::Session, address: u64) -> SymbolHint;

    /// `load_bias` is the loader's run-time minus link-time displacement for
    /// `module`, known only when the module came from the registry.
    fn lookup_debug(
        &self,
        session: &mut Self::Session,
        address: u64,
        module: Option<&FrameModule>,
        load_bias: Option<u64>,
    ) -> DebugRecord;
}

/// Marks the public routine a capture started from, so that it and
/// everything it called are left out of the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    entry: usize,
    frame_pointer: Option<usize>,
}

impl Anchor {
    /// Must be called directly in the body of the function whose entry
    /// address is `entry`; the frame pointer read is that function's own.
    #[inline(always)]
    pub fn here(entry: usize) -> Self {
        Self {
            entry,
            frame_pointer: crate::walk::read_frame_pointer(),
        }
    }

    pub fn from_parts(entry: usize, frame_pointer: Option<usize>) -> Self {
        Self {
            entry,
            frame_pointer,
        }
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn frame_pointer(&self) -> Option<usize> {
        self.frame_pointer
    }
}
