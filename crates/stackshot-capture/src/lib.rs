//! Capture the calling thread's stack and resolve it into [`StackFrame`]s.
//!
//! The pipeline runs in one direction: the walker collects return addresses,
//! the loader's module list is read, and the resolver joins both with symbol
//! and line information. Nothing is cached between calls and nothing here
//! panics on missing or broken metadata; unresolved data is simply absent from
//! the returned frames.
//!
//! ```no_run
//! let frames = stackshot_capture::capture(16, 0);
//! for frame in &frames {
//!     eprintln!("{:#x} {}", frame.address(), frame.function_name());
//! }
//! stackshot_capture::print(0);
//! ```

#[cfg(feature = "custom-containers")]
compile_error!(
    "stackshot-capture: the `custom-containers` feature is not supported; build with the standard containers"
);

mod demangle;
mod format;
mod platform;
mod resolve;
mod walk;


use std::num::NonZeroUsize;

pub use demangle::demangle;
pub use format::{FormatOptions, FrameFormatter, format_frames, write_frames};
pub use platform::{Anchor, NativePlatform, Platform};
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
pub use platform::{DebugInfoError, DebugSession, ElfPlatform};
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
pub use platform::{PortablePlatform, PortableSession};
pub use resolve::resolve;
pub use stackshot_types::{FrameModule, ModuleInfo, SourceLocation, StackFrame};
pub use walk::{WalkError, validate_frame_pointers};

pub const DEFAULT_MAX_FRAMES: usize = 62;
pub const DEFAULT_SKIP_FRAMES: usize = 1;

/// How return addresses are collected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WalkStrategy {
    /// Unwind tables, through the `backtrace` crate.
    #[default]
    Unwind,
    /// Saved frame-pointer chain. Only sound for code built with
    /// `-C force-frame-pointers=yes`; falls back to [`WalkStrategy::Unwind`]
    /// when the chain does not validate.
    FramePointers,
}

/// Whether module images are opened to read symbol and line tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DebugInfo {
    /// Open module images for their symbol and line tables. Each image is
    /// read at most once per capture.
    #[default]
    Load,
    /// Only query in-memory loader state.
    Off,
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub max_frames: NonZeroUsize,
    /// Frames dropped after the capture routine's own frame.
    pub skip_frames: usize,
    pub walk: WalkStrategy,
    pub debug_info: DebugInfo,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_frames: NonZeroUsize::new(DEFAULT_MAX_FRAMES).unwrap_or(NonZeroUsize::MIN),
            skip_frames: DEFAULT_SKIP_FRAMES,
            walk: WalkStrategy::default(),
            debug_info: DebugInfo::default(),
        }
    }
}

/// Captures up to `max_frames` frames, innermost first, starting at the
/// caller of `capture` after dropping `skip_frames` more.
///
/// `max_frames == 0` yields an empty result.
///
/// Uses [`CaptureOptions::default`] otherwise, which means
/// [`DebugInfo::Load`]: module images are opened and read during the call to
/// find line numbers and non-exported symbols. Call [`capture_with`] with
/// [`DebugInfo::Off`] to stay within in-memory loader state.
#[inline(never)]
pub fn capture(max_frames: usize, skip_frames: usize) -> Vec<StackFrame> {
    let anchor = Anchor::here(capture as *const () as usize);
    let Some(max_frames) = NonZeroUsize::new(max_frames) else {
        return Vec::new();
    };
    let options = CaptureOptions {
        max_frames,
        skip_frames,
        ..CaptureOptions::default()
    };
    run(&NativePlatform::default(), &options, &anchor)
}

#[inline(never)]
pub fn capture_with(options: &CaptureOptions) -> Vec<StackFrame> {
    let anchor = Anchor::here(capture_with as *const () as usize);
    run(&NativePlatform::default(), options, &anchor)
}

/// Runs the pipeline over an arbitrary [`Platform`].
#[inline(never)]
pub fn capture_on<P: Platform>(platform: &P, options: &CaptureOptions) -> Vec<StackFrame> {
    let anchor = Anchor::here(capture_on::<P> as *const () as usize);
    run(platform, options, &anchor)
}

/// Writes the current stack to stderr, one flushed line per frame.
///
/// Resolves like [`capture`], including reading module images for line
/// numbers.
#[inline(never)]
pub fn print(skip_frames: usize) {
    let anchor = Anchor::here(print as *const () as usize);
    let options = CaptureOptions {
        skip_frames,
        ..CaptureOptions::default()
    };
    let frames = run(&NativePlatform::default(), &options, &anchor);
    let mut stderr = std::io::stderr().lock();
    let _ = write_frames(&mut stderr, &frames, &FormatOptions::default());
}

fn run<P: Platform>(platform: &P, options: &CaptureOptions, anchor: &Anchor) -> Vec<StackFrame> {
    let addresses = platform.walk(
        anchor,
        options.walk,
        options.max_frames.get(),
        options.skip_frames,
    );
    if addresses.is_empty() {
        tracing::debug!("stack walk produced no frames");
        return Vec::new();
    }

    let modules = platform.enumerate_modules();
    let mut session = platform.open_session(options.debug_info);

    let frames: Vec<StackFrame> = addresses
        .into_iter()
        .take(options.max_frames.get())
        .map(|address| resolve(platform, &mut session, address, &modules))
        .collect();

    tracing::trace!(
        frames = frames.len(),
        modules = modules.len(),
        "stack capture resolved"
    );
    frames
}
