use crate::WalkStrategy;
use crate::platform::Anchor;
use std::error::Error;
use std::fmt;

/// Frames tolerated between the anchor search starting point and the anchor
/// itself before giving up on finding it.
const MAX_INTERNAL_FRAMES: usize = 32;
const MAX_CHAIN_LINKS: usize = 4096;
const MIN_VALID_CHAIN_DEPTH: usize = 6;
const WORD: usize = std::mem::size_of::<usize>();
/// `[saved frame pointer, return address]`
const FRAME_RECORD_SIZE: usize = 2 * WORD;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkError {
    UnsupportedArchitecture { arch: &'static str },
    UnknownStackBounds,
    NullFramePointer,
    MisalignedFramePointer { frame_ptr: usize },
    FramePointerOutsideStack { frame_ptr: usize },
    NonIncreasingFramePointer { current: usize, previous: usize },
    ShallowChain { depth: usize, min_depth: usize },
}

impl fmt::Display for WalkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedArchitecture { arch } => {
                write!(f, "frame-pointer walking is not supported on {arch}")
            }
            Self::UnknownStackBounds => {
                write!(f, "stack bounds of the current thread are unknown")
            }
            Self::NullFramePointer => write!(f, "current frame pointer is null"),
            Self::MisalignedFramePointer { frame_ptr } => {
                write!(f, "misaligned frame pointer 0x{frame_ptr:x}")
            }
            Self::FramePointerOutsideStack { frame_ptr } => {
                write!(f, "frame pointer 0x{frame_ptr:x} is outside the thread's stack")
            }
            Self::NonIncreasingFramePointer { current, previous } => write!(
                f,
                "frame pointer did not increase: current=0x{current:x}, previous=0x{previous:x}"
            ),
            Self::ShallowChain { depth, min_depth } => write!(
                f,
                "frame pointer chain too shallow: got {depth}, need at least {min_depth}"
            ),
        }
    }
}

impl Error for WalkError {}

/// The current thread's stack, `low..high`. Frame records are only read
/// when they lie entirely inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StackBounds {
    low: usize,
    high: usize,
}

impl StackBounds {
    #[cfg(test)]
    fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn current() -> Option<Self> {
        let mut attr = std::mem::MaybeUninit::<libc::pthread_attr_t>::uninit();
        if unsafe { libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) } != 0 {
            return None;
        }

        let mut stack_addr: *mut std::ffi::c_void = std::ptr::null_mut();
        let mut stack_size: libc::size_t = 0;
        let rc = unsafe { libc::pthread_attr_getstack(attr.as_ptr(), &mut stack_addr, &mut stack_size) };
        unsafe { libc::pthread_attr_destroy(attr.as_mut_ptr()) };
        if rc != 0 || stack_addr.is_null() || stack_size == 0 {
            return None;
        }

        let low = stack_addr as usize;
        let high = low.checked_add(stack_size)?;
        Some(Self { low, high })
    }

    // TODO: pthread_attr_get_np on the BSDs and pthread_get_stackaddr_np on Apple targets.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn current() -> Option<Self> {
        None
    }

    fn holds_record(&self, frame_ptr: usize) -> bool {
        frame_ptr >= self.low
            && frame_ptr
                .checked_add(FRAME_RECORD_SIZE)
                .is_some_and(|end| end <= self.high)
    }
}

/// One return address, with the owning image's base when the unwinder
/// reports it (Windows unwinding does, the others do not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WalkedFrame {
    pub(crate) ip: u64,
    // Only the portable platform reads it; ELF targets have a registry.
    #[allow(dead_code)]
    pub(crate) module_base: Option<u64>,
}

impl WalkedFrame {
    fn bare(ip: u64) -> Self {
        Self {
            ip,
            module_base: None,
        }
    }
}

pub(crate) fn walk(
    anchor: &Anchor,
    strategy: WalkStrategy,
    max_frames: usize,
    skip_frames: usize,
) -> Vec<u64> {
    walk_frames(anchor, strategy, max_frames, skip_frames)
        .into_iter()
        .map(|frame| frame.ip)
        .collect()
}

pub(crate) fn walk_frames(
    anchor: &Anchor,
    strategy: WalkStrategy,
    max_frames: usize,
    skip_frames: usize,
) -> Vec<WalkedFrame> {
    if max_frames == 0 {
        return Vec::new();
    }
    match strategy {
        WalkStrategy::Unwind => walk_unwind(anchor, max_frames, skip_frames),
        WalkStrategy::FramePointers => match frame_pointer_start(anchor) {
            Ok((start, bounds)) => walk_frame_pointers(start, bounds, max_frames, skip_frames)
                .into_iter()
                .map(WalkedFrame::bare)
                .collect(),
            Err(reason) => {
                tracing::debug!(%reason, "frame pointers unusable, unwinding instead");
                walk_unwind(anchor, max_frames, skip_frames)
            }
        },
    }
}

fn frame_pointer_start(anchor: &Anchor) -> Result<(usize, StackBounds), WalkError> {
    let bounds = StackBounds::current().ok_or(WalkError::UnknownStackBounds)?;
    validate_frame_pointers_within(bounds)?;
    let start = anchor
        .frame_pointer()
        .ok_or(WalkError::UnsupportedArchitecture {
            arch: std::env::consts::ARCH,
        })?;
    if !bounds.holds_record(start) {
        return Err(WalkError::FramePointerOutsideStack { frame_ptr: start });
    }
    Ok((start, bounds))
}

/// Walks with unwind tables and cuts everything up to and including the frame
/// whose function entry is the anchor. When the anchor never shows up, the
/// frames are kept from the innermost one.
fn walk_unwind(anchor: &Anchor, max_frames: usize, skip_frames: usize) -> Vec<WalkedFrame> {
    let wanted = skip_frames.saturating_add(max_frames);
    let unanchored_limit = wanted.saturating_add(MAX_INTERNAL_FRAMES);
    let mut frames: Vec<WalkedFrame> = Vec::new();
    let mut anchor_index: Option<usize> = None;

    backtrace::trace(|frame| {
        let ip = frame.ip() as usize as u64;
        if ip == 0 {
            return false;
        }
        let walked = WalkedFrame {
            ip,
            module_base: frame
                .module_base_address()
                .map(|base| base as usize as u64)
                .filter(|base| *base != 0),
        };
        match anchor_index {
            None => {
                if frame.symbol_address() as usize == anchor.entry() {
                    anchor_index = Some(frames.len());
                }
                frames.push(walked);
                anchor_index.is_some() || frames.len() < unanchored_limit
            }
            Some(index) => {
                frames.push(walked);
                frames.len() - index - 1 < wanted
            }
        }
    });

    let start = match anchor_index {
        Some(index) => index + 1,
        None => {
            tracing::debug!(
                entry = anchor.entry(),
                "capture anchor not found while unwinding; keeping innermost frames"
            );
            0
        }
    };

    frames.into_iter()
        .skip(start)
        .skip(skip_frames)
        .take(max_frames)
        .collect()
}

/// Follows saved frame pointers starting at `frame_ptr`, stopping at the
/// first record that is misaligned, leaves `bounds`, or does not move
/// towards the stack's base.
fn walk_frame_pointers(
    mut frame_ptr: usize,
    bounds: StackBounds,
    max_frames: usize,
    skip_frames: usize,
) -> Vec<u64> {
    let mut raw_ips = Vec::new();
    let mut skip_remaining = skip_frames;

    while frame_ptr != 0 && raw_ips.len() < max_frames {
        if frame_ptr % std::mem::align_of::<usize>() != 0 || !bounds.holds_record(frame_ptr) {
            break;
        }

        let next_frame_ptr = unsafe { *(frame_ptr as *const usize) };
        let return_ip = unsafe { *((frame_ptr as *const usize).add(1)) };

        if return_ip != 0 {
            if skip_remaining > 0 {
                skip_remaining -= 1;
            } else {
                raw_ips.push(return_ip as u64);
            }
        }

        if next_frame_ptr == 0 || next_frame_ptr <= frame_ptr {
            break;
        }

        frame_ptr = next_frame_ptr;
    }

    raw_ips
}

/// Checks that the current thread's frame-pointer chain is walkable a few
/// frames deep without leaving the thread's stack.
pub fn validate_frame_pointers() -> Result<(), WalkError> {
    let bounds = StackBounds::current().ok_or(WalkError::UnknownStackBounds)?;
    validate_frame_pointers_within(bounds)
}

fn validate_frame_pointers_within(bounds: StackBounds) -> Result<(), WalkError> {
    #[inline(never)]
    fn layer0(bounds: StackBounds) -> Result<(), WalkError> {
        layer1(bounds)
    }
    #[inline(never)]
    fn layer1(bounds: StackBounds) -> Result<(), WalkError> {
        layer2(bounds)
    }
    #[inline(never)]
    fn layer2(bounds: StackBounds) -> Result<(), WalkError> {
        layer3(bounds)
    }
    #[inline(never)]
    fn layer3(bounds: StackBounds) -> Result<(), WalkError> {
        layer4(bounds)
    }
    #[inline(never)]
    fn layer4(bounds: StackBounds) -> Result<(), WalkError> {
        let frame_ptr = read_frame_pointer().ok_or(WalkError::UnsupportedArchitecture {
            arch: std::env::consts::ARCH,
        })?;
        check_chain(frame_ptr, bounds, MIN_VALID_CHAIN_DEPTH)
    }

    layer0(bounds)
}

/// Counts frame records reachable from `frame_ptr`. A link leaving `bounds`
/// ends the chain; only the first record must be inside.
fn check_chain(mut frame_ptr: usize, bounds: StackBounds, min_depth: usize) -> Result<(), WalkError> {
    if frame_ptr == 0 {
        return Err(WalkError::NullFramePointer);
    }

    let mut prev_frame_ptr = 0usize;
    let mut depth = 0usize;

    for _ in 0..MAX_CHAIN_LINKS {
        if frame_ptr == 0 {
            break;
        }

        if frame_ptr % std::mem::align_of::<usize>() != 0 {
            return Err(WalkError::MisalignedFramePointer { frame_ptr });
        }

        if prev_frame_ptr != 0 && frame_ptr <= prev_frame_ptr {
            return Err(WalkError::NonIncreasingFramePointer {
                current: frame_ptr,
                previous: prev_frame_ptr,
            });
        }

        if !bounds.holds_record(frame_ptr) {
            if depth == 0 {
                return Err(WalkError::FramePointerOutsideStack { frame_ptr });
            }
            break;
        }

        let next_frame_ptr = unsafe { *(frame_ptr as *const usize) };
        depth += 1;
        if next_frame_ptr == 0 {
            break;
        }

        prev_frame_ptr = frame_ptr;
        frame_ptr = next_frame_ptr;
    }

    if depth < min_depth {
        return Err(WalkError::ShallowChain { depth, min_depth });
    }

    Ok(())
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub(crate) fn read_frame_pointer() -> Option<usize> {
    let frame_ptr: usize;
    unsafe {
        core::arch::asm!(
            "mov {}, rbp",
            out(reg) frame_ptr,
            options(nomem, nostack, preserves_flags)
        );
    }
    Some(frame_ptr)
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub(crate) fn read_frame_pointer() -> Option<usize> {
    let frame_ptr: usize;
    unsafe {
        core::arch::asm!(
            "mov {}, x29",
            out(reg) frame_ptr,
            options(nomem, nostack, preserves_flags)
        );
    }
    Some(frame_ptr)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub(crate) fn read_frame_pointer() -> Option<usize> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Three frame records laid out the way a downward-growing stack holds
    /// them, each pointing at the next one up.
    fn synthetic_stack() -> Vec<usize> {
        let mut stack = vec![0usize; 6];
        let base = stack.as_ptr() as usize;
        stack[0] = base + 2 * WORD;
        stack[1] = 0x1111;
        stack[2] = base + 4 * WORD;
        stack[3] = 0x2222;
        stack[4] = 0;
        stack[5] = 0x3333;
        stack
    }

    fn bounds_of(stack: &[usize]) -> StackBounds {
        let low = stack.as_ptr() as usize;
        StackBounds::new(low, low + stack.len() * WORD)
    }

    #[test]
    fn follows_chain_inside_bounds() {
        let stack = synthetic_stack();
        let bounds = bounds_of(&stack);
        let start = stack.as_ptr() as usize;

        assert_eq!(
            walk_frame_pointers(start, bounds, 8, 0),
            vec![0x1111, 0x2222, 0x3333]
        );
        assert_eq!(walk_frame_pointers(start, bounds, 8, 1), vec![0x2222, 0x3333]);
        assert_eq!(walk_frame_pointers(start, bounds, 2, 0), vec![0x1111, 0x2222]);
    }

    #[test]
    fn stops_at_link_leaving_the_stack() {
        let mut stack = synthetic_stack();
        let low = stack.as_ptr() as usize;
        // Points past the end of the buffer; reading it would be out of bounds.
        stack[0] = low + 64 * WORD;
        let bounds = bounds_of(&stack);

        assert_eq!(walk_frame_pointers(low, bounds, 8, 0), vec![0x1111]);
        assert_eq!(check_chain(low, bounds, 1), Ok(()));
        assert_eq!(
            check_chain(low, bounds, 2),
            Err(WalkError::ShallowChain {
                depth: 1,
                min_depth: 2
            })
        );
    }

    #[test]
    fn start_outside_the_stack_reads_nothing() {
        let stack = synthetic_stack();
        let bounds = bounds_of(&stack);
        let outside = stack.as_ptr() as usize + stack.len() * WORD;

        assert!(walk_frame_pointers(outside, bounds, 8, 0).is_empty());
        assert_eq!(
            check_chain(outside, bounds, 1),
            Err(WalkError::FramePointerOutsideStack { frame_ptr: outside })
        );
    }

    #[test]
    fn chain_depth_is_checked() {
        let stack = synthetic_stack();
        let bounds = bounds_of(&stack);
        let start = stack.as_ptr() as usize;

        assert_eq!(check_chain(start, bounds, 3), Ok(()));
        assert_eq!(
            check_chain(start, bounds, 4),
            Err(WalkError::ShallowChain {
                depth: 3,
                min_depth: 4
            })
        );
        assert_eq!(check_chain(0, bounds, 1), Err(WalkError::NullFramePointer));
        assert_eq!(
            check_chain(start + 1, bounds, 1),
            Err(WalkError::MisalignedFramePointer {
                frame_ptr: start + 1
            })
        );
    }

    #[test]
    fn record_must_fit_entirely_inside_bounds() {
        let bounds = StackBounds::new(0x1000, 0x2000);
        assert!(bounds.holds_record(0x1000));
        assert!(bounds.holds_record(0x2000 - FRAME_RECORD_SIZE));
        assert!(!bounds.holds_record(0x2000 - WORD));
        assert!(!bounds.holds_record(0xff8));
        assert!(!bounds.holds_record(usize::MAX - WORD + 1));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn thread_stack_contains_locals() {
        fn check() {
            let local = std::hint::black_box(0u64);
            let here = &local as *const u64 as usize;
            let bounds = StackBounds::current().expect("stack bounds are known on this target");
            assert!(bounds.holds_record(here - here % WORD), "{bounds:?} {here:#x}");
        }
        check();
        std::thread::spawn(check).join().unwrap();
    }
}
