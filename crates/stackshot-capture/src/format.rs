use stackshot_types::StackFrame;
use std::fmt;
use std::io::{self, Write};

const HEADER: &str = "stacktrace (most recent call first):";
const UNKNOWN: &str = "<unknown>";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatOptions {
    /// Appends ` (module+0xoffset)` to frames with a known module.
    pub show_module: bool,
}

/// Renders frames as a header followed by one `#index address in function
/// at location` line per frame.
pub struct FrameFormatter<'a> {
    frames: &'a [StackFrame],
    options: FormatOptions,
}

impl<'a> FrameFormatter<'a> {
    pub fn new(frames: &'a [StackFrame]) -> Self {
        Self {
            frames,
            options: FormatOptions::default(),
        }
    }

    pub fn with_options(mut self, options: FormatOptions) -> Self {
        self.options = options;
        self
    }
}

impl fmt::Display for FrameFormatter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{HEADER}")?;
        for (index, frame) in self.frames.iter().enumerate() {
            writeln!(f, "{}", FrameLine::new(index, frame, self.options))?;
        }
        Ok(())
    }
}

pub fn format_frames(frames: &[StackFrame]) -> String {
    FrameFormatter::new(frames).to_string()
}

/// Writes the same text as [`FrameFormatter`], flushing after every line so
/// that the output survives if the process dies right after.
pub fn write_frames<W: Write>(
    out: &mut W,
    frames: &[StackFrame],
    options: &FormatOptions,
) -> io::Result<()> {
    writeln!(out, "{HEADER}")?;
    out.flush()?;
    for (index, frame) in frames.iter().enumerate() {
        writeln!(out, "{}", FrameLine::new(index, frame, *options))?;
        out.flush()?;
    }
    Ok(())
}

struct FrameLine<'a> {
    index: usize,
    frame: &'a StackFrame,
    options: FormatOptions,
}

impl<'a> FrameLine<'a> {
    fn new(index: usize, frame: &'a StackFrame, options: FormatOptions) -> Self {
        Self {
            index,
            frame,
            options,
        }
    }
}

impl fmt::Display for FrameLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frame = self.frame;
        let function = frame.function().or(frame.symbol()).unwrap_or(UNKNOWN);
        write!(f, "#{} {:#x} in {function} at ", self.index, frame.address())?;

        match frame.location() {
            Some(location) => {
                f.write_str(&location.file)?;
                if let Some(line) = location.line {
                    write!(f, ":{line}")?;
                }
            }
            None => f.write_str(UNKNOWN)?,
        }

        if self.options.show_module
            && let Some(module) = frame.module()
        {
            let name = if module.name().is_empty() {
                UNKNOWN
            } else {
                module.name()
            };
            write!(f, " ({name}+{:#x})", module.offset())?;
        }
        Ok(())
    }
}
