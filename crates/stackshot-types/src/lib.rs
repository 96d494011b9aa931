//! Value types produced by a stack capture.
//!
//! Every resolved field is optional: a frame always exists for a captured
//! address, and whatever could not be resolved is simply absent. The flat
//! accessors (`function_name()`, `line()`, `module_base()`, ...) expose the
//! same data with empty strings and zeros standing in for absence.

use facet::Facet;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    ZeroModuleBase,
    AddressBeforeBase { address: u64, base: u64 },
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroModuleBase => write!(f, "module base must be non-zero"),
            Self::AddressBeforeBase { address, base } => write!(
                f,
                "address 0x{address:x} is below module base 0x{base:x}"
            ),
        }
    }
}

impl Error for InvariantError {}

/// Returns the last path component, accepting both `/` and `\` separators.
pub fn file_name_of(path: &str) -> &str {
    match path.rfind(['/', '\\']) {
        Some(index) => &path[index + 1..],
        None => path,
    }
}

/// The module owning a frame's address.
///
/// Only constructible through [`FrameModule::new`], which guarantees
/// `base != 0` and `address == base + offset`.
#[derive(Facet, Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameModule {
    name: String,
    path: String,
    base: u64,
    offset: u64,
}

impl FrameModule {
    pub fn new(address: u64, base: u64, path: impl Into<String>) -> Result<Self, InvariantError> {
        if base == 0 {
            return Err(InvariantError::ZeroModuleBase);
        }
        let offset = address
            .checked_sub(base)
            .ok_or(InvariantError::AddressBeforeBase { address, base })?;
        let path = path.into();
        Ok(Self {
            name: file_name_of(&path).to_owned(),
            path,
            base,
            offset,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

#[derive(Facet, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub file: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl SourceLocation {
    /// Zero lines and columns are treated as unknown.
    pub fn new(file: impl Into<String>, line: Option<u32>, column: Option<u32>) -> Self {
        Self {
            file: file.into(),
            line: line.filter(|line| *line != 0),
            column: column.filter(|column| *column != 0),
        }
    }
}

/// One resolved call-stack entry, innermost first in a capture.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    address: u64,
    function_name: Option<String>,
    raw_symbol: Option<String>,
    location: Option<SourceLocation>,
    module: Option<FrameModule>,
}

impl StackFrame {
    pub fn new(address: u64) -> Self {
        Self {
            address,
            function_name: None,
            raw_symbol: None,
            location: None,
            module: None,
        }
    }

    pub fn with_symbol(mut self, raw_symbol: Option<String>, function_name: Option<String>) -> Self {
        self.raw_symbol = raw_symbol.filter(|name| !name.is_empty());
        self.function_name = function_name.filter(|name| !name.is_empty());
        self
    }

    pub fn with_location(mut self, location: Option<SourceLocation>) -> Self {
        self.location = location.filter(|location| !location.file.is_empty());
        self
    }

    /// Attaches the owning module. A module built for a different address is
    /// dropped, so `module_base + offset == address` holds for every frame.
    pub fn with_module(mut self, module: Option<FrameModule>) -> Self {
        let address = self.address;
        self.module =
            module.filter(|module| module.base.checked_add(module.offset) == Some(address));
        self
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn function(&self) -> Option<&str> {
        self.function_name.as_deref()
    }

    pub fn symbol(&self) -> Option<&str> {
        self.raw_symbol.as_deref()
    }

    pub fn location(&self) -> Option<&SourceLocation> {
        self.location.as_ref()
    }

    pub fn module(&self) -> Option<&FrameModule> {
        self.module.as_ref()
    }

    pub fn function_name(&self) -> &str {
        self.function().unwrap_or_default()
    }

    pub fn raw_symbol(&self) -> &str {
        self.symbol().unwrap_or_default()
    }

    pub fn file_name(&self) -> &str {
        self.location
            .as_ref()
            .map(|location| location.file.as_str())
            .unwrap_or_default()
    }

    pub fn line(&self) -> u32 {
        self.location
            .as_ref()
            .and_then(|location| location.line)
            .unwrap_or(0)
    }

    pub fn module_name(&self) -> &str {
        self.module.as_ref().map(FrameModule::name).unwrap_or_default()
    }

    pub fn module_path(&self) -> &str {
        self.module.as_ref().map(FrameModule::path).unwrap_or_default()
    }

    pub fn module_base(&self) -> u64 {
        self.module.as_ref().map(FrameModule::base).unwrap_or(0)
    }

    pub fn offset(&self) -> u64 {
        self.module.as_ref().map(FrameModule::offset).unwrap_or(0)
    }
}

/// A module mapped into the current process, as seen by the loader.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Lowest mapped address of the image.
    pub base: u64,
    /// Extent of the loaded segments, relative to `base`.
    pub size: u64,
    pub path: String,
    /// Difference between run-time and link-time addresses.
    pub load_bias: u64,
}

impl ModuleInfo {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.size
    }
}

/// What the platform symbol service knows about an address.
#[derive(Facet, Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolHint {
    pub symbol: Option<String>,
    pub module_base: Option<u64>,
    pub module_path: Option<String>,
}

/// What debug information (symbol tables, line tables) knows about an address.
#[derive(Facet, Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugRecord {
    pub symbol: Option<String>,
    pub location: Option<SourceLocation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_offset_is_relative_to_base() {
        let module = FrameModule::new(0x7f00_1234, 0x7f00_0000, "/usr/lib/libfoo.so.1").unwrap();
        assert_eq!(module.offset(), 0x1234);
        assert_eq!(module.base() + module.offset(), 0x7f00_1234);
        assert_eq!(module.name(), "libfoo.so.1");
        assert_eq!(module.path(), "/usr/lib/libfoo.so.1");
    }

    #[test]
    fn module_rejects_zero_base_and_address_below_base() {
        assert_eq!(
            FrameModule::new(0x10, 0, "a.out"),
            Err(InvariantError::ZeroModuleBase)
        );
        assert_eq!(
            FrameModule::new(0x10, 0x20, "a.out"),
            Err(InvariantError::AddressBeforeBase {
                address: 0x10,
                base: 0x20
            })
        );
    }

    #[test]
    fn file_name_handles_both_separators() {
        assert_eq!(file_name_of("/a/b/c.so"), "c.so");
        assert_eq!(file_name_of(r"C:\bin\app.exe"), "app.exe");
        assert_eq!(file_name_of("plain"), "plain");
        assert_eq!(file_name_of(""), "");
    }

    #[test]
    fn frame_without_module_reports_zeroes() {
        let frame = StackFrame::new(0xdead_beef);
        assert_eq!(frame.module_base(), 0);
        assert_eq!(frame.offset(), 0);
        assert_eq!(frame.module_name(), "");
        assert_eq!(frame.module_path(), "");
        assert_eq!(frame.function_name(), "");
        assert_eq!(frame.raw_symbol(), "");
        assert_eq!(frame.file_name(), "");
        assert_eq!(frame.line(), 0);
    }

    #[test]
    fn module_for_another_address_is_dropped() {
        let module = FrameModule::new(0x2010, 0x2000, "lib.so").unwrap();
        let frame = StackFrame::new(0x1000).with_module(Some(module.clone()));
        assert_eq!(frame.module(), None);

        let frame = StackFrame::new(0x2010).with_module(Some(module));
        assert_eq!(frame.module_base(), 0x2000);
        assert_eq!(frame.offset(), 0x10);
        assert_eq!(frame.module_name(), "lib.so");
    }

    #[test]
    fn empty_strings_count_as_absent() {
        let frame = StackFrame::new(1)
            .with_symbol(Some(String::new()), Some(String::new()))
            .with_location(Some(SourceLocation::new("", Some(3), None)));
        assert_eq!(frame.symbol(), None);
        assert_eq!(frame.function(), None);
        assert_eq!(frame.location(), None);
    }

    #[test]
    fn zero_line_is_unknown() {
        let location = SourceLocation::new("src/lib.rs", Some(0), Some(0));
        assert_eq!(location.line, None);
        assert_eq!(location.column, None);
        let frame = StackFrame::new(1).with_location(Some(location));
        assert_eq!(frame.file_name(), "src/lib.rs");
        assert_eq!(frame.line(), 0);
    }

    #[test]
    fn module_range_is_half_open() {
        let module = ModuleInfo {
            base: 0x1000,
            size: 0x100,
            path: String::new(),
            load_bias: 0,
        };
        assert!(!module.contains(0xfff));
        assert!(module.contains(0x1000));
        assert!(module.contains(0x10ff));
        assert!(!module.contains(0x1100));
    }
}
