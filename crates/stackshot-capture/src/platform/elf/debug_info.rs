use object::{Object, ObjectSegment};
use stackshot_types::{DebugRecord, FrameModule, SourceLocation};
use std::collections::{HashMap, hash_map::Entry};
use std::error::Error;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugInfoError {
    Disabled,
    NoModulePath,
    OpenImage { path: String, reason: String },
    ReadImage { path: String, reason: String },
    ParseImage { path: String, reason: String },
    NoFileBackedSegments { path: String },
    AddressBelowLoadBias { path: String, address: u64, load_bias: u64 },
    AddressOverflow { path: String, linked_base: u64, offset: u64 },
    Lookup { path: String, probe: u64, reason: String },
}

impl fmt::Display for DebugInfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "debug info loading is disabled"),
            Self::NoModulePath => write!(f, "module has no path to load debug info from"),
            Self::OpenImage { path, reason } => {
                write!(f, "open debug object '{path}': {reason}")
            }
            Self::ReadImage { path, reason } => {
                write!(f, "read debug object '{path}': {reason}")
            }
            Self::ParseImage { path, reason } => {
                write!(f, "parse debug object '{path}': {reason}")
            }
            Self::NoFileBackedSegments { path } => {
                write!(f, "no file-backed segments in debug object '{path}'")
            }
            Self::AddressBelowLoadBias {
                path,
                address,
                load_bias,
            } => write!(
                f,
                "address 0x{address:x} is below load bias 0x{load_bias:x} of '{path}'"
            ),
            Self::AddressOverflow {
                path,
                linked_base,
                offset,
            } => write!(
                f,
                "address overflow combining linked image base 0x{linked_base:x} with offset 0x{offset:x} for '{path}'"
            ),
            Self::Lookup {
                path,
                probe,
                reason,
            } => write!(f, "lookup frames for '{path}' at 0x{probe:x}: {reason}"),
        }
    }
}

impl Error for DebugInfoError {}

enum ImageState {
    Ready {
        loader: Box<addr2line::Loader>,
        /// Read from the image on first use; only needed when the loader's
        /// bias for the module is unknown.
        linked_image_base: Option<Result<u64, DebugInfoError>>,
    },
    Failed(DebugInfoError),
}

/// Debug objects opened during one capture, keyed by module path. Each image
/// is parsed at most once per capture and released when the session drops.
pub struct DebugSession {
    enabled: bool,
    images: HashMap<String, ImageState>,
}

impl DebugSession {
    pub(super) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            images: HashMap::new(),
        }
    }

    /// Looks up `address` (already adjusted to point inside the call
    /// instruction) in `module`'s symbol and line tables.
    ///
    /// The debug tables use link-time addresses. With the loader's
    /// `load_bias` that is `address - load_bias`; without it the image's
    /// lowest file-backed segment stands in for the module base.
    pub(super) fn lookup(
        &mut self,
        address: u64,
        module: &FrameModule,
        load_bias: Option<u64>,
    ) -> Result<DebugRecord, DebugInfoError> {
        if !self.enabled {
            return Err(DebugInfoError::Disabled);
        }
        let path = module.path();
        if path.is_empty() {
            return Err(DebugInfoError::NoModulePath);
        }

        let state = match self.images.entry(path.to_owned()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let state = match open_image(path) {
                    Ok(loader) => ImageState::Ready {
                        loader: Box::new(loader),
                        linked_image_base: None,
                    },
                    Err(error) => {
                        tracing::debug!(%error, "debug object unavailable");
                        ImageState::Failed(error)
                    }
                };
                entry.insert(state)
            }
        };

        let (loader, linked_image_base) = match state {
            ImageState::Ready {
                loader,
                linked_image_base,
            } => (loader, linked_image_base),
            ImageState::Failed(error) => return Err(error.clone()),
        };

        let probe = match load_bias {
            Some(load_bias) => {
                address
                    .checked_sub(load_bias)
                    .ok_or_else(|| DebugInfoError::AddressBelowLoadBias {
                        path: path.to_owned(),
                        address,
                        load_bias,
                    })?
            }
            None => {
                let linked_base = linked_image_base
                    .get_or_insert_with(|| linked_image_base_for_file(Path::new(path)))
                    .clone()?;
                let offset = address.saturating_sub(module.base());
                linked_base
                    .checked_add(offset)
                    .ok_or_else(|| DebugInfoError::AddressOverflow {
                        path: path.to_owned(),
                        linked_base,
                        offset,
                    })?
            }
        };

        lookup_probe(loader, probe).map_err(|reason| DebugInfoError::Lookup {
            path: path.to_owned(),
            probe,
            reason,
        })
    }
}

fn open_image(path: &str) -> Result<addr2line::Loader, DebugInfoError> {
    addr2line::Loader::new(path).map_err(|error| DebugInfoError::OpenImage {
        path: path.to_owned(),
        reason: error.to_string(),
    })
}

/// Takes the innermost named function and the first known location from
/// the (possibly inlined) frames at `probe`, then falls back to the symbol
/// table and the plain line table.
fn lookup_probe(loader: &addr2line::Loader, probe: u64) -> Result<DebugRecord, String> {
    let mut symbol = None::<String>;
    let mut location = None::<SourceLocation>;

    let mut frames = loader
        .find_frames(probe)
        .map_err(|error| error.to_string())?;
    loop {
        match frames.next() {
            Ok(Some(frame)) => {
                if symbol.is_none()
                    && let Some(function) = frame.function
                    && let Ok(name) = function.raw_name()
                {
                    symbol = Some(name.into_owned());
                }
                if location.is_none()
                    && let Some(found) = frame.location
                    && let Some(file) = found.file
                {
                    location = Some(SourceLocation::new(file, found.line, found.column));
                }
                if symbol.is_some() && location.is_some() {
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => return Err(error.to_string()),
        }
    }

    if symbol.is_none() {
        symbol = loader.find_symbol(probe).map(str::to_owned);
    }

    if location.is_none()
        && let Ok(Some(found)) = loader.find_location(probe)
        && let Some(file) = found.file
    {
        location = Some(SourceLocation::new(file, found.line, found.column));
    }

    Ok(DebugRecord { symbol, location })
}

/// Lowest address among the file-backed segments, i.e. where the image
/// expects to be mapped at link time.
fn linked_image_base_for_file(path: &Path) -> Result<u64, DebugInfoError> {
    let data = std::fs::read(path).map_err(|error| DebugInfoError::ReadImage {
        path: path.display().to_string(),
        reason: error.to_string(),
    })?;
    let object = object::File::parse(&*data).map_err(|error| DebugInfoError::ParseImage {
        path: path.display().to_string(),
        reason: error.to_string(),
    })?;
    object
        .segments()
        .filter_map(|segment| {
            let (_, file_size) = segment.file_range();
            if file_size == 0 {
                return None;
            }
            Some(segment.address())
        })
        .min()
        .ok_or_else(|| DebugInfoError::NoFileBackedSegments {
            path: path.display().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::elf::modules::enumerate_modules;
    use std::hint::black_box;

    #[inline(never)]
    fn symbolized_marker() -> u64 {
        black_box(11)
    }

    fn own_module(address: u64) -> (FrameModule, u64) {
        let info = enumerate_modules()
            .into_iter()
            .find(|info| info.contains(address))
            .expect("test binary is in the registry");
        let module = FrameModule::new(address, info.base, info.path).unwrap();
        (module, info.load_bias)
    }

    fn linked_base_state(session: &DebugSession, path: &str) -> Option<bool> {
        match session.images.get(path) {
            Some(ImageState::Ready {
                linked_image_base, ..
            }) => Some(linked_image_base.is_some()),
            _ => None,
        }
    }

    #[test]
    fn disabled_session_never_opens_images() {
        let mut session = DebugSession::new(false);
        let module = FrameModule::new(0x1010, 0x1000, "/nonexistent/lib.so").unwrap();
        assert_eq!(
            session.lookup(0x1010, &module, None),
            Err(DebugInfoError::Disabled)
        );
        assert!(session.images.is_empty());
    }

    #[test]
    fn missing_image_fails_once_per_session() {
        let mut session = DebugSession::new(true);
        let module = FrameModule::new(0x1010, 0x1000, "/nonexistent/lib.so").unwrap();
        let first = session.lookup(0x1010, &module, Some(0));
        assert!(matches!(first, Err(DebugInfoError::OpenImage { .. })));
        let second = session.lookup(0x1011, &module, None);
        assert_eq!(first, second);
        assert_eq!(session.images.len(), 1);
    }

    #[test]
    fn module_without_path_is_skipped() {
        let mut session = DebugSession::new(true);
        let module = FrameModule::new(0x1010, 0x1000, "").unwrap();
        assert_eq!(
            session.lookup(0x1010, &module, None),
            Err(DebugInfoError::NoModulePath)
        );
    }

    #[test]
    fn known_load_bias_resolves_without_rereading_image() {
        let address = symbolized_marker as *const () as usize as u64;
        let (module, load_bias) = own_module(address);
        let mut session = DebugSession::new(true);

        let record = session.lookup(address, &module, Some(load_bias)).unwrap();
        let symbol = record.symbol.unwrap_or_default();
        assert!(symbol.contains("symbolized_marker"), "{symbol}");
        assert_eq!(linked_base_state(&session, module.path()), Some(false));
        assert_eq!(symbolized_marker(), 11);
    }

    #[test]
    fn unknown_load_bias_falls_back_to_image_segments() {
        let address = symbolized_marker as *const () as usize as u64;
        let (module, load_bias) = own_module(address);
        let mut session = DebugSession::new(true);

        let with_bias = session.lookup(address, &module, Some(load_bias)).unwrap();
        let without_bias = session.lookup(address, &module, None).unwrap();
        assert_eq!(with_bias, without_bias);
        assert_eq!(linked_base_state(&session, module.path()), Some(true));
    }

    #[test]
    fn address_below_load_bias_is_rejected() {
        let address = symbolized_marker as *const () as usize as u64;
        let (module, _) = own_module(address);
        let mut session = DebugSession::new(true);
        let result = session.lookup(address, &module, Some(address + 1));
        assert!(
            matches!(result, Err(DebugInfoError::AddressBelowLoadBias { .. })),
            "{result:?}"
        );
    }
}
