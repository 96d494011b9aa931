use stackshot_types::ModuleInfo;
use std::ffi::{CStr, c_int, c_void};

#[cfg(target_pointer_width = "64")]
type ProgramHeader = libc::Elf64_Phdr;
#[cfg(target_pointer_width = "32")]
type ProgramHeader = libc::Elf32_Phdr;

/// `p_type` of a loadable segment. Not every libc target exports the constant.
const PT_LOAD: u32 = 1;

#[derive(Default)]
struct Collector {
    modules: Vec<ModuleInfo>,
    seen: usize,
    main_index: Option<usize>,
    skipped: usize,
}

/// Lists every loaded ELF object. The range of each covers its `PT_LOAD`
/// segments; objects without any are left out.
pub(super) fn enumerate_modules() -> Vec<ModuleInfo> {
    let mut collector = Collector::default();
    unsafe {
        libc::dl_iterate_phdr(
            Some(collect_module),
            (&mut collector as *mut Collector).cast::<c_void>(),
        );
    }

    // The main program is reported first, without a name.
    if let Some(index) = collector.main_index
        && let Ok(exe) = std::env::current_exe()
    {
        collector.modules[index].path = exe.to_string_lossy().into_owned();
    }

    if collector.skipped > 0 {
        tracing::debug!(
            skipped = collector.skipped,
            "loaded objects without usable segments left out of module registry"
        );
    }
    collector.modules
}

unsafe extern "C" fn collect_module(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let collector = unsafe { &mut *data.cast::<Collector>() };
    let is_first = collector.seen == 0;
    collector.seen += 1;

    let Some(info) = (unsafe { info.as_ref() }) else {
        collector.skipped += 1;
        return 0;
    };

    let path = if info.dlpi_name.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(info.dlpi_name) }
            .to_string_lossy()
            .into_owned()
    };

    let headers: &[ProgramHeader] = if info.dlpi_phdr.is_null() {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum)) }
    };

    let load_bias = info.dlpi_addr as u64;
    match loaded_extent(headers) {
        Some((start, end)) => {
            let base = load_bias.checked_add(start);
            match base {
                Some(base) if end > start => {
                    if is_first && path.is_empty() {
                        collector.main_index = Some(collector.modules.len());
                    }
                    collector.modules.push(ModuleInfo {
                        base,
                        size: end - start,
                        path,
                        load_bias,
                    });
                }
                _ => collector.skipped += 1,
            }
        }
        None => collector.skipped += 1,
    }

    0
}

/// Lowest start and highest end, as link-time addresses, over the loadable
/// segments.
fn loaded_extent(headers: &[ProgramHeader]) -> Option<(u64, u64)> {
    headers
        .iter()
        .filter(|header| header.p_type == PT_LOAD)
        .filter_map(|header| {
            let start = header.p_vaddr as u64;
            let end = start.checked_add(header.p_memsz as u64)?;
            Some((start, end))
        })
        .reduce(|(lo, hi), (start, end)| (lo.min(start), hi.max(end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PT_DYNAMIC: u32 = 2;
    const PT_NOTE: u32 = 4;
    const PT_PHDR: u32 = 6;

    fn header(p_type: u32, vaddr: u64, memsz: u64) -> ProgramHeader {
        let mut header: ProgramHeader = unsafe { std::mem::zeroed() };
        header.p_type = p_type as _;
        header.p_vaddr = vaddr as _;
        header.p_memsz = memsz as _;
        header
    }

    #[test]
    fn extent_spans_all_load_segments() {
        let headers = [
            header(PT_PHDR, 0x40, 0x2a0),
            header(PT_LOAD, 0x0, 0x1000),
            header(PT_LOAD, 0x1000, 0x3500),
            header(PT_LOAD, 0x5000, 0x200),
            header(PT_DYNAMIC, 0x9000, 0x100),
        ];
        assert_eq!(loaded_extent(&headers), Some((0x0, 0x5200)));
    }

    #[test]
    fn extent_of_object_without_load_segments_is_none() {
        let headers = [header(PT_NOTE, 0x100, 0x20)];
        assert_eq!(loaded_extent(&headers), None);
        assert_eq!(loaded_extent(&[]), None);
    }

    #[test]
    fn registry_contains_main_executable() {
        let modules = enumerate_modules();
        assert!(!modules.is_empty());

        let here = registry_contains_main_executable as *const () as usize as u64;
        let owner = modules
            .iter()
            .find(|module| module.contains(here))
            .expect("test function must lie inside a loaded module");
        assert_ne!(owner.base, 0);
        assert!(owner.base >= owner.load_bias);
        assert!(!owner.path.is_empty());
    }
}
