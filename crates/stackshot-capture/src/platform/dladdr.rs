use stackshot_types::SymbolHint;
use std::ffi::{CStr, c_void};

/// Asks the dynamic loader which exported symbol and which image cover
/// `address`. Only dynamic symbols are visible here.
pub(super) fn lookup(address: u64) -> SymbolHint {
    let mut info = std::mem::MaybeUninit::<libc::Dl_info>::zeroed();
    let ok = unsafe { libc::dladdr(address as usize as *const c_void, info.as_mut_ptr()) };
    if ok == 0 {
        return SymbolHint::default();
    }

    let info = unsafe { info.assume_init() };
    let module_base = Some(info.dli_fbase as usize as u64).filter(|base| *base != 0);

    SymbolHint {
        symbol: c_string(info.dli_sname),
        module_base,
        module_path: c_string(info.dli_fname),
    }
}

fn c_string(ptr: *const libc::c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let value = unsafe { CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned();
    Some(value).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn marker() -> u64 {
        std::hint::black_box(7)
    }

    #[test]
    fn reports_image_of_own_code() {
        let address = marker as *const () as usize as u64;
        let hint = lookup(address);
        let base = hint.module_base.expect("loader knows the test binary");
        assert!(base <= address);
        assert_eq!(marker(), 7);
    }

    #[test]
    fn unmapped_address_has_no_hint() {
        assert_eq!(lookup(0x10), SymbolHint::default());
    }
}
