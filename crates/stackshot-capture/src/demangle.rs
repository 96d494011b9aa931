/// Demangles Rust (legacy and v0) and Itanium C++ symbol names.
///
/// Rust names are rendered without their hash suffix. Returns `None` when the
/// name is not mangled in a recognised scheme.
pub fn demangle(raw: &str) -> Option<String> {
    if let Ok(symbol) = rustc_demangle::try_demangle(raw) {
        return Some(format!("{symbol:#}"));
    }

    let symbol = cpp_demangle::Symbol::new(raw.as_bytes()).ok()?;
    match symbol.demangle(&cpp_demangle::DemangleOptions::default()) {
        Ok(name) => Some(name),
        Err(error) => {
            tracing::trace!(raw, %error, "c++ demangling failed");
            None
        }
    }
}

pub(crate) fn demangle_or_raw(raw: &str) -> String {
    demangle(raw).unwrap_or_else(|| raw.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_legacy_symbol_drops_hash() {
        assert_eq!(
            demangle("_ZN4core9panicking5panic17h0123456789abcdefE").as_deref(),
            Some("core::panicking::panic")
        );
    }

    #[test]
    fn itanium_symbol() {
        assert_eq!(demangle("_Z3foov").as_deref(), Some("foo()"));
        let name = demangle("_ZN2ox10stacktrace5printEi").unwrap();
        assert!(name.contains("ox::stacktrace::print"), "{name}");
    }

    #[test]
    fn plain_names_fall_back_to_raw() {
        assert_eq!(demangle("main"), None);
        assert_eq!(demangle_or_raw("main"), "main");
        assert_eq!(demangle_or_raw("_Z"), "_Z");
    }
}
