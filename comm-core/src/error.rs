//! Fatal-error handling per `spec.md` §7: "the core does not raise
//! user-visible errors; it either handles transparently or aborts the
//! process." `ofi_chk!` is the `OFI_CHK`-equivalent guard the reference
//! implementation wraps every fabric-layer call in.

/// Aborts the process after logging `context` and `err` at `error!` level.
///
/// `EMFILE` gets the actionable message `spec.md` §7 calls out by name:
/// open-file-descriptor exhaustion relative to `concurrency × nodes`. The
/// chain is walked because the EMFILE usually arrives wrapped (a `socket()`
/// or `epoll_create()` failure surfaced through a `Context`-annotated
/// `anyhow::Error`), not as the top-level error itself.
pub fn fatal(context: &str, err: &anyhow::Error) -> ! {
    let emfile = err
        .chain()
        .find_map(|e| e.downcast_ref::<std::io::Error>())
        .and_then(std::io::Error::raw_os_error)
        == Some(libc::EMFILE);
    if emfile {
        log::error!(
            "{context}: {err:#} (EMFILE — raise RLIMIT_NOFILE; this provider opens \
             roughly concurrency * nodes file descriptors)"
        );
    } else {
        log::error!("{context}: {err:#}");
    }
    std::process::abort();
}

/// `OFI_CHK`-equivalent: unwraps `$expr` (an `anyhow::Result<T>`), aborting
/// with a formatted diagnostic — including the failing expression's source
/// text — on `Err`.
///
/// `spec.md` §7: "fatal provider errors ... report and abort ... a formatted
/// diagnostic including the failing expression and provider error string."
#[macro_export]
macro_rules! ofi_chk {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => $crate::error::fatal(stringify!($expr), &e),
        }
    };
    ($expr:expr, $desc:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => $crate::error::fatal($desc, &e),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emfile_is_detected_via_raw_os_error() {
        let err = std::io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(err.raw_os_error(), Some(libc::EMFILE));
    }
}
