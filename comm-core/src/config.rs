//! Environment-variable configuration, `COMM_OFI_*` per `spec.md` §6.
//!
//! The reference implementation reads these once at `init()` time and never
//! again; we mirror that by parsing into a plain struct eagerly rather than
//! re-reading the environment on every access (the teacher's `config.rs`
//! does the same: one `Config::load()` at startup, no hot-path env lookups).

use std::env;

fn bool_var(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn usize_var(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn list_var(name: &str) -> Vec<String> {
    env::var(name)
        .map(|v| v.split('|').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Hint overrides for provider selection (`spec.md` §4.9/§6). `LoopbackFabric`
/// has no real hint negotiation to perform, but `init::select_provider`
/// still logs them at debug level — on a real fabric they would be forwarded
/// into the hints struct the provider library is queried with.
#[derive(Debug, Clone, Default)]
pub struct HintOverrides {
    pub caps: Vec<String>,
    pub tx_op_flags: Vec<String>,
    pub rx_op_flags: Vec<String>,
    pub msg_order: Vec<String>,
    pub control_progress: Vec<String>,
    pub data_progress: Vec<String>,
    pub threading: Vec<String>,
    pub mr_mode: Vec<String>,
}

impl HintOverrides {
    fn from_env() -> HintOverrides {
        HintOverrides {
            caps: list_var("COMM_OFI_HINTS_CAPS"),
            tx_op_flags: list_var("COMM_OFI_HINTS_TX_OP_FLAGS"),
            rx_op_flags: list_var("COMM_OFI_HINTS_RX_OP_FLAGS"),
            msg_order: list_var("COMM_OFI_HINTS_MSG_ORDER"),
            control_progress: list_var("COMM_OFI_HINTS_CONTROL_PROGRESS"),
            data_progress: list_var("COMM_OFI_HINTS_DATA_PROGRESS"),
            threading: list_var("COMM_OFI_HINTS_THREADING"),
            mr_mode: list_var("COMM_OFI_HINTS_MR_MODE"),
        }
    }

    fn is_empty(&self) -> bool {
        self.caps.is_empty()
            && self.tx_op_flags.is_empty()
            && self.rx_op_flags.is_empty()
            && self.msg_order.is_empty()
            && self.control_progress.is_empty()
            && self.data_progress.is_empty()
            && self.threading.is_empty()
            && self.mr_mode.is_empty()
    }
}

/// Parsed `COMM_OFI_*` configuration, loaded once at `CommSubstrate::init`.
#[derive(Debug, Clone)]
pub struct Config {
    /// `COMM_OFI_PROVIDER` — force a fabric-provider name. Ignored by
    /// `LoopbackFabric` (there is only one), logged for parity.
    pub provider: Option<String>,
    /// `COMM_OFI_ABORT_ON_ERROR` — on fatal comm error, abort rather than a
    /// normal exit. The workspace only ever aborts on fatal errors (§7), so
    /// this currently only affects whether we log a notice that a graceful
    /// path was bypassed.
    pub abort_on_error: bool,
    /// `COMM_OFI_USE_SCALABLE_EP` — prefer a single scalable endpoint with
    /// sub-contexts over N independent endpoints.
    pub use_scalable_ep: bool,
    /// `COMM_OFI_DO_DELIVERY_COMPLETE` — prefer delivery-complete over
    /// message-order in provider selection.
    pub do_delivery_complete: bool,
    /// `COMM_OFI_COMM_CONCURRENCY` — cap worker TX-context count.
    pub concurrency: Option<usize>,
    pub hints: HintOverrides,
    /// `COMM_OFI_DEBUG` — enables `debug!`-level engine logging in addition
    /// to whatever `RUST_LOG` already requests.
    pub debug: bool,
    pub debug_fname: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            provider: None,
            abort_on_error: false,
            use_scalable_ep: true,
            do_delivery_complete: true,
            concurrency: None,
            hints: HintOverrides::default(),
            debug: false,
            debug_fname: None,
        }
    }
}

impl Config {
    pub fn load() -> Config {
        let cfg = Config {
            provider: env::var("COMM_OFI_PROVIDER").ok(),
            abort_on_error: bool_var("COMM_OFI_ABORT_ON_ERROR", false),
            use_scalable_ep: bool_var("COMM_OFI_USE_SCALABLE_EP", true),
            do_delivery_complete: bool_var("COMM_OFI_DO_DELIVERY_COMPLETE", true),
            concurrency: usize_var("COMM_OFI_COMM_CONCURRENCY"),
            hints: HintOverrides::from_env(),
            debug: bool_var("COMM_OFI_DEBUG", false),
            debug_fname: env::var("COMM_OFI_DEBUG_FNAME").ok(),
        };
        if !cfg.hints.is_empty() {
            log::debug!("provider-selection hint overrides: {:?}", cfg.hints);
        }
        cfg
    }

    /// Initializes `env_logger` once, honoring `COMM_OFI_DEBUG` as a floor
    /// on top of whatever `RUST_LOG` already specifies — mirrors the
    /// teacher's single `env_logger::Builder` call at process start.
    pub fn init_logging(&self) {
        let mut builder = env_logger::Builder::from_default_env();
        if self.debug && env::var("RUST_LOG").is_err() {
            builder.filter_level(log::LevelFilter::Debug);
        }
        let _ = builder.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // COMM_OFI_* env vars are process-global state; serialize tests that
    // touch them so they don't race under the default parallel test runner.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_spec_prose() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("COMM_OFI_USE_SCALABLE_EP");
        env::remove_var("COMM_OFI_DO_DELIVERY_COMPLETE");
        let cfg = Config::load();
        assert!(cfg.use_scalable_ep);
        assert!(cfg.do_delivery_complete);
        assert_eq!(cfg.concurrency, None);
    }

    #[test]
    fn bool_var_accepts_common_truthy_spellings() {
        let _guard = ENV_LOCK.lock().unwrap();
        for v in ["1", "true", "TRUE", "yes", "on"] {
            env::set_var("COMM_OFI_ABORT_ON_ERROR", v);
            assert!(bool_var("COMM_OFI_ABORT_ON_ERROR", false), "{v} should be truthy");
        }
        env::remove_var("COMM_OFI_ABORT_ON_ERROR");
    }

    #[test]
    fn hint_list_splits_on_pipe_and_trims() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("COMM_OFI_HINTS_CAPS", " FI_MSG | FI_RMA |FI_ATOMIC");
        let hints = HintOverrides::from_env();
        assert_eq!(hints.caps, vec!["FI_MSG", "FI_RMA", "FI_ATOMIC"]);
        env::remove_var("COMM_OFI_HINTS_CAPS");
    }
}
