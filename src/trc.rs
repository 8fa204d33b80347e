//! Log output setup.
//!
//! The filter comes from `MOUNT0_LOG`, then `RUST_LOG`, then defaults to `info`. An explicit
//! filter means someone is debugging, so output switches from the compact spinner display to
//! plain `fmt` lines with span timings.

use std::io::IsTerminal as _;

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

const FILTER_VAR: &str = "MOUNT0_LOG";

/// Where log lines end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    /// An interactive terminal, or a pipe when the user runs in the foreground.
    Terminal { interactive: bool },
    /// The daemon's log file. Never colored, always timestamped.
    Daemon,
}

pub struct Trc {
    output: Output,
    filter: EnvFilter,
}

/// `MOUNT0_COLOR=always|never` wins; otherwise honor `NO_COLOR` on a terminal.
fn use_color() -> bool {
    match std::env::var("MOUNT0_COLOR").as_deref() {
        Ok("always") => true,
        Ok("never") => false,
        _ => {
            std::io::stderr().is_terminal()
                && std::env::var_os("NO_COLOR").is_none_or(|v| v.is_empty())
        }
    }
}

impl Trc {
    /// Logging for a process attached to the user's terminal.
    #[must_use]
    pub fn foreground() -> Self {
        match EnvFilter::try_from_env(FILTER_VAR).or_else(|_| EnvFilter::try_from_default_env()) {
            Ok(filter) => Self {
                output: Output::Terminal { interactive: false },
                filter,
            },
            Err(_) => Self {
                output: Output::Terminal { interactive: true },
                filter: EnvFilter::new("info"),
            },
        }
    }

    /// Logging for a detached process whose stderr is a file.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            output: Output::Daemon,
            filter: EnvFilter::try_from_env(FILTER_VAR)
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        }
    }

    pub fn init(self) -> Result<(), TryInitError> {
        match self.output {
            Output::Terminal { interactive: true } => self.init_interactive(),
            Output::Terminal { interactive: false } => {
                let ansi = use_color();
                self.init_plain(ansi, FmtSpan::ENTER | FmtSpan::CLOSE)
            }
            Output::Daemon => self.init_plain(false, FmtSpan::CLOSE),
        }
    }

    fn init_plain(self, ansi: bool, spans: FmtSpan) -> Result<(), TryInitError> {
        tracing_subscriber::fmt()
            .with_env_filter(self.filter)
            .with_span_events(spans)
            .with_ansi(ansi)
            .with_writer(std::io::stderr)
            .finish()
            .try_init()
    }

    fn init_interactive(self) -> Result<(), TryInitError> {
        // Progress bars for long operations (key derivation, slow backends) are drawn by the
        // indicatif layer; log lines are routed through it so they do not tear the bars.
        let indicatif_layer = IndicatifLayer::new();
        tracing_subscriber::registry()
            .with(self.filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(indicatif_layer.get_stderr_writer())
                    .with_ansi(use_color())
                    .with_target(false)
                    .without_time()
                    .compact(),
            )
            .with(indicatif_layer)
            .try_init()
    }
}
