//! Tracing setup for the mount binary.

use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

pub struct Trc {
    verbose: bool,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        let maybe_env_filter =
            EnvFilter::try_from_env("GZ_FS_LOG").or_else(|_| EnvFilter::try_from_default_env());

        match maybe_env_filter {
            Ok(env_filter) => Self {
                // A user who set a filter is debugging the mount; give them
                // the verbose format with span events.
                verbose: true,
                env_filter,
            },
            Err(_) => Self {
                // Out of the box, a compact info-level format is plenty for
                // something that mostly sits in the background.
                verbose: false,
                env_filter: EnvFilter::new("info"),
            },
        }
    }
}

impl Trc {
    pub fn init(self) -> Result<(), TryInitError> {
        if self.verbose {
            self.init_verbose()
        } else {
            self.init_compact()
        }
    }

    fn init_verbose(self) -> Result<(), TryInitError> {
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter)
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .init();

        Ok(())
    }

    fn init_compact(self) -> Result<(), TryInitError> {
        tracing_subscriber::registry()
            .with(self.env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .without_time()
                    .compact(),
            )
            .try_init()?;

        Ok(())
    }
}
