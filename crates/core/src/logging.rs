//! Subscriber setup and the per-component verbosity capability.

use tracing::Span;

use crate::topology::Rank;

/// Diagnostic verbosity handed to a single component.
///
/// `level` comes from the component's `debug` parameter; messages at a higher
/// level than configured are dropped before reaching `tracing`. Everything the
/// component logs is emitted inside `span`, which carries its rank.
#[derive(Debug, Clone)]
pub struct ComponentLog {
    level: u8,
    span: Span,
}

impl ComponentLog {
    pub fn new(rank: Rank, level: u8) -> Self {
        Self {
            level,
            span: tracing::debug_span!("ghost", %rank),
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn enabled(&self, level: u8) -> bool {
        level <= self.level
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

#[cfg(feature = "trace")]
pub fn init_tracer(level: Option<tracing::level_filters::LevelFilter>) -> anyhow::Result<()> {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    let default_filter = if cfg!(any(test, debug_assertions)) {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let default_filter = level.unwrap_or(default_filter);
    let filter_layer = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env_lossy();

    if std::env::var("GHOST_DISABLE_LOGS").is_ok() {
        return Ok(());
    }
    let to_stderr = std::env::var("GHOST_LOG_TO_STDERR").is_ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_level(true).pretty();
    let fmt_layer = if cfg!(any(test, debug_assertions)) {
        fmt_layer.with_file(true).with_line_number(true)
    } else {
        fmt_layer
    };
    let fmt_layer = if to_stderr {
        fmt_layer.with_writer(std::io::stderr).boxed()
    } else {
        fmt_layer.boxed()
    };

    let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
