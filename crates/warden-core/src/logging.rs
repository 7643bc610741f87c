use crate::Result;

/// Initialize logging/tracing for the bot.
///
/// Installs a global fmt subscriber; calling it twice is harmless (the second
/// install attempt is ignored).
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    // Default: info for our crates, warn for everything else.
    // Can be overridden with `RUST_LOG`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,warden=info,warden_core=info,warden_sqlite=info,warden_commands=info,warden_telegram=info,{}=info",
            service_name.replace('-', "_")
        ))
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(true)
        .try_init();

    Ok(())
}
