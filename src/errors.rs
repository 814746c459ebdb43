use color_eyre::Result;
use tracing::error;

/// Installs the `color_eyre` report hooks and routes panics into the log file.
///
/// Call once, before [crate::logging::init], from the application embedding this crate.
pub fn init() -> Result<()> {
    let (panic_hook, eyre_hook) = color_eyre::config::HookBuilder::default()
        .panic_section(format!(
            "This is a bug. Consider reporting it at {}",
            env!("CARGO_PKG_REPOSITORY")
        ))
        .capture_span_trace_by_default(false)
        .display_location_section(false)
        .display_env_section(false)
        .into_hooks();
    eyre_hook.install()?;

    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let msg = format!("{}", panic_hook.panic_report(panic_info));
        error!("Panic: {}", strip_ansi_escapes::strip_str(msg));
        previous_hook(panic_info);
    }));
    Ok(())
}
