use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the process-wide subscriber. Safe to call more than once; later
/// calls are ignored so the worker restart path can re-enter freely.
pub fn init(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}
