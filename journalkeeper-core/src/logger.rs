use slog::{o, Drain, Logger};

/// Builds the root logger every component hangs its child loggers off of.
pub fn get_root_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}
