//! Logging setup shared by every V-Stack binary, so the coordinator, the
//! ingest worker, and the streaming client all accept the same flags and
//! emit the same shape of logs.

/// Logging arguments, exposed identically by all V-Stack executables.
#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// Log verbosity. Accepts a tracing directive, e.g. "info" or
    /// "stream_client=debug,info".
    #[clap(long = "log-level", env = "VSTACK_LOG_LEVEL", default_value = "info", global = true)]
    pub level: String,

    /// Output format for logs.
    #[clap(long = "log-format", env = "VSTACK_LOG_FORMAT", value_enum, global = true)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, clap::ValueEnum, Clone, Copy)]
pub enum LogFormat {
    /// One JSON object per line on stderr, for programmatic consumers.
    Json,
    /// Plain text without colors.
    Text,
    /// Plain text with ANSI colors for interactive terminals.
    Color,
}

fn default_log_format() -> LogFormat {
    if atty::is(atty::Stream::Stderr) {
        LogFormat::Color
    } else {
        LogFormat::Json
    }
}

/// Initializes the global tracing subscriber. Panics if called twice.
pub fn init_logging(args: &LogArgs) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(args.level.as_str())
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_target(false);

    match args.format.unwrap_or_else(default_log_format) {
        LogFormat::Json => builder.json().flatten_event(true).init(),
        LogFormat::Text => builder.compact().with_ansi(false).init(),
        LogFormat::Color => builder.compact().with_ansi(true).init(),
    }
}
