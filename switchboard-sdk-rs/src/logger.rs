use chrono::Local;
use colored::*;
use std::env;
use std::fmt::Write as _;
use tracing_subscriber::EnvFilter;

/// Initializes the global logging system with colorized output and environment-based level filtering.
///
/// The `RUST_LOG` environment variable can be used to control the log level (default: info).
/// Example: `RUST_LOG=switchboard_sdk_rs=debug cargo run --example agent_demo`
pub fn init_logging() {
    if env::var("RUST_LOG").is_err() {
        unsafe { env::set_var("RUST_LOG", "info") };
    }

    // Force colored output even if not a TTY
    colored::control::set_override(true);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .with_writer(std::io::stdout)
        .event_format(CustomFormatter)
        .init();
}

struct CustomFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for CustomFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = Local::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let level = *event.metadata().level();

        let level_str = match level {
            tracing::Level::ERROR => "ERROR".red().bold().to_string(),
            tracing::Level::WARN => "WARN".yellow().bold().to_string(),
            tracing::Level::INFO => "INFO".green().bold().to_string(),
            tracing::Level::DEBUG => "DEBUG".blue().bold().to_string(),
            tracing::Level::TRACE => "TRACE".magenta().bold().to_string(),
        };

        write!(writer, "{} {} ", now.dimmed(), level_str)?;

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        write!(writer, "{}", visitor.message)?;
        if !visitor.fields.is_empty() {
            write!(writer, "{}", visitor.fields.dimmed())?;
        }
        writeln!(writer)
    }
}

/// Keeps the message unescaped and renders structured fields as ` key=value`.
#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: String,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            let _ = write!(self.message, "{}", value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

