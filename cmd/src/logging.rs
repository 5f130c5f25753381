//! Log formatting for the node binary.
//!
//! Two streams: tracing diagnostics in an aligned console format, and the
//! link event tap rendered as the `[CATEGORY]` lines the web UI translator
//! consumes.

use std::fmt;
use std::sync::Arc;

use hamstr_session::{EventBus, LinkEvent, LinkObserver};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SERVICE_NAME: &str = "hamstr-link";

/// Console formatter for tracing output.
pub struct LinkLogFormatter {
    color_enabled: bool,
}

impl LinkLogFormatter {
    pub fn new() -> Self {
        Self {
            color_enabled: std::env::var("TERM").map(|t| t != "dumb").unwrap_or(false),
        }
    }

    fn level_color(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            _ => COLOR_BRIGHT_GRAY,
        }
    }
}

impl Default for LinkLogFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for LinkLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = event.metadata().level();
        let color = self.level_color(level);
        let (cyan, reset) = if self.color_enabled {
            (COLOR_CYAN, COLOR_RESET)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{cyan}[{SERVICE_NAME}]{reset} [{color}{level:<5}{reset}] "
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Observer that prints every rendered link event line to stdout.
struct StdoutObserver;

impl LinkObserver for StdoutObserver {
    fn on_event(&self, event: &LinkEvent) {
        println!("{}", event.render());
    }
}

/// Attach the stdout line printer to the bus.
pub fn print_events(bus: &EventBus) {
    bus.subscribe(Arc::new(StdoutObserver));
}
