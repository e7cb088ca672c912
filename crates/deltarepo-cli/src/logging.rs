use std::{
    fmt::{self as stdfmt, Write as _},
    io,
};

use nu_ansi_term::Color::{Blue, DarkGray, Magenta, Red, Yellow};
use tracing::{
    field::{Field, Visit},
    Event, Level, Subscriber,
};
use tracing_subscriber::{
    fmt::{
        self,
        format::{FmtSpan, Writer},
        FmtContext, FormatEvent, FormatFields, MakeWriter,
    },
    registry::LookupSpan,
};

use crate::{cli::Args, utils::Colored};

pub fn level_for(verbose: u8, quiet: bool) -> Level {
    match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::INFO,
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    }
}

/// Collects the message and renders other fields as `key=value`.
#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: String,
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}

/// Plain messages for INFO, tagged ones for every other level.
struct MessageFormat;

impl<S, N> FormatEvent<S, N> for MessageFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        match *event.metadata().level() {
            Level::TRACE => write!(writer, "{} ", Colored(Magenta, "[TRACE]"))?,
            Level::DEBUG => write!(writer, "{} ", Colored(Blue, "[DEBUG]"))?,
            Level::INFO => {}
            Level::WARN => write!(writer, "{} ", Colored(Yellow, "[WARN]"))?,
            Level::ERROR => write!(writer, "{} ", Colored(Red, "[ERROR]"))?,
        }

        write!(writer, "{}", visitor.message)?;
        if !visitor.fields.is_empty() {
            write!(writer, "{}", Colored(DarkGray, visitor.fields))?;
        }
        writeln!(writer)
    }
}

/// Buffers one event and prints it with the progress bars suspended.
struct SuspendingWriter {
    buffer: Vec<u8>,
    stderr: bool,
}

impl io::Write for SuspendingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SuspendingWriter {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let output = String::from_utf8_lossy(&self.buffer);
        let output = output.trim_end_matches('\n');
        crate::progress::suspend(|| {
            if self.stderr {
                eprintln!("{output}");
            } else {
                println!("{output}");
            }
        });
    }
}

/// INFO goes to stdout, everything else to stderr. With `--json` stdout is
/// reserved for command results.
struct OutputRouter {
    json: bool,
}

impl<'a> MakeWriter<'a> for OutputRouter {
    type Writer = SuspendingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SuspendingWriter {
            buffer: Vec::new(),
            stderr: self.json,
        }
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        SuspendingWriter {
            buffer: Vec::new(),
            stderr: self.json || *meta.level() != Level::INFO,
        }
    }
}

pub fn setup_logging(args: &Args) {
    let level = level_for(args.verbose, args.quiet);

    let builder = fmt::Subscriber::builder()
        .with_env_filter(format!("deltarepo={level}"))
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .with_writer(OutputRouter {
            json: args.json,
        })
        .without_time();

    let subscriber: Box<dyn Subscriber + Send + Sync> = if args.json {
        Box::new(builder.json().flatten_event(true).finish())
    } else {
        Box::new(builder.event_format(MessageFormat).finish())
    };

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}
