//! Log formatting on the simulated clock.
//!
//! Log lines carry the tick of the event being handled and the CPU it
//! concerns instead of wall-clock time:
//!
//! ```text
//! [        12_500 c03] DEBUG running cpu=3 entity=S1
//! ```

use std::fmt::{self, Write as _};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use crate::event::{sim_clock, sim_cpu};
use crate::types::{CpuId, Tick};

/// Tick count grouped by thousands, followed by the CPU (`c--` when the
/// event is not bound to one).
pub struct FmtTs {
    pub ticks: Tick,
    pub cpu: Option<CpuId>,
}

impl FmtTs {
    pub fn new(ticks: Tick, cpu: Option<CpuId>) -> Self {
        FmtTs { ticks, cpu }
    }
}

/// `1234567` → `1_234_567`.
pub(crate) fn fmt_grouped(v: u64) -> String {
    let digits = v.to_string();
    let head = match digits.len() % 3 {
        0 => 3,
        n => n,
    };
    let (first, rest) = digits.split_at(head.min(digits.len()));
    let mut out = String::from(first);
    for group in rest.as_bytes().chunks(3) {
        out.push('_');
        // Digits are ASCII.
        out.extend(group.iter().map(|&b| b as char));
    }
    out
}

impl fmt::Display for FmtTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>15} ", fmt_grouped(self.ticks))?;
        match self.cpu {
            Some(cpu) => write!(f, "c{:02}", cpu.0),
            None => f.write_str("c--"),
        }
    }
}

fn level_color(level: Level) -> &'static str {
    match level {
        Level::ERROR => "\x1b[31m",
        Level::WARN => "\x1b[33m",
        Level::INFO => "\x1b[32m",
        Level::DEBUG => "\x1b[34m",
        Level::TRACE => "\x1b[35m",
    }
}

/// `tracing-subscriber` event formatter for simulations.
pub struct SimFormat;

impl<S, N> FormatEvent<S, N> for SimFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();
        write!(writer, "[{}] ", FmtTs::new(sim_clock(), sim_cpu()))?;
        if writer.has_ansi_escapes() {
            write!(writer, "{}{level:>5}\x1b[0m ", level_color(level))?;
        } else {
            write!(writer, "{level:>5} ")?;
        }

        let mut line = LineBuilder::default();
        event.record(&mut line);
        writeln!(writer, "{}{}", line.message, line.fields)
    }
}

/// Renders an event as its message followed by ` key=value` pairs.
#[derive(Default)]
struct LineBuilder {
    message: String,
    fields: String,
}

impl LineBuilder {
    fn field(&mut self, field: &Field, value: impl fmt::Display) {
        let _ = write!(self.fields, " {}={value}", field.name());
    }
}

impl Visit for LineBuilder {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.field(field, format_args!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            self.field(field, value);
        }
    }

    // Utilizations and power deltas; full precision is noise in a log.
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.field(field, format_args!("{value:.4}"));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.field(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.field(field, value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.field(field, value);
    }
}
