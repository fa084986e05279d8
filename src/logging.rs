// Centralized logging setup for tracing with runtime log level, file logging, and structured output
use eyre::{Result, WrapErr};
use std::env;
use std::fs;
use std::sync::OnceLock; // For global file guard
use std::time::{Duration, Instant};
use tracing::{Id, Subscriber, debug, field::Field, field::Visit, span};
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Context, Layer, SubscriberExt},
    util::SubscriberInitExt,
};

const CRATE_TARGET: &str = "minvol_portfolio";

static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Console logs always, JSON file logs under `logs/` when `LOG_TO_FILE=true`.
/// Spans created with `on_close = true` report their busy and idle time.
pub fn init_logging(bin_name: String) -> Result<()> {
    // Load log levels for console and file from env
    let console_log_level = env::var("CONSOLE_LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string());
    let file_log_level = env::var("FILE_LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string());
    let log_to_file = env::var("LOG_TO_FILE").unwrap_or_else(|_| "false".to_string()) == "true";

    // Dependencies log at warn, this crate and the running binary at the configured level
    let bin_target = bin_name.replace('-', "_");
    let env_filter_console = crate_filter(&console_log_level, &bin_target);
    let env_filter_file = crate_filter(&file_log_level, &bin_target);

    // Console layer: always enabled, pretty human-readable logs
    let console_layer = fmt::Layer::new().pretty().with_filter(env_filter_console);
    let timing_layer = SpanTimingLayer;

    if log_to_file {
        let timestamp = chrono::Local::now().format("%Y-%m-%d_%H:%M:%S").to_string();
        let log_dir = std::path::Path::new("logs");
        fs::create_dir_all(log_dir).wrap_err("Failed to create log directory")?;
        let log_file_name = format!("{bin_name}_{timestamp}.log");

        let file_appender = tracing_appender::rolling::never(log_dir, log_file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        FILE_GUARD.set(guard).ok(); // Store the guard globally

        // File layer: structured JSON logs with UTC timestamps
        let file_layer = fmt::Layer::new()
            .json()
            .with_writer(non_blocking)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_filter(env_filter_file);

        tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .with(timing_layer)
            .try_init()
            .wrap_err("Failed to install tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(console_layer)
            .with(timing_layer)
            .try_init()
            .wrap_err("Failed to install tracing subscriber")?;
    }
    Ok(())
}

fn crate_filter(level: &str, bin_target: &str) -> EnvFilter {
    EnvFilter::try_new(format!("warn,{CRATE_TARGET}={level},{bin_target}={level}"))
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,{CRATE_TARGET}=info")))
}

// Custom layer to track span timing for specific spans with "on_close" field = true
struct SpanTimingLayer;

struct StartInstant(Instant);
struct LastInstant(Instant);
struct BusyTime(Duration);
struct IdleTime(Duration);

struct OnCloseVisitor<'a> {
    on_close: &'a mut bool,
}

impl Visit for OnCloseVisitor<'_> {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "on_close" {
            *self.on_close = value;
        }
    }
    fn record_debug(&mut self, _field: &Field, _value: &dyn std::fmt::Debug) {}
}

impl<S> Layer<S> for SpanTimingLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut on_close = false;
        attrs.record(&mut OnCloseVisitor { on_close: &mut on_close });
        if on_close {
            let mut extensions = span.extensions_mut();
            let now = Instant::now();
            extensions.insert(StartInstant(now));
            extensions.insert(LastInstant(now)); // last enter/exit
            extensions.insert(BusyTime(Duration::ZERO));
            extensions.insert(IdleTime(Duration::ZERO));
        }
    }

    // Time since the last exit was idle
    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut exts = span.extensions_mut();
        let Some(LastInstant(last)) = exts.remove::<LastInstant>() else { return };
        let idle = exts.remove::<IdleTime>().map(|it| it.0).unwrap_or(Duration::ZERO);
        exts.insert(IdleTime(idle + last.elapsed()));
        exts.insert(LastInstant(Instant::now()));
    }

    // Time since the last enter was busy
    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut exts = span.extensions_mut();
        let Some(LastInstant(last)) = exts.remove::<LastInstant>() else { return };
        let busy = exts.remove::<BusyTime>().map(|bt| bt.0).unwrap_or(Duration::ZERO);
        exts.insert(BusyTime(busy + last.elapsed()));
        exts.insert(LastInstant(Instant::now()));
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(&id) else { return };
        let timings = {
            let mut exts = span.extensions_mut();
            exts.remove::<StartInstant>().map(|StartInstant(start)| {
                let busy_time = exts.remove::<BusyTime>().map(|bt| bt.0).unwrap_or(Duration::ZERO);
                let idle_time = exts.remove::<IdleTime>().map(|it| it.0).unwrap_or(Duration::ZERO);
                (start.elapsed(), busy_time, idle_time)
            })
        };
        if let Some((total_time, busy_time, idle_time)) = timings {
            debug!(
                span = span.name(),
                busy_time = ?busy_time,
                idle_time = ?idle_time,
                total_time = ?total_time,
                "span closed"
            );
        }
    }
}
