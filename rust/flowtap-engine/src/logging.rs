use crate::config::LogLevel;
use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

const LOG_BUFFER_SIZE: usize = 2000;

/// Recent log lines kept for the host UI
static LOG_BUFFER: Mutex<LogBuffer> = Mutex::new(LogBuffer::new(LOG_BUFFER_SIZE));

/// Buffer for storing recent log messages
pub struct LogBuffer {
    logs: VecDeque<String>,
    max_size: usize,
}

impl LogBuffer {
    pub const fn new(max_size: usize) -> Self {
        Self {
            logs: VecDeque::new(),
            max_size,
        }
    }

    pub fn push(&mut self, log: String) {
        if self.logs.len() >= self.max_size {
            self.logs.pop_front();
        }
        self.logs.push_back(log);
    }

    pub fn get_logs(&self, count: usize) -> Vec<String> {
        if count == 0 || count >= self.logs.len() {
            return self.logs.iter().cloned().collect();
        }
        let start = self.logs.len() - count;
        self.logs.iter().skip(start).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.logs.clear();
    }
}

/// Get recent logs from the buffer
pub fn get_recent_logs(count: usize) -> Vec<String> {
    LOG_BUFFER.lock().get_logs(count)
}

/// Clear the log buffer
pub fn clear_logs() {
    LOG_BUFFER.lock().clear();
}

fn add_log(message: String) {
    LOG_BUFFER.lock().push(message);
}

/// Initialize logging system
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level);
    });

    result
}

fn directive(text: String) -> Result<tracing_subscriber::filter::Directive> {
    text.parse()
        .map_err(|e| EngineError::Config(format!("Invalid log directive {}: {}", text, e)))
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let tracing_level = match level {
        LogLevel::Silent => return Ok(()),
        LogLevel::Error => Level::ERROR,
        LogLevel::Warning => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(directive(format!("flowtap_engine={}", tracing_level))?)
        .add_directive(directive(format!("flowtap_sock2proc={}", tracing_level))?)
        .add_directive(directive("tokio=warn".to_string())?)
        .add_directive(directive("mio=warn".to_string())?);

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .with_filter(filter);

    let result = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BufferLayer)
        .try_init();

    // Another subscriber may already be installed by the host
    if result.is_err() {
        add_log("[INFO] Tracing already initialized, using existing subscriber".to_string());
    } else {
        tracing::info!("Logging initialized at level: {:?}", level);
    }
    Ok(())
}

/// Layer that copies events into the recent-log buffer
struct BufferLayer;

impl<S> Layer<S> for BufferLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();
        if !metadata.target().starts_with("flowtap") {
            return;
        }
        // Per-packet chatter would flush the buffer in seconds
        if *metadata.level() == Level::TRACE {
            return;
        }

        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        add_log(format!("[{}] [{}] {}", timestamp, metadata.level(), visitor.message));
    }
}

#[derive(Default)]
struct LogVisitor {
    message: String,
}

impl tracing::field::Visit for LogVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = value.to_string();
        } else {
            self.message.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = format!("{:?}", value);
        } else {
            self.message.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}
