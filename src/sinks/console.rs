use crate::error::DeliveryError;
use crate::record::{level, LogRecord};
use crate::reporter::Sink;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use colored::Colorize;
use std::io::Write;
use std::sync::Mutex;

/// Writes batches to stdout (or any writer); never fails delivery
pub struct ConsoleSink {
    pretty: bool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn new(pretty: bool) -> Self {
        Self::with_writer(pretty, Box::new(std::io::stdout()))
    }

    pub fn with_writer(pretty: bool, out: Box<dyn Write + Send>) -> Self {
        Self {
            pretty,
            out: Mutex::new(out),
        }
    }

    fn render(&self, record: &LogRecord) -> String {
        if !self.pretty {
            return serde_json::to_string(record).unwrap_or_else(|_| record.message.clone());
        }

        let time = Utc
            .timestamp_millis_opt(record.time)
            .single()
            .map(|t| t.format("%H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| record.time.to_string());
        let label = level::label(record.level);
        let label = match record.level {
            l if l >= level::ERROR => label.red().bold(),
            l if l >= level::WARN => label.yellow(),
            l if l >= level::INFO => label.green(),
            _ => label.dimmed(),
        };

        let mut line = format!("{} {:5} {}", time.dimmed(), label, record.message);
        if !record.context.is_empty() {
            let context = serde_json::Value::Object(record.context.clone());
            line.push(' ');
            line.push_str(&context.to_string().dimmed().to_string());
        }
        line.push_str(&format!(" trace={}", &record.trace.trace_id).dimmed().to_string());
        line
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn log_batch(&self, records: &[LogRecord]) -> Result<(), DeliveryError> {
        let lines: Vec<String> = records.iter().map(|r| self.render(r)).collect();
        let mut out = self.out.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for line in lines {
            if let Err(e) = writeln!(out, "{}", line) {
                tracing::debug!(error = %e, "Console write failed");
                break;
            }
        }
        let _ = out.flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::new_context;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[tokio::test]
    async fn test_json_lines() {
        let buf = SharedBuf::default();
        let sink = ConsoleSink::with_writer(false, Box::new(buf.clone()));

        let record = LogRecord::new(1, level::INFO, "hello", new_context()).with_context("k", "v");
        sink.log_batch(&[record.clone(), record]).await.unwrap();

        let text = buf.text();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: LogRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.message, "hello");
    }

    #[tokio::test]
    async fn test_pretty_line() {
        colored::control::set_override(false);
        let buf = SharedBuf::default();
        let sink = ConsoleSink::with_writer(true, Box::new(buf.clone()));

        let record = LogRecord::new(1_700_000_000_000, level::ERROR, "disk full", new_context());
        sink.log(record).await.unwrap();

        let text = buf.text();
        assert!(text.contains("ERROR"));
        assert!(text.contains("disk full"));
        assert!(text.contains("22:13:20.000"));
    }
}
