//! Delivery of lifecycle [`Event`]s to the external observer.

use std::io::Write;
use std::sync::Mutex;

use hostagent_api::Event;
use time::OffsetDateTime;
use tracing::{Span, error};

/// Sink for lifecycle events.
///
/// Implementations must be callable from several tasks at once and must not
/// fail the caller: delivery is best-effort.
pub trait Reporter: Send + Sync {
    fn report(&self, event: Event);
}

impl Reporter for () {
    fn report(&self, _event: Event) {}
}

/// Writes each event as one JSON document followed by a newline.
pub struct JsonLinesReporter<W> {
    writer: Mutex<W>,
    span: Span,
}

impl<W: Write + Send> JsonLinesReporter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> Reporter for JsonLinesReporter<W> {
    fn report(&self, mut event: Event) {
        if event.time.is_none() {
            event.time = Some(OffsetDateTime::now_utc());
        }

        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(err) => {
                error!(parent: &self.span, ?event, error = %err, "failed to emit an event");
                return;
            }
        };
        line.push(b'\n');

        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writer.write_all(&line).and_then(|()| writer.flush()) {
            error!(parent: &self.span, ?event, error = %err, "failed to emit an event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostagent_api::Status;
    use regex::Regex;
    use std::io;
    use std::sync::Arc;

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stamps_time_when_missing() {
        let reporter = JsonLinesReporter::new(Vec::new());
        reporter.report(Event::new(Status::booting(60022)));

        let output = String::from_utf8(reporter.into_inner()).unwrap();
        let pattern =
            Regex::new(r#"^\{"time":"\d{4}-\d{2}-\d{2}T[^"]+","status":\{"sshLocalPort":60022\}\}\n$"#)
                .unwrap();
        assert!(pattern.is_match(&output), "unexpected output: {output}");
    }

    #[test]
    fn write_failures_are_swallowed() {
        let reporter = JsonLinesReporter::new(BrokenPipe);
        reporter.report(Event::new(Status::aborted()));
    }

    #[test]
    fn concurrent_reports_produce_whole_lines() {
        let reporter = Arc::new(JsonLinesReporter::new(Vec::new()));
        let handles: Vec<_> = (0..8)
            .map(|port| {
                let reporter = Arc::clone(&reporter);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        reporter.report(Event::new(Status::booting(1000 + port)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reporter = Arc::try_unwrap(reporter).ok().unwrap();
        let output = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 400);
        for line in lines {
            let event: Event = serde_json::from_str(line).unwrap();
            assert!(event.time.is_some());
        }
    }
}
