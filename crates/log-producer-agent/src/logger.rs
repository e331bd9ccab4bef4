// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent diagnostics share the console with whatever else the container
//! prints, so every line is tagged for grepping:
//!
//! ```text
//! LOG_PRODUCER | WARN | Timed out waiting for pending memory to drain pending_bytes=104857912
//! LOG_PRODUCER | INFO | shipping{project="web"}: Flushed batch lines=512
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

const LOG_PREFIX: &str = "LOG_PRODUCER";

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "{LOG_PREFIX} | {} | ", event.metadata().level())?;
        write_span_path(ctx, &mut writer)?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Outermost span first, each as `name{fields}: `.
fn write_span_path<S, N>(
    ctx: &FmtContext<'_, S, N>,
    writer: &mut format::Writer<'_>,
) -> fmt::Result
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    let Some(scope) = ctx.event_scope() else {
        return Ok(());
    };
    for span in scope.from_root() {
        write!(writer, "{}", span.name())?;
        let extensions = span.extensions();
        match extensions.get::<FormattedFields<N>>() {
            Some(fields) if !fields.is_empty() => write!(writer, "{{{fields}}}: ")?,
            _ => write!(writer, ": ")?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::{info, info_span, warn};
    use tracing_subscriber::fmt::MakeWriter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn lines(&self) -> Vec<String> {
            let bytes = self.0.lock().unwrap();
            String::from_utf8_lossy(&bytes)
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture(emit: impl FnOnce()) -> Vec<String> {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_ansi(false)
            .event_format(Formatter)
            .finish();
        let guard = subscriber.set_default();
        emit();
        drop(guard);
        captured.lines()
    }

    #[test]
    fn test_event_without_span() {
        let lines = capture(|| warn!(pending_bytes = 42, "Timed out"));
        assert_eq!(
            lines,
            vec!["LOG_PRODUCER | WARN | Timed out pending_bytes=42"]
        );
    }

    #[test]
    fn test_nested_spans_are_listed_from_the_root() {
        let lines = capture(|| {
            let outer = info_span!("shipping", project = "p");
            let _outer = outer.enter();
            let inner = info_span!("flush");
            let _inner = inner.enter();
            info!(lines = 3, "flushed");
        });
        assert_eq!(
            lines,
            vec!["LOG_PRODUCER | INFO | shipping{project=\"p\"}: flush: flushed lines=3"]
        );
    }
}
