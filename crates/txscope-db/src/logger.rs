//! Named log entries for the connection manager.

use tracing::Span;

/// Builds the `tracing` spans the connection manager logs under.
pub trait LoggerBuilder: Send + Sync {
    /// An entry tagged with a logger name.
    fn named_entry(&self, name: &str) -> Span;

    /// An entry tagged with a logger name and a fixed set of key/value fields
    /// that every event inside it carries.
    fn named_entry_with_fields(&self, name: &str, fields: &[(&str, String)]) -> Span;
}

/// Spans at `INFO` level under the `txscope` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLoggerBuilder;

impl LoggerBuilder for DefaultLoggerBuilder {
    fn named_entry(&self, name: &str) -> Span {
        tracing::info_span!("txscope", logger = name)
    }

    fn named_entry_with_fields(&self, name: &str, fields: &[(&str, String)]) -> Span {
        tracing::info_span!("txscope", logger = name, fields = %render_fields(fields))
    }
}

/// `key=value` pairs separated by spaces, in the order given.
fn render_fields(fields: &[(&str, String)]) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_render_in_order() {
        let rendered = render_fields(&[
            ("db", "ca-api-gateway".to_string()),
            ("path", "/tmp/app.sqlite".to_string()),
        ]);
        assert_eq!(rendered, "db=ca-api-gateway path=/tmp/app.sqlite");
        assert_eq!(render_fields(&[]), "");
    }
}
