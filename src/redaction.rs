use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;
use std::io::Write;

lazy_static! {
    static ref REDACTION_REGEX: Regex = Regex::new(
        r#"(?i)(sk-[A-Za-z0-9_\-]{20,}|Bearer\s+[^\s"]+|x-api-key:\s*[^\s"]+|[A-Z_]*API_KEY=[^\s"]+)"#
    )
    .expect("Invalid redaction regex");
}

/// Masks credentials in free text (API keys, bearer tokens, `*_API_KEY=` env
/// assignments).
pub fn redact(text: &str) -> Cow<'_, str> {
    REDACTION_REGEX.replace_all(text, "[REDACTED]")
}

/// Log writer that masks credentials before they hit disk. Backend stderr and
/// upstream error bodies end up in log lines verbatim, so this sits under the
/// file appender.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = redact(&input);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_known_secret_shapes() {
        let line = "auth failed: Bearer abc.def key=sk-ant-REDACTED \
                    env ANTHROPIC_API_KEY=xyz123";
        let out = redact(line);
        assert!(!out.contains("abc.def"));
        assert!(!out.contains("AAAAAAAA"));
        assert!(!out.contains("xyz123"));
        assert_eq!(out.matches("[REDACTED]").count(), 3);
    }

    #[test]
    fn test_plain_text_untouched() {
        assert!(matches!(redact("nothing secret here"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_writer_reports_original_length() {
        let mut sink = Vec::new();
        let mut writer = RedactingWriter::new(&mut sink);
        let input = b"token Bearer s3cr3t done";
        assert_eq!(writer.write(input).unwrap(), input.len());
        writer.flush().unwrap();
        assert_eq!(String::from_utf8(sink).unwrap(), "token [REDACTED] done");
    }
}
