use lazy_static::lazy_static;
use regex::Regex;
use std::io::Write;
use tracing_subscriber::fmt::MakeWriter;

lazy_static! {
    static ref REDACTION_REGEX: Option<Regex> = Regex::new(
        r"(?i)(sk-[A-Za-z0-9_\-]{16,}|Bearer\s+[^\s]+|x-api-key:\s*[^\s]+|api key:\s*[^\s]+)"
    )
    .ok();
}

/// Masks credentials in a line of log output.
pub fn redact_line(input: &str) -> std::borrow::Cow<'_, str> {
    match REDACTION_REGEX.as_ref() {
        Some(re) => re.replace_all(input, "[REDACTED]"),
        None => std::borrow::Cow::Borrowed(input),
    }
}

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
        let redacted = redact_line(&input);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// `MakeWriter` wrapper so fmt layers write through [`RedactingWriter`].
#[derive(Clone)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}
