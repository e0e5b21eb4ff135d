use std::fmt::Display;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Where user-facing progress lines go.
///
/// Cloning is cheap and every clone writes to the same writer. Lines from
/// concurrent stages never interleave, but their order is not defined.
#[derive(Clone)]
pub struct OutputSink {
    writer: Arc<Mutex<dyn Write + Send>>,
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink").finish_non_exhaustive()
    }
}

impl OutputSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn discard() -> Self {
        Self::new(io::sink())
    }

    /// A sink writing into memory, and a handle to read what was written.
    pub fn capture() -> (Self, CapturedOutput) {
        let buf = SharedBuf::default();
        (Self::new(buf.clone()), CapturedOutput(buf))
    }

    pub fn line(&self, message: impl Display) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        if let Err(err) = writeln!(writer, "{message}").and_then(|()| writer.flush()) {
            tracing::error!(error = %err, "failed to write to output log");
        }
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.0.lock().map_err(|_| io::Error::other("lock poisoned"))?;
        inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Everything written to a [`OutputSink::capture`] sink so far.
#[derive(Clone)]
pub struct CapturedOutput(SharedBuf);

impl CapturedOutput {
    pub fn contents(&self) -> String {
        let buf = self.0 .0.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }
}
