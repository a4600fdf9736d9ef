use std::{error::Error, fmt, io, path::PathBuf};

/// A failed durable write or read.
///
/// Persistence failures are fatal for the mutation that caused them: the
/// caller aborts the state change and surfaces the error to the operator,
/// never retries it silently.
#[derive(Debug)]
pub struct PersistErr {
    pub path: PathBuf,
    pub op: &'static str,
    pub source: io::Error,
}

impl PersistErr {
    pub(crate) fn new(path: impl Into<PathBuf>, op: &'static str, source: io::Error) -> Self {
        Self {
            path: path.into(),
            op,
            source,
        }
    }
}

impl fmt::Display for PersistErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "persistence failure during {} on '{}': {}",
            self.op,
            self.path.display(),
            self.source
        )
    }
}

impl Error for PersistErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<PersistErr> for io::Error {
    fn from(value: PersistErr) -> Self {
        io::Error::new(value.source.kind(), value.to_string())
    }
}
