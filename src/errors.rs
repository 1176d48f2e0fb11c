use thiserror::Error;

/// Enumerated error kinds, one per failure class the core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    // resource
    #[error("out of memory")]
    NoMem,
    #[error("no resource available")]
    NoRsc,
    #[error("resource busy")]
    Busy,
    #[error("object too big")]
    TooBig,
    #[error("timeout")]
    Timeout,

    // i/o
    #[error("cannot open")]
    Open,
    #[error("cannot close")]
    Close,
    #[error("cannot read")]
    Read,
    #[error("cannot write")]
    Write,
    #[error("cannot seek")]
    Seek,
    #[error("cannot stat")]
    Stat,
    #[error("cannot move")]
    Move,
    #[error("cannot remove")]
    Remove,
    #[error("cannot map")]
    Map,
    #[error("cannot unmap")]
    Umap,
    #[error("cannot sync")]
    Sync,
    #[error("cannot flush")]
    Flush,
    #[error("cannot truncate")]
    Trunc,
    #[error("cannot create")]
    Create,
    #[error("cannot drop")]
    Drop,

    // domain
    #[error("invalid argument")]
    Invalid,
    #[error("not supported")]
    NotSupp,
    #[error("bad path")]
    BadPath,
    #[error("bad name")]
    BadName,
    #[error("catalog corrupted")]
    Catalog,
    #[error("bad magic")]
    Magic,
    #[error("bad block")]
    BadBlock,
    #[error("bad file size")]
    BadFilesize,

    // lookup
    #[error("end of file")]
    Eof,
    #[error("not found")]
    NotFound,
    #[error("key not found")]
    KeyNotFound,
    #[error("duplicate key")]
    DupKey,
    #[error("duplicate name")]
    DupName,

    // concurrency
    #[error("cannot lock")]
    Lock,
    #[error("cannot unlock")]
    Ulock,
    #[error("thread error")]
    Thread,
    #[error("sleep interrupted")]
    Sleep,
    #[error("queue error")]
    Queue,
    #[error("cannot enqueue")]
    Enqueue,
    #[error("worker error")]
    Worker,
    #[error("signal error")]
    Signal,

    // storage
    #[error("store error")]
    Store,
    #[error("context error")]
    Context,
    #[error("scope error")]
    Scope,
    #[error("index error")]
    Index,
    #[error("tree error")]
    Tree,
    #[error("version mismatch")]
    Version,
    #[error("compression error")]
    Comp,
    #[error("decompression error")]
    Decomp,
    #[error("compression dictionary error")]
    CompDict,

    // protocol / server
    #[error("protocol error")]
    Protocol,
    #[error("server error")]
    Server,
    #[error("socket error")]
    Socket,
    #[error("cannot bind")]
    Bind,
    #[error("cannot listen")]
    Listen,
    #[error("cannot accept")]
    Accept,
    #[error("bad address")]
    Addr,

    // scripting
    #[error("python error")]
    Python,
    #[error("lua error")]
    Lua,
    #[error("unknown symbol")]
    UnkSymbol,
    #[error("user error")]
    UsrErr,

    // parsing
    #[error("parser error")]
    Parser,

    // internal
    #[error("panic")]
    Panic,
}

/// Error descriptor: kind + originating object, optional OS errno,
/// optional free-form detail and an optional cause chain.
#[derive(Debug)]
pub struct NowError {
    pub kind: ErrorKind,
    pub object: &'static str,
    pub info: Option<String>,
    pub errno: Option<i32>,
    pub cause: Option<Box<NowError>>,
}

impl std::fmt::Display for NowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.kind, self.object)?;
        if let Some(info) = &self.info {
            write!(f, ": {info}")?;
        }
        if let Some(errno) = self.errno {
            write!(f, " (os error {errno})")?;
        }
        Ok(())
    }
}

impl std::error::Error for NowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

pub type Result<T> = std::result::Result<T, NowError>;

impl NowError {
    #[must_use]
    pub fn new(kind: ErrorKind, object: &'static str) -> Self {
        Self { kind, object, info: None, errno: None, cause: None }
    }

    #[must_use]
    pub fn with(kind: ErrorKind, object: &'static str, info: impl Into<String>) -> Self {
        Self { kind, object, info: Some(info.into()), errno: None, cause: None }
    }

    /// Wrap an OS error, keeping the errno for diagnostics.
    #[must_use]
    pub fn os(kind: ErrorKind, object: &'static str, e: &std::io::Error) -> Self {
        Self { kind, object, info: Some(e.to_string()), errno: e.raw_os_error(), cause: None }
    }

    /// Chain a cause without translating the kind.
    #[must_use]
    pub fn caused(mut self, cause: NowError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// True when this error (not its causes) is `Eof`.
    /// Eof is not an error at the cursor boundary.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.kind == ErrorKind::Eof
    }

    #[must_use]
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

/// Shorthand used by the leaf components.
#[macro_export]
macro_rules! errof {
    ($kind:ident, $obj:expr) => {
        $crate::errors::NowError::new($crate::errors::ErrorKind::$kind, $obj)
    };
    ($kind:ident, $obj:expr, $($arg:tt)+) => {
        $crate::errors::NowError::with(
            $crate::errors::ErrorKind::$kind, $obj, format!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_chain_is_source() {
        let inner = NowError::new(ErrorKind::Read, "file");
        let outer = NowError::new(ErrorKind::Store, "store").caused(inner);
        let src = std::error::Error::source(&outer).expect("source");
        assert!(src.to_string().contains("cannot read"));
    }

    #[test]
    fn eof_detection() {
        assert!(NowError::new(ErrorKind::Eof, "reader").is_eof());
        assert!(!NowError::new(ErrorKind::Timeout, "queue").is_eof());
    }
}
