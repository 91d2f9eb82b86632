pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IO(std::io::Error),
    Mmap(fmmap::error::Error),
    ChecksumMismatch { expected: u32, actual: u32 },
    Corrupted(String),
    InvalidFilename(std::path::PathBuf),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IO(e)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::IO(e) => write!(f, "io: {}", e),
            Error::Mmap(e) => write!(f, "mmap: {}", e),
            Error::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, actual {actual}")
            }
            Error::Corrupted(msg) => write!(f, "corrupted table: {}", msg),
            Error::InvalidFilename(path) => {
                write!(f, "invalid table filename: {}", path.display())
            }
        }
    }
}

impl std::error::Error for Error {}
