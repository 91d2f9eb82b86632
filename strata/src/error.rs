pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IO(std::io::Error),
    Table(stele::Error),
    /// An on-disk invariant does not hold: a manifest-referenced file is
    /// missing, a manifest record fails its checksum, or replay reaches an
    /// impossible state.
    Corruption(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IO(e)
    }
}

impl From<stele::Error> for Error {
    fn from(e: stele::Error) -> Self {
        Error::Table(e)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::IO(e) => write!(f, "io: {}", e),
            Error::Table(e) => write!(f, "table: {}", e),
            Error::Corruption(msg) => write!(f, "corruption: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
