use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store: {0}")]
    Corrupt(&'static str),
    #[error("unsupported store version: {0}")]
    UnsupportedVersion(u32),
    #[error("{field} exceeds {max} bytes")]
    FieldTooLarge { field: &'static str, max: usize },
    #[error("item {0} is already stored")]
    DuplicateItem(String),
    #[error("storage used after close")]
    StorageClosed,
    #[error("queue manager is closed")]
    ManagerClosed,
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// True for faults raised by the backing medium (I/O, corruption, format).
    pub fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Corrupt(_) | Error::UnsupportedVersion(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn storage_faults_are_classified() {
        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_storage_fault());
        assert!(Error::Corrupt("bad record").is_storage_fault());
        assert!(Error::UnsupportedVersion(9).is_storage_fault());
        assert!(!Error::StorageClosed.is_storage_fault());
        assert!(!Error::ManagerClosed.is_storage_fault());
        assert!(!Error::DuplicateItem("a".into()).is_storage_fault());
    }

    #[test]
    fn messages_name_the_fault() {
        let err = Error::FieldTooLarge {
            field: "uuid",
            max: 65_535,
        };
        assert_eq!(err.to_string(), "uuid exceeds 65535 bytes");
        assert_eq!(Error::StorageClosed.to_string(), "storage used after close");
    }
}
