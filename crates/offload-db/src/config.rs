use std::path::{Path, PathBuf};

/// Location of the embedded task database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_path: PathBuf,
}

impl DbConfig {
    /// Database file name within the state directory.
    pub const DB_FILE_NAME: &'static str = "tasks.db";

    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// Default location: `<data-dir>/offload/tasks.db`, honoring
    /// `XDG_DATA_HOME` on Linux via the `dirs` crate.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("offload")
            .join(Self::DB_FILE_NAME)
    }

    /// The directory that must exist before the database can be opened.
    pub fn state_dir(&self) -> Option<&Path> {
        self.database_path.parent()
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}
