//! Remote file handles

use crate::{OpenMode, RemoteSession, TransportError};
use std::sync::Arc;

/// A file on a remote host, opened through a session
#[derive(Debug)]
pub struct RemoteFile {
    session: Arc<dyn RemoteSession>,
    path: String,
    mode: OpenMode,
    truncated: bool,
}

impl RemoteFile {
    /// Bind a path on `session` in the given mode
    pub fn new(session: Arc<dyn RemoteSession>, path: impl Into<String>, mode: OpenMode) -> Self {
        Self {
            session,
            path: path.into(),
            mode,
            truncated: false,
        }
    }

    /// Remote path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Mode the file was opened with
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Read the whole file
    pub async fn read_to_end(&self) -> Result<Vec<u8>, TransportError> {
        self.session.read_file(&self.path).await
    }

    /// Read the whole file as UTF-8
    pub async fn read_to_string(&self) -> Result<String, TransportError> {
        let bytes = self.read_to_end().await?;
        String::from_utf8(bytes).map_err(|e| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    /// Write `data`; the first write in `Write` mode truncates the file
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let append = match self.mode {
            OpenMode::Read => {
                return Err(TransportError::Configuration(format!(
                    "{} is opened read-only",
                    self.path
                )))
            }
            OpenMode::Write => self.truncated,
            OpenMode::Append => true,
        };

        self.session.write_file(&self.path, data, append).await?;
        self.truncated = true;
        Ok(())
    }
}
