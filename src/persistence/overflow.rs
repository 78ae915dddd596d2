//! On-disk overflow journal.
//!
//! One JSON-serialized `Message` per line, append-only. The bus writes here
//! when a message cannot (yet) be stored on every configured broker.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::broker::message::Message;
use crate::utils::error::Result;

#[derive(Debug, Clone)]
pub struct OverflowStore {
    path: PathBuf,
}

impl OverflowStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one message as a single line.
    pub fn push(&self, message: &Message) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Every queued message in file order. A missing file is an empty queue.
    pub fn load(&self) -> Result<Vec<Message>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(&line) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    "skipping unreadable overflow entry: {e}"
                ),
            }
        }
        Ok(messages)
    }

    /// Rewrite the journal so it holds exactly `messages`.
    pub fn replace(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return match fs::remove_file(&self.path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }

        let mut body = String::new();
        for msg in messages {
            body.push_str(&serde_json::to_string(msg)?);
            body.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
