use crate::error::Result;
use std::path::PathBuf;
use tracing::warn;

/// Previously entered URLs, most recent first, capped at `max_size`.
#[derive(Debug, Clone)]
pub struct History {
    path: PathBuf,
    max_size: usize,
}

impl History {
    pub fn new(path: impl Into<PathBuf>, max_size: usize) -> Self {
        Self {
            path: path.into(),
            max_size,
        }
    }

    /// Reads the list; an unreadable file counts as empty.
    pub fn load(&self) -> Vec<String> {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        match serde_json::from_str(&text) {
            Ok(urls) => urls,
            Err(e) => {
                warn!("Ignoring unreadable history {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    pub fn save(&self, urls: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let capped = &urls[..urls.len().min(self.max_size)];
        std::fs::write(&self.path, serde_json::to_string_pretty(capped)?)?;
        Ok(())
    }

    /// Moves `url` to the front, dropping the oldest entries past the cap.
    pub fn add(&self, url: &str) -> Result<()> {
        let mut urls = self.load();
        urls.retain(|u| u != url);
        urls.insert(0, url.to_string());
        self.save(&urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn most_recent_first_and_capped() {
        let temp = TempDir::new().unwrap();
        let history = History::new(temp.path().join("h.json"), 3);
        for url in ["a", "b", "c", "d"] {
            history.add(url).unwrap();
        }
        assert_eq!(history.load(), vec!["d", "c", "b"]);

        history.add("b").unwrap();
        assert_eq!(history.load(), vec!["b", "d", "c"]);
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("h.json");
        std::fs::write(&path, "[1, 2").unwrap();
        assert!(History::new(path, 5).load().is_empty());
    }
}
