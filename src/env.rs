use std::path::Path;

use crate::error::{Error, Result};

/// Ordered environment mapping with case-insensitive keys.
///
/// Keys are normalized to upper case; a later write to an existing key
/// replaces its value in place, so the first-seen ordering is stable while
/// the last writer wins. Sources must therefore be applied from lowest to
/// highest precedence.
#[derive(Debug, Default)]
pub struct EnvMap {
    entries: Vec<(String, String)>,
}

impl EnvMap {
    pub fn new() -> Self {
        EnvMap::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let key = key.trim().to_uppercase();
        if key.is_empty() {
            return;
        }
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Load one dotenv-style file. Later calls override earlier keys.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let iter = dotenvy::from_path_iter(path).map_err(|e| Error::EnvFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        for item in iter {
            let (key, value) = item.map_err(|e| Error::EnvFile {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            self.set(&key, value);
        }
        Ok(())
    }

    /// Apply a literal `KEY=VALUE` entry. A bare `KEY` takes its value from
    /// the invoking process environment and is skipped when absent there.
    pub fn set_literal(&mut self, raw: &str) {
        match raw.split_once('=') {
            Some((key, value)) => self.set(key, value),
            None => {
                if let Ok(value) = std::env::var(raw.trim()) {
                    self.set(raw, value);
                }
            }
        }
    }

    /// Flat `KEY=VALUE` list in first-seen order.
    pub fn into_flat(self) -> Vec<String> {
        self.entries
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn env_file(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn later_sources_override_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let low = env_file(&dir, "low.env", "a=1\nKEEP=yes\n");
        let high = env_file(&dir, "high.env", "A=2\n");

        let mut env = EnvMap::new();
        env.load_file(&low).unwrap();
        env.load_file(&high).unwrap();
        env.set_literal("a=3");

        assert_eq!(env.into_flat(), vec!["A=3", "KEEP=yes"]);
    }

    #[test]
    fn ordering_is_first_seen() {
        let mut env = EnvMap::new();
        env.set("B", "1");
        env.set("A", "1");
        env.set("b", "2");
        assert_eq!(env.into_flat(), vec!["B=2", "A=1"]);
    }

    #[test]
    fn bare_literal_pulls_from_process_env() {
        std::env::set_var("STAGEHAND_TEST_PASSTHROUGH", "ok");
        let mut env = EnvMap::new();
        env.set_literal("STAGEHAND_TEST_PASSTHROUGH");
        env.set_literal("STAGEHAND_TEST_UNSET_VARIABLE");
        assert_eq!(env.into_flat(), vec!["STAGEHAND_TEST_PASSTHROUGH=ok"]);
    }

    #[test]
    fn missing_env_file_is_an_error() {
        let mut env = EnvMap::new();
        let err = env.load_file(Path::new("/nonexistent/x.env")).unwrap_err();
        assert!(matches!(err, Error::EnvFile { .. }));
    }
}
