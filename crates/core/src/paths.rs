use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".keyward"))
            .unwrap_or_else(|| PathBuf::from(".keyward"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.base.join("credentials.json")
    }

    /// Persisted scope records, one JSON file per scope.
    pub fn scopes_dir(&self) -> PathBuf {
        self.base.join("scopes")
    }

    pub fn scope_file(&self, scope_id: &str) -> PathBuf {
        let safe_id = scope_id.replace([':', '/', '\\'], "_");
        self.scopes_dir().join(format!("{}.json", safe_id))
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.base.join("tmp")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.scopes_dir())?;
        std::fs::create_dir_all(self.tmp_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
