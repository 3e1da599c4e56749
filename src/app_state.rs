use std::path::{Path, PathBuf};

const TEMP_DIR: &str = "temp";

async fn init_workspace(workspace: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(workspace.join(TEMP_DIR)).await?;
    Ok(())
}

/// Request-independent context shared with the handlers. Everything in here
/// is derived from configuration at startup and never mutated.
#[derive(Clone)]
pub struct AppState {
    pub temp_dir: PathBuf,
    pub jpeg_quality: u8,
}

impl AppState {
    pub async fn new(workspace: &Path, jpeg_quality: u8) -> anyhow::Result<Self> {
        init_workspace(workspace).await?;

        Ok(Self {
            temp_dir: workspace.join(TEMP_DIR),
            jpeg_quality,
        })
    }

    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.as_path()
    }
}
