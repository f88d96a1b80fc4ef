use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::browser::{BrowserController, BrowserLauncher};
use crate::config::BrowserConfig;
use crate::errors::{PilotError, PilotResult};

/// The one live browser, keyed by its profile directory. Tasks borrow it;
/// only the slot launches or closes it.
pub struct BrowserSlot {
    launcher: Arc<dyn BrowserLauncher>,
    current: Option<(PathBuf, Arc<dyn BrowserController>)>,
}

impl BrowserSlot {
    pub fn new(launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            launcher,
            current: None,
        }
    }

    pub fn profile(&self) -> Option<&Path> {
        self.current.as_ref().map(|(dir, _)| dir.as_path())
    }

    /// Reuses the live browser when the profile matches and it still answers;
    /// otherwise closes it and launches a fresh one.
    pub async fn acquire(&mut self, profile: &Path) -> PilotResult<Arc<dyn BrowserController>> {
        if let Some((dir, controller)) = self.current.take() {
            if dir == profile {
                match controller.select_page(false).await {
                    Ok(()) => {
                        tracing::debug!(profile = %dir.display(), "reusing browser");
                        self.current = Some((dir, controller.clone()));
                        return Ok(controller);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "browser no longer responds, relaunching");
                        close_quietly(controller.as_ref()).await;
                    }
                }
            } else {
                tracing::info!(from = %dir.display(), to = %profile.display(), "browser profile changed");
                close_quietly(controller.as_ref()).await;
            }
        }

        let controller = self.launcher.launch(profile).await?;
        tracing::info!(profile = %profile.display(), "browser launched");
        self.current = Some((profile.to_path_buf(), controller.clone()));
        Ok(controller)
    }

    pub async fn release(&mut self) {
        if let Some((dir, controller)) = self.current.take() {
            tracing::info!(profile = %dir.display(), "closing browser");
            close_quietly(controller.as_ref()).await;
        }
    }
}

async fn close_quietly(controller: &dyn BrowserController) {
    if let Err(e) = controller.close().await {
        tracing::debug!(error = %e, "browser close failed");
    }
}

/// Profile directory for a task: the isolated one by default, the real one
/// (which must exist) when safe mode is off.
pub fn profile_dir(config: &BrowserConfig, safe_mode: bool) -> PilotResult<PathBuf> {
    if safe_mode {
        return Ok(config.user_data_dir.clone());
    }
    let dir = config
        .unsafe_user_data_dir
        .clone()
        .filter(|d| !d.as_os_str().is_empty())
        .ok_or_else(|| {
            PilotError::Config("Unsafe mode requires browser.unsafe_user_data_dir in config.toml".into())
        })?;
    if !dir.is_dir() {
        return Err(PilotError::Config(format!(
            "Unsafe profile path not found: {}",
            dir.display()
        )));
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBrowser;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingLauncher {
        launched: Mutex<Vec<Arc<FakeBrowser>>>,
    }

    #[async_trait]
    impl BrowserLauncher for CountingLauncher {
        async fn launch(&self, _profile_dir: &Path) -> PilotResult<Arc<dyn BrowserController>> {
            let browser = Arc::new(FakeBrowser::default());
            self.launched.lock().unwrap().push(browser.clone());
            Ok(browser as Arc<dyn BrowserController>)
        }
    }

    #[tokio::test]
    async fn same_profile_reuses_browser() {
        let launcher = Arc::new(CountingLauncher::default());
        let mut slot = BrowserSlot::new(launcher.clone());
        slot.acquire(Path::new("/tmp/a")).await.unwrap();
        slot.acquire(Path::new("/tmp/a")).await.unwrap();
        let launched = launcher.launched.lock().unwrap().clone();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].calls(), vec!["select_page".to_string()]);
    }

    #[tokio::test]
    async fn profile_change_closes_previous_browser() {
        let launcher = Arc::new(CountingLauncher::default());
        let mut slot = BrowserSlot::new(launcher.clone());
        slot.acquire(Path::new("/tmp/a")).await.unwrap();
        slot.acquire(Path::new("/tmp/b")).await.unwrap();
        let launched = launcher.launched.lock().unwrap().clone();
        assert_eq!(launched.len(), 2);
        assert!(launched[0].is_closed());
        assert!(!launched[1].is_closed());
        assert_eq!(slot.profile(), Some(Path::new("/tmp/b")));

        slot.release().await;
        assert!(launched[1].is_closed());
        assert!(slot.profile().is_none());
    }

    #[test]
    fn unsafe_mode_needs_existing_profile() {
        let mut config = BrowserConfig::default();
        assert_eq!(profile_dir(&config, true).unwrap(), config.user_data_dir);
        assert!(matches!(profile_dir(&config, false), Err(PilotError::Config(_))));

        config.unsafe_user_data_dir = Some(PathBuf::from("/definitely/not/here"));
        assert!(matches!(profile_dir(&config, false), Err(PilotError::Config(_))));

        let real = tempfile::tempdir().unwrap();
        config.unsafe_user_data_dir = Some(real.path().to_path_buf());
        assert_eq!(profile_dir(&config, false).unwrap(), real.path());
    }
}
