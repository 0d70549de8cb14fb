use crate::state::{AppState, PersistedApp, Theme};
use llamachat_backend::storage::{self, Storage, StoreSlice};
use llamachat_backend::AppSettings;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::watch;

/// Application settings and theme, backed by the persisted settings document.
#[derive(Clone)]
pub struct SettingsStore {
    state: Arc<watch::Sender<AppState>>,
    storage: Arc<Storage>,
}

impl SettingsStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        let (state, _) = watch::channel(AppState::default());
        Self {
            state: Arc::new(state),
            storage,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> AppState {
        self.state.borrow().clone()
    }

    pub async fn load_settings(&self) {
        let settings = self.storage.load_settings().await;
        let app = self.storage.load_slice::<PersistedApp>(StoreSlice::App).await;
        self.state.send_modify(|state| {
            state.theme = Theme::from_dark_mode(settings.dark_mode);
            state.settings = settings;
            if let Some(app) = app {
                state.is_first_launch = app.is_first_launch;
            }
        });
    }

    /// Applies `f` and persists the result. Save failures are logged only.
    pub async fn update_settings(&self, f: impl FnOnce(&mut AppSettings)) {
        let mut settings = AppSettings::default();
        self.state.send_modify(|state| {
            let dark_mode = state.settings.dark_mode;
            f(&mut state.settings);
            if state.settings.dark_mode != dark_mode {
                state.theme = Theme::from_dark_mode(state.settings.dark_mode);
            }
            settings = state.settings.clone();
        });
        self.save(&settings).await;
    }

    pub async fn set_theme(&self, theme: Theme) {
        let mut settings = AppSettings::default();
        self.state.send_modify(|state| {
            state.theme = theme;
            state.settings.dark_mode = theme == Theme::Dark;
            settings = state.settings.clone();
        });
        self.save(&settings).await;
    }

    pub async fn set_first_launch(&self, is_first_launch: bool) {
        self.state
            .send_modify(|state| state.is_first_launch = is_first_launch);
        let app = PersistedApp { is_first_launch };
        if let Err(err) = self.storage.save_slice(StoreSlice::App, &app).await {
            warn!("Error saving app state: {err}");
        }
    }

    /// Deletes every persisted conversation, message and setting.
    pub async fn reset_app(&self) -> Result<(), storage::Error> {
        self.storage.clear_all_data().await?;
        self.state.send_replace(AppState::default());
        info!("App reset to defaults");
        Ok(())
    }

    async fn save(&self, settings: &AppSettings) {
        if let Err(err) = self.storage.save_settings(settings).await {
            warn!("Error saving settings: {err}");
        }
    }
}
