use crate::error::{AppError, Result};
use crate::profile::{Profile, ProfileResolver, Settings};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Configuration management for the application.
///
/// Two layers live here:
/// - `Config`: where the session keeps its files
/// - `ConfigStore`: the JSON file holding global defaults and named profiles

pub const DEFAULT_PROFILE: &str = "default";
const PROFILES_KEY: &str = "profiles";

/// Locations and limits for one session.
///
/// # Examples
///
/// ```
/// use draxon::Config;
///
/// let config = Config::default();
/// assert!(config.history_size > 0);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub config_path: PathBuf,
    pub history_path: PathBuf,
    pub history_size: usize,
    pub libraries_dir: PathBuf,
    pub failure_report: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_path: home.join(".draxon.json"),
            history_path: home.join(".draxon_history.json"),
            history_size: 10,
            libraries_dir: home.join(".draxon").join("libs"),
            failure_report: PathBuf::from("draxon_failed.txt"),
        }
    }
}

/// Global defaults and named profiles, backed by one JSON file.
///
/// The file is a flat object of default settings plus a `profiles` object
/// mapping names to their own settings. A missing or malformed file is not
/// an error: the store starts from built-in defaults instead.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    defaults: Profile,
    profiles: BTreeMap<String, Profile>,
}

impl ConfigStore {
    /// A store holding only built-in defaults and an empty `default` profile.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(DEFAULT_PROFILE.to_string(), Profile::new(DEFAULT_PROFILE));
        Self {
            path: path.into(),
            defaults: Profile::builtin(),
            profiles,
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::read(&path) {
            Ok(Some(store)) => store,
            Ok(None) => Self::empty(path),
            Err(e) => {
                warn!("Could not load config {}: {}; using defaults", path.display(), e);
                Self::empty(path)
            }
        }
    }

    fn read(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        let Value::Object(mut root) = serde_json::from_str::<Value>(&text)? else {
            return Err(AppError::Config("top level is not an object".into()));
        };

        let mut store = Self::empty(path);
        match root.remove(PROFILES_KEY) {
            Some(Value::Object(entries)) => {
                store.profiles.clear();
                for (name, value) in entries {
                    match value {
                        Value::Object(settings) => {
                            store.profiles.insert(
                                name.clone(),
                                Profile {
                                    name,
                                    settings,
                                },
                            );
                        }
                        other => warn!(profile = %name, ?other, "Skipping profile that is not an object"),
                    }
                }
                store
                    .profiles
                    .entry(DEFAULT_PROFILE.to_string())
                    .or_insert_with(|| Profile::new(DEFAULT_PROFILE));
            }
            Some(other) => warn!(?other, "Ignoring malformed profiles section"),
            None => {}
        }
        for (key, value) in root {
            store.defaults.settings.insert(key, value);
        }
        Ok(Some(store))
    }

    pub fn save(&self) -> Result<()> {
        let mut root: Settings = self.defaults.settings.clone();
        let profiles: Settings = self
            .profiles
            .iter()
            .map(|(name, p)| (name.clone(), Value::Object(p.settings.clone())))
            .collect();
        root.insert(PROFILES_KEY.to_string(), Value::Object(profiles));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&Value::Object(root))?)?;
        std::fs::rename(&tmp, &self.path)?;
        info!("Settings saved to {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn defaults(&self) -> &Profile {
        &self.defaults
    }

    pub fn profile_names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// The named profile, or `default` when the name is unknown.
    pub fn active_profile(&self, name: Option<&str>) -> Profile {
        let requested = name.unwrap_or(DEFAULT_PROFILE);
        if let Some(profile) = self.profiles.get(requested) {
            return profile.clone();
        }
        if name.is_some() {
            warn!(profile = requested, "Profile not found; using '{}'", DEFAULT_PROFILE);
        }
        self.profiles
            .get(DEFAULT_PROFILE)
            .cloned()
            .unwrap_or_else(|| Profile::new(DEFAULT_PROFILE))
    }

    pub fn upsert_profile(&mut self, profile: Profile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn resolver(&self, profile: Profile) -> ProfileResolver {
        ProfileResolver::new(self.defaults.clone(), profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::keys;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::load(temp.path().join("absent.json"));
        assert_eq!(store.profile_names(), vec![DEFAULT_PROFILE]);
        assert_eq!(store.defaults().get(keys::VIDEO_FORMAT), Some(&json!("best")));
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cfg.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = ConfigStore::load(&path);
        assert_eq!(store.defaults(), &Profile::builtin());
    }

    #[test]
    fn reads_defaults_and_profiles() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cfg.json");
        let doc = json!({
            "video_format": "bv*+ba",
            "profiles": { "music": { "prefer_audio": true }, "bad": 3 }
        });
        std::fs::write(&path, doc.to_string()).unwrap();

        let store = ConfigStore::load(&path);
        assert_eq!(store.defaults().get(keys::VIDEO_FORMAT), Some(&json!("bv*+ba")));
        assert_eq!(store.defaults().get(keys::RESUME), Some(&json!(true)));
        assert_eq!(store.profile_names(), vec![DEFAULT_PROFILE, "music"]);

        let job = store
            .resolver(store.active_profile(Some("music")))
            .resolve("https://a.example", &[]);
        assert!(job.audio_extract);
    }

    #[test]
    fn unknown_profile_falls_back_to_default() {
        let store = ConfigStore::empty("unused.json");
        assert_eq!(store.active_profile(Some("nope")).name, DEFAULT_PROFILE);
    }

    #[test]
    fn save_then_load_keeps_profiles() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("cfg.json");
        let mut store = ConfigStore::empty(&path);
        store.upsert_profile(Profile::new("night").with(keys::RATE_LIMIT, "500K"));
        store.save().unwrap();

        let loaded = ConfigStore::load(&path);
        assert_eq!(
            loaded.profile("night").and_then(|p| p.get(keys::RATE_LIMIT)),
            Some(&json!("500K"))
        );
        assert_eq!(loaded.defaults(), store.defaults());
    }
}
