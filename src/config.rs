// Copyright 2026 Colloquy Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Overrides the per-user data directory. Mainly for tests.
    pub data_dir: Option<PathBuf>,
    pub store_file: String,
    pub page_size: usize,
    pub max_search_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            store_file: "colloquy.db".to_string(),
            page_size: 50,
            max_search_limit: 200,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let Some(path) = global_config_path() else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        read_config(&path)
    }

    /// Directory holding the store file and any legacy flat files.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let base = base_data_dir().context("resolve per-user data directory")?;
        Ok(base.join("colloquy"))
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(&self.store_file))
    }
}

fn base_config_dir() -> Option<PathBuf> {
    if cfg!(target_os = "windows") {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return Some(PathBuf::from(appdata));
        }
        if let Ok(profile) = std::env::var("USERPROFILE") {
            return Some(PathBuf::from(profile).join("AppData").join("Roaming"));
        }
        return None;
    }

    if cfg!(target_os = "macos") {
        let home = std::env::var("HOME").ok()?;
        return Some(
            PathBuf::from(home)
                .join("Library")
                .join("Application Support"),
        );
    }

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg));
    }
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config"))
}

fn base_data_dir() -> Option<PathBuf> {
    if cfg!(target_os = "windows") || cfg!(target_os = "macos") {
        return base_config_dir();
    }

    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return Some(PathBuf::from(xdg));
    }
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".local").join("share"))
}

pub fn global_config_path() -> Option<PathBuf> {
    base_config_dir().map(|dir| dir.join("colloquy").join("colloquy.toml"))
}

pub fn read_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut config: Config = toml::from_str(&text).context("parse colloquy.toml")?;
    if config.page_size == 0 {
        config.page_size = Config::default().page_size;
    }
    if config.max_search_limit == 0 {
        config.max_search_limit = Config::default().max_search_limit;
    }
    Ok(config)
}
