use std::env;

use crate::config::{CACHE_PATH_ENV, CONFIG_PATH_ENV};

/// Sets or clears `DELTAREPO_*` variables for the lifetime of the value.
///
/// Previous values come back on drop, including when the test panics.
/// Callers must be `#[serial]`.
#[derive(Default)]
pub struct EnvOverride {
    saved: Vec<(&'static str, Option<String>)>,
}

impl EnvOverride {
    pub fn cache_path(self, path: Option<&str>) -> Self {
        self.apply(CACHE_PATH_ENV, path)
    }

    pub fn config_path(self, path: Option<&str>) -> Self {
        self.apply(CONFIG_PATH_ENV, path)
    }

    fn apply(mut self, key: &'static str, value: Option<&str>) -> Self {
        if !self.saved.iter().any(|(saved, _)| *saved == key) {
            self.saved.push((key, env::var(key).ok()));
        }
        match value {
            Some(value) => env::set_var(key, value),
            None => env::remove_var(key),
        }
        self
    }
}

impl Drop for EnvOverride {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain(..).rev() {
            match value {
                Some(value) => env::set_var(key, value),
                None => env::remove_var(key),
            }
        }
    }
}
