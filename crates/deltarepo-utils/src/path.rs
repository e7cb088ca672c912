use std::{
    env,
    iter::Peekable,
    path::{Path, PathBuf},
    str::Chars,
};

use crate::error::{PathError, PathResult};

pub trait PathResolver {
    /// Resolves a user supplied path.
    ///
    /// Expands `$VAR` and `${VAR}`, replaces a leading `~` with the home directory and
    /// makes relative paths absolute against the current working directory.
    ///
    /// # Errors
    ///
    /// * [`PathError::Empty`] if the path is empty
    /// * [`PathError::CurrentDir`] if the current directory cannot be determined
    /// * [`PathError::MissingEnvVar`] if a referenced variable is undefined
    /// * [`PathError::UnclosedVariable`] for `${VAR` without the closing brace
    ///
    /// # Example
    ///
    /// ```
    /// use deltarepo_utils::error::PathResult;
    /// use deltarepo_utils::path::{PathResolver, SystemPathResolver};
    ///
    /// fn main() -> PathResult<()> {
    ///     let resolved = SystemPathResolver.resolve_path("$HOME/mirror/fedora")?;
    ///     assert!(resolved.is_absolute());
    ///     Ok(())
    /// }
    /// ```
    fn resolve_path(&self, path: &str) -> PathResult<PathBuf>;

    /// `$HOME`, falling back to the passwd entry of the current user.
    fn home_dir(&self) -> PathBuf;

    /// `$XDG_CONFIG_HOME` or `$HOME/.config`.
    fn xdg_config_home(&self) -> PathBuf;

    /// `$XDG_CACHE_HOME` or `$HOME/.cache`.
    fn xdg_cache_home(&self) -> PathBuf;
}

/// The default [`PathResolver`] backed by the process environment.
pub struct SystemPathResolver;

impl PathResolver for SystemPathResolver {
    fn resolve_path(&self, path: &str) -> PathResult<PathBuf> {
        let path = path.trim();
        if path.is_empty() {
            return Err(PathError::Empty);
        }

        let expanded = PathBuf::from(self.expand_variables(path)?);
        if expanded.is_absolute() {
            return Ok(expanded);
        }

        env::current_dir()
            .map(|cwd| cwd.join(expanded))
            .map_err(|err| PathError::CurrentDir { source: err })
    }

    fn home_dir(&self) -> PathBuf {
        env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| {
            nix::unistd::User::from_uid(nix::unistd::getuid())
                .ok()
                .flatten()
                .map(|user| user.dir)
                .unwrap_or_else(|| PathBuf::from("/"))
        })
    }

    fn xdg_config_home(&self) -> PathBuf {
        env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.home_dir().join(".config"))
    }

    fn xdg_cache_home(&self) -> PathBuf {
        env::var("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.home_dir().join(".cache"))
    }
}

impl SystemPathResolver {
    fn expand_variables(&self, path: &str) -> PathResult<String> {
        let mut result = String::with_capacity(path.len());
        let mut chars = path.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '$' if chars.peek() == Some(&'{') => {
                    chars.next();
                    let name = consume_braced(&mut chars)?;
                    result.push_str(&self.lookup(&name, path)?);
                }
                '$' => {
                    let name = consume_var_name(&mut chars);
                    if name.is_empty() {
                        result.push('$');
                    } else {
                        result.push_str(&self.lookup(&name, path)?);
                    }
                }
                '~' if result.is_empty() => result.push_str(&self.home_dir().to_string_lossy()),
                _ => result.push(c),
            }
        }

        Ok(result)
    }

    fn lookup(&self, name: &str, original: &str) -> PathResult<String> {
        let value = match name {
            "HOME" => self.home_dir(),
            "XDG_CONFIG_HOME" => self.xdg_config_home(),
            "XDG_CACHE_HOME" => self.xdg_cache_home(),
            _ => {
                return env::var(name).map_err(|_| {
                    PathError::MissingEnvVar {
                        var: name.into(),
                        input: original.into(),
                    }
                })
            }
        };
        Ok(value.to_string_lossy().into_owned())
    }
}

fn consume_braced(chars: &mut Peekable<Chars>) -> PathResult<String> {
    let mut name = String::new();
    for c in chars.by_ref() {
        if c == '}' {
            return Ok(name);
        }
        name.push(c);
    }
    Err(PathError::UnclosedVariable {
        input: format!("${{{name}"),
    })
}

fn consume_var_name(chars: &mut Peekable<Chars>) -> String {
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        if !(c.is_alphanumeric() || c == '_') {
            break;
        }
        name.push(c);
        chars.next();
    }
    name
}

/// See [`PathResolver::resolve_path`].
pub fn resolve_path(path: &str) -> PathResult<PathBuf> {
    SystemPathResolver.resolve_path(path)
}

/// See [`PathResolver::xdg_config_home`].
pub fn xdg_config_home() -> PathBuf {
    SystemPathResolver.xdg_config_home()
}

/// See [`PathResolver::xdg_cache_home`].
pub fn xdg_cache_home() -> PathBuf {
    SystemPathResolver.xdg_cache_home()
}

/// File name of `path` as an owned string, empty when there is none.
pub fn file_name_of<P: AsRef<Path>>(path: P) -> String {
    path.as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
