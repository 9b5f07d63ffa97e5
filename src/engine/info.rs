//! Process-wide engine configuration.
//!
//! The registry is populated lazily on first access, per protocol: from the
//! `PGME_OPENPGP_ENGINE` / `PGME_CMS_ENGINE` environment variables if set,
//! otherwise by searching `$PATH` for `gpg` / `gpgsm`. It only changes through
//! [`set_engine_info`] and [`set_default_locale`]. Contexts take a copy when
//! they are created, so reconfiguration never reaches a running operation.

use lazy_static::lazy_static;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// The cryptographic protocol spoken by an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    OpenPgp,
    Cms,
}

impl Protocol {
    fn program(self) -> &'static str {
        match self {
            Protocol::OpenPgp => "gpg",
            Protocol::Cms => "gpgsm",
        }
    }

    fn env_var(self) -> &'static str {
        match self {
            Protocol::OpenPgp => "PGME_OPENPGP_ENGINE",
            Protocol::Cms => "PGME_CMS_ENGINE",
        }
    }
}

/// Where to find the engine for a protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineInfo {
    pub protocol: Protocol,
    /// The engine binary. `None` if no engine was found.
    pub file_name: Option<PathBuf>,
    /// Passed to the engine as `--homedir` when set.
    pub home_dir: Option<PathBuf>,
}

/// Locale categories forwarded to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocaleCategory {
    Ctype,
    Messages,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Locale {
    pub(crate) ctype: Option<String>,
    pub(crate) messages: Option<String>,
}

impl Locale {
    pub(crate) fn set(&mut self, category: LocaleCategory, value: Option<&str>) {
        let value = value.map(String::from);
        match category {
            LocaleCategory::Ctype => self.ctype = value,
            LocaleCategory::Messages => self.messages = value,
        }
    }
}

#[derive(Default)]
struct Registry {
    engines: HashMap<Protocol, EngineInfo>,
    locale: Locale,
}

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry::default());
}

fn locate(protocol: Protocol) -> Option<PathBuf> {
    match env::var_os(protocol.env_var()) {
        Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => which::which(protocol.program()).ok(),
    }
}

/// Returns the engine configured for `protocol`, locating it on first use.
pub fn engine_info(protocol: Protocol) -> EngineInfo {
    REGISTRY
        .lock()
        .engines
        .entry(protocol)
        .or_insert_with(|| {
            let file_name = locate(protocol);
            debug!("Engine for {:?}: {:?}", protocol, file_name);
            EngineInfo {
                protocol,
                file_name,
                home_dir: None,
            }
        })
        .clone()
}

/// Replaces the process-wide engine configuration for `protocol`.
///
/// A `file_name` of `None` restores the default lookup. Contexts created
/// earlier keep the configuration they were created with.
pub fn set_engine_info(protocol: Protocol, file_name: Option<&Path>, home_dir: Option<&Path>) {
    let file_name = file_name
        .map(Path::to_path_buf)
        .or_else(|| locate(protocol));
    REGISTRY.lock().engines.insert(
        protocol,
        EngineInfo {
            protocol,
            file_name,
            home_dir: home_dir.map(Path::to_path_buf),
        },
    );
}

/// Sets the locale passed to engines started by contexts created afterwards.
pub fn set_default_locale(category: LocaleCategory, value: Option<&str>) {
    REGISTRY.lock().locale.set(category, value);
}

pub(crate) fn default_locale() -> Locale {
    REGISTRY.lock().locale.clone()
}

#[cfg(test)]
mod tests {
    use super::{engine_info, set_engine_info, Locale, LocaleCategory, Protocol};
    use std::path::Path;

    #[test]
    fn explicit_engine_info_is_kept() {
        set_engine_info(
            Protocol::Cms,
            Some(Path::new("/opt/engine/bin/gpgsm")),
            Some(Path::new("/tmp/home")),
        );
        let info = engine_info(Protocol::Cms);
        assert_eq!(info.protocol, Protocol::Cms);
        assert_eq!(
            info.file_name.as_deref(),
            Some(Path::new("/opt/engine/bin/gpgsm"))
        );
        assert_eq!(info.home_dir.as_deref(), Some(Path::new("/tmp/home")));
    }

    #[test]
    fn locale_categories() {
        let mut locale = Locale::default();
        locale.set(LocaleCategory::Ctype, Some("C.UTF-8"));
        locale.set(LocaleCategory::Messages, Some("de_DE"));
        locale.set(LocaleCategory::Messages, None);
        assert_eq!(locale.ctype.as_deref(), Some("C.UTF-8"));
        assert_eq!(locale.messages, None);
    }
}
