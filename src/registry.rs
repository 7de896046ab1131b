//! Status-Code to Error-Page Mapping

use std::{
    collections::HashMap,
    fmt,
    fs::File,
    path::{Path, PathBuf},
    str::FromStr,
};

use actix_web::http::StatusCode;

use super::error::ConfigError;

/// Registry key for an error page.
///
/// Either a specific [`StatusCode`] or the generic (`*`) fallback page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKey {
    Status(StatusCode),
    Generic,
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(code) => write!(f, "{}", code.as_u16()),
            Self::Generic => f.write_str("*"),
        }
    }
}

impl From<StatusCode> for PageKey {
    #[inline]
    fn from(value: StatusCode) -> Self {
        Self::Status(value)
    }
}

impl FromStr for PageKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Self::Generic);
        }
        s.parse::<u16>()
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .map(Self::Status)
            .ok_or_else(|| ConfigError::InvalidCode {
                line: 0,
                token: s.to_owned(),
            })
    }
}

/// Mapping of status codes to static error page files, with an
/// optional generic page used when no exact entry exists.
///
/// Built once during configuration and never mutated afterwards.
///
/// # Examples
///
/// ```
/// use actix_web::http::StatusCode;
/// use actix_errorpages::{PageKey, PageRegistry};
///
/// let mut registry = PageRegistry::new();
/// registry.register(PageKey::Status(StatusCode::NOT_FOUND), "/errors/404.html").unwrap();
/// registry.register(PageKey::Generic, "/errors/default.html").unwrap();
///
/// assert!(registry.register(PageKey::Generic, "/errors/other.html").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct PageRegistry {
    pages: HashMap<StatusCode, PathBuf>,
    generic: Option<PathBuf>,
}

impl PageRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new error page for the specified key.
    ///
    /// The page file is probed once; a file that cannot be opened only
    /// produces a warning.
    pub fn register<P: Into<PathBuf>>(&mut self, key: PageKey, path: P) -> Result<(), ConfigError> {
        let path = path.into();
        let exists = match key {
            PageKey::Status(code) => self.pages.contains_key(&code),
            PageKey::Generic => self.generic.is_some(),
        };
        if exists {
            return Err(ConfigError::DuplicateEntry {
                line: 0,
                key: key.to_string(),
            });
        }

        if let Err(err) = File::open(&path) {
            tracing::warn!("Unable to open error page {path:?}: {err}");
        }

        match key {
            PageKey::Status(code) => {
                self.pages.insert(code, path);
            }
            PageKey::Generic => self.generic = Some(path),
        };
        Ok(())
    }

    /// Find the page to serve for the given status code.
    ///
    /// Exact entries take priority over the generic page.
    pub fn lookup(&self, code: StatusCode) -> Option<&Path> {
        self.pages
            .get(&code)
            .or(self.generic.as_ref())
            .map(PathBuf::as_path)
    }

    /// Returns true if no pages (generic included) are registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.generic.is_none()
    }
}
