//! Error Pages Middleware Factory

use std::{rc::Rc, sync::Arc};

use actix_service::Transform;
use actix_web::{
    Error, HttpResponse,
    body::{BoxBody, MessageBody},
    dev::{RequestHead, Service, ServiceRequest, ServiceResponse},
    http::StatusCode,
};
use futures_core::future::LocalBoxFuture;

use super::config::ErrorsConfig;
use super::error::ConfigError;
use super::log::{LogSink, TracingSink};
use super::recover::{Locate, PanicSite, Recovery};
use super::registry::PageRegistry;
use super::render::{DefaultHandler, PageRenderer, default_response};
use super::service::{ErrorPagesInner, ErrorPagesService};

/// Static error pages and panic recovery middleware.
///
/// Responses with an error status (`>= 400`) from the wrapped service are
/// replaced by the matching page of the [`PageRegistry`], and panics raised
/// by the wrapped service are answered with the `500` page instead of
/// tearing down the connection.
///
/// `ErrorPages` must be registered with `App::wrap()` method.
///
/// # Examples
///
/// ```
/// use actix_web::{App, http::StatusCode};
/// use actix_errorpages::{ErrorPages, PageKey, PageRegistry};
///
/// let mut registry = PageRegistry::new();
/// registry.register(PageKey::Status(StatusCode::NOT_FOUND), "errors/404.html").unwrap();
/// registry.register(PageKey::Generic, "errors/default.html").unwrap();
///
/// let app = App::new()
///     .wrap(ErrorPages::new(registry));
/// ```
#[derive(Clone)]
pub struct ErrorPages {
    registry: Arc<PageRegistry>,
    sink: Arc<dyn LogSink>,
    fallback: DefaultHandler,
    locator: Arc<dyn Locate>,
    source_root: Option<String>,
}

impl ErrorPages {
    /// Creates new `ErrorPages` middleware serving pages from the registry.
    pub fn new(registry: PageRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            sink: Arc::new(TracingSink),
            fallback: Arc::new(default_response),
            locator: Arc::new(PanicSite),
            source_root: None,
        }
    }

    /// Creates new `ErrorPages` middleware from a parsed configuration,
    /// opening the configured log destination if there is one.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use actix_errorpages::{ConfigBuilder, ErrorPages};
    ///
    /// let config = ConfigBuilder::new("/var/www")
    ///     .parse("errors /var/log/errors.log {\n 404 404.html\n * error.html\n}")
    ///     .expect("invalid errors config");
    /// let pages = ErrorPages::from_config(config).expect("failed to open log");
    /// ```
    pub fn from_config(config: ErrorsConfig) -> Result<Self, ConfigError> {
        let mut this = Self::new(config.registry);
        if let Some(target) = config.log {
            this.sink = target.open()?;
        }
        Ok(this)
    }

    /// Assign the [`LogSink`] receiving error, notice, and panic diagnostics.
    ///
    /// Diagnostics are emitted as [`tracing`] events by default.
    pub fn log_sink<L: LogSink + 'static>(mut self, sink: L) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Configure the response used when no error page is registered
    /// for a status code or the page cannot be loaded.
    pub fn default_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RequestHead, StatusCode) -> HttpResponse + Send + Sync + 'static,
    {
        self.fallback = Arc::new(handler);
        self
    }

    /// Configure how the source location of a panic is resolved.
    ///
    /// Defaults to [`PanicSite`].
    pub fn locator<L: Locate + 'static>(mut self, locator: L) -> Self {
        self.locator = Arc::new(locator);
        self
    }

    /// Source root marker stripped from logged panic locations.
    ///
    /// Everything up to and including the first occurrence of the marker
    /// is removed, for example `/github.com/me/` turns
    /// `/home/me/github.com/me/app/src/main.rs` into `app/src/main.rs`.
    pub fn source_root<S: Into<String>>(mut self, marker: S) -> Self {
        self.source_root = Some(marker.into());
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for ErrorPages
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = ErrorPagesService<S>;
    type InitError = ();
    type Future = LocalBoxFuture<'static, Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        let inner = ErrorPagesInner {
            service,
            renderer: PageRenderer {
                registry: Arc::clone(&self.registry),
                fallback: Arc::clone(&self.fallback),
                sink: Arc::clone(&self.sink),
            },
            recovery: Recovery::new(Arc::clone(&self.locator), self.source_root.clone()),
        };
        Box::pin(async move { Ok(ErrorPagesService(Rc::new(inner))) })
    }
}
