//! Error Page Rendering

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};

use actix_web::{
    HttpResponse,
    dev::RequestHead,
    http::{StatusCode, header},
    mime, web,
};

use super::error::RenderError;
use super::log::{Diagnostic, LogSink};
use super::registry::PageRegistry;

/// Responder used when no custom error page can be served.
pub type DefaultHandler = Arc<dyn Fn(&RequestHead, StatusCode) -> HttpResponse + Send + Sync>;

/// Minimal plain-text response naming the status code.
pub fn default_response(_head: &RequestHead, status: StatusCode) -> HttpResponse {
    let reason = status.canonical_reason().unwrap_or("Unknown Error");
    HttpResponse::build(status)
        .insert_header(header::ContentType(mime::TEXT_PLAIN_UTF_8))
        .body(format!("{} {reason}", status.as_u16()))
}

/// Content-Type for the page file, defaulting to `text/html; charset=utf-8`.
fn content_type(path: &Path) -> mime::Mime {
    mime_guess::from_path(path)
        .first()
        .unwrap_or(mime::TEXT_HTML_UTF_8)
}

/// Read the full page contents from disk.
fn load(path: &Path) -> Result<Vec<u8>, RenderError> {
    let mut file = File::open(path).map_err(RenderError::Open)?;
    let mut body = Vec::new();
    file.read_to_end(&mut body).map_err(RenderError::Read)?;
    Ok(body)
}

/// Serves configured error pages, degrading to the [`DefaultHandler`]
/// whenever a page is missing or cannot be read.
#[derive(Clone)]
pub(crate) struct PageRenderer {
    pub(crate) registry: Arc<PageRegistry>,
    pub(crate) fallback: DefaultHandler,
    pub(crate) sink: Arc<dyn LogSink>,
}

impl PageRenderer {
    /// Build the error response for the given status code.
    ///
    /// Never fails: every problem loading the page is logged and
    /// answered with the default response instead.
    pub(crate) async fn render(&self, head: &RequestHead, code: StatusCode) -> HttpResponse {
        let Some(path) = self.registry.lookup(code) else {
            return (self.fallback)(head, code);
        };

        let owned: PathBuf = path.to_owned();
        let body = match web::block(move || load(&owned)).await {
            Ok(result) => result,
            Err(_) => Err(RenderError::Blocking),
        };

        match body {
            Ok(body) => HttpResponse::build(code)
                .insert_header(header::ContentType(content_type(path)))
                .body(body),
            Err(err) => {
                let detail = match &err {
                    RenderError::Open(_) => format!("could not load error page: {err}"),
                    _ => format!("could not respond with {}: {err}", path.display()),
                };
                let record = Diagnostic::notice(code, head.uri.to_string(), detail);
                self.sink.log(&record);
                (self.fallback)(head, code)
            }
        }
    }
}
