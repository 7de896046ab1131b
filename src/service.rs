use std::{ops::Deref, rc::Rc};

use actix_web::{
    HttpResponse,
    body::{BoxBody, MessageBody},
    dev::{RequestHead, Service, ServiceRequest, ServiceResponse, forward_ready},
    error::{Error, InternalError},
    http::{StatusCode, header},
};
use futures_core::future::LocalBoxFuture;

use super::log::Diagnostic;
use super::recover::{Fault, Recovery};
use super::render::PageRenderer;

/// How the middleware changed a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Downstream error status was answered with an error page
    Substituted,
    /// Downstream service panicked and was answered with a 500 page
    Recovered,
}

/// Response extension attached to every response written by the middleware.
///
/// Its presence means the response is final and should not be handled
/// again as an error. Any [`actix_web::Error`] produced downstream is kept:
/// on a substituted handler response it remains available through
/// [`HttpResponse::error`](actix_web::HttpResponse::error), and an error
/// returned by the downstream service itself comes back as the cause of an
/// [`InternalError`] whose response is the error page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intercepted {
    pub outcome: Outcome,
    /// Status reported by the downstream service
    pub status: StatusCode,
}

#[inline]
fn is_error(status: StatusCode) -> bool {
    status.as_u16() >= 400
}

/// Replace status and body of `base` with the rendered page while keeping
/// its headers, attached error, and extensions.
///
/// Headers describing the old body are dropped and the headers of the page
/// (its `Content-Type`) take precedence.
fn substitute<B>(base: HttpResponse<B>, page: HttpResponse, marker: Intercepted) -> HttpResponse {
    let (mut head, _) = base.into_parts();
    let (page, body) = page.into_parts();
    *head.status_mut() = page.status();

    let headers = head.headers_mut();
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONTENT_ENCODING);
    for name in page.headers().keys() {
        headers.remove(name);
    }
    for (name, value) in page.headers().iter() {
        headers.append(name.clone(), value.clone());
    }

    head.extensions_mut().insert(marker);
    head.set_body(body)
}

/// Assembled error-pages middleware service
#[derive(Clone)]
pub struct ErrorPagesService<S>(pub(crate) Rc<ErrorPagesInner<S>>);

impl<S> Deref for ErrorPagesService<S> {
    type Target = ErrorPagesInner<S>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub struct ErrorPagesInner<S> {
    pub(crate) service: S,
    pub(crate) renderer: PageRenderer,
    pub(crate) recovery: Recovery,
}

impl<S> ErrorPagesInner<S> {
    /// Inspect the downstream result and swap in an error page if needed.
    async fn intercept<B>(
        &self,
        head: &RequestHead,
        result: Result<ServiceResponse<B>, Error>,
    ) -> Result<ServiceResponse<BoxBody>, Error>
    where
        B: MessageBody + 'static,
    {
        match result {
            Ok(res) => {
                let status = res.status();
                if let Some(err) = res.response().error() {
                    let record = Diagnostic::error(status, res.request().path(), err);
                    self.renderer.sink.log(&record);
                }
                if !is_error(status) {
                    return Ok(res.map_into_boxed_body());
                }

                let (req, base) = res.into_parts();
                let page = self.renderer.render(req.head(), status).await;
                let marker = Intercepted {
                    outcome: Outcome::Substituted,
                    status,
                };
                Ok(ServiceResponse::new(req, substitute(base, page, marker)))
            }
            Err(err) => {
                let status = err.as_response_error().status_code();
                let record = Diagnostic::error(status, head.uri.path(), &err);
                self.renderer.sink.log(&record);
                if !is_error(status) {
                    return Err(err);
                }

                let page = self.renderer.render(head, status).await;
                let marker = Intercepted {
                    outcome: Outcome::Substituted,
                    status,
                };
                let res = substitute(err.error_response(), page, marker);
                Err(InternalError::from_response(err, res).into())
            }
        }
    }

    /// Log a caught panic and answer with the 500 error page.
    ///
    /// The request was consumed by the panicking service, so the page is
    /// handed back as the response of an [`InternalError`].
    async fn recover(&self, head: &RequestHead, fault: Fault) -> Error {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let record = Diagnostic::panic(
            head.uri.to_string(),
            fault.location.clone(),
            fault.detail.clone(),
        );
        self.renderer.sink.log(&record);

        let mut res = self.renderer.render(head, status).await;
        res.extensions_mut().insert(Intercepted {
            outcome: Outcome::Recovered,
            status,
        });
        InternalError::from_response(fault, res).into()
    }
}

impl<S, B> Service<ServiceRequest> for ErrorPagesService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let this = Rc::clone(&self.0);
        // routing needs sole ownership of the request, so only the head is kept
        let head = req.head().clone();
        Box::pin(async move {
            // `call` itself must run inside the recovery scope
            let guarded = this
                .recovery
                .guard(async {
                    let result = this.service.call(req).await;
                    this.intercept(&head, result).await
                })
                .await;

            match guarded {
                Ok(result) => result,
                Err(fault) => Err(this.recover(&head, fault).await),
            }
        })
    }
}
