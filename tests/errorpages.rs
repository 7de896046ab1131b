use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use actix_errorpages::{
    ConfigBuilder, Diagnostic, ErrorPages, Intercepted, LogSink, Outcome, PageKey, PageRegistry,
    Severity, StackScan,
};
use actix_web::{
    App, HttpResponse,
    body::{BoxBody, to_bytes},
    dev::{Service, ServiceResponse},
    error,
    http::{StatusCode, header},
    test, web,
};

#[derive(Clone, Default)]
struct Recorded(Arc<Mutex<Vec<Diagnostic>>>);

impl Recorded {
    fn records(&self) -> Vec<Diagnostic> {
        self.0.lock().unwrap().clone()
    }

    fn lines(&self) -> Vec<String> {
        self.records().iter().map(|r| r.to_string()).collect()
    }
}

impl LogSink for Recorded {
    fn log(&self, record: &Diagnostic) {
        self.0.lock().unwrap().push(record.clone());
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn page(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("pages")
        .join(name)
}

fn contents(name: &str) -> Vec<u8> {
    fs::read(page(name)).unwrap()
}

fn registry(generic: bool) -> PageRegistry {
    let mut registry = PageRegistry::new();
    registry
        .register(StatusCode::NOT_FOUND.into(), page("404.html"))
        .unwrap();
    registry
        .register(StatusCode::IM_A_TEAPOT.into(), page("teapot.json"))
        .unwrap();
    registry
        .register(StatusCode::GONE.into(), page("does-not-exist.html"))
        .unwrap();
    if generic {
        registry
            .register(PageKey::Generic, page("default.html"))
            .unwrap();
    }
    registry
}

async fn ok() -> HttpResponse {
    HttpResponse::Ok().body("hello")
}

async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().body("raw not found")
}

async fn unavailable() -> HttpResponse {
    HttpResponse::ServiceUnavailable().body("raw unavailable")
}

async fn teapot() -> HttpResponse {
    HttpResponse::build(StatusCode::IM_A_TEAPOT).finish()
}

async fn unauthorized() -> HttpResponse {
    HttpResponse::Unauthorized()
        .insert_header((header::WWW_AUTHENTICATE, "Basic realm=\"admin\""))
        .insert_header((header::SET_COOKIE, "session=expired"))
        .body("raw unauthorized")
}

async fn gone() -> HttpResponse {
    HttpResponse::Gone().finish()
}

async fn failed() -> Result<HttpResponse, error::Error> {
    Err(error::ErrorNotFound("no such record"))
}

async fn redirect_failed() -> Result<HttpResponse, error::Error> {
    Err(error::InternalError::new("moved away", StatusCode::FOUND).into())
}

async fn boom() -> HttpResponse {
    panic!("nil pointer")
}

macro_rules! app {
    ($pages:expr) => {
        test::init_service(
            App::new()
                .wrap_fn(|req, srv| {
                    let denied = req.path() == "/denied";
                    let fut = srv.call(req);
                    async move {
                        if denied {
                            return Err(error::ErrorForbidden("access denied"));
                        }
                        fut.await
                    }
                })
                .wrap($pages)
                .route("/ok", web::get().to(ok))
                .route("/missing", web::get().to(not_found))
                .route("/unavailable", web::get().to(unavailable))
                .route("/teapot", web::get().to(teapot))
                .route("/gone", web::get().to(gone))
                .route("/unauthorized", web::get().to(unauthorized))
                .route("/failed", web::get().to(failed))
                .route("/redirect", web::get().to(redirect_failed))
                .route("/panic", web::get().to(boom)),
        )
        .await
    };
}

fn intercepted<B>(res: &ServiceResponse<B>) -> Option<Intercepted> {
    res.response().extensions().get::<Intercepted>().copied()
}

/// Resolve the service result into the response the server would write.
async fn respond<S, R>(app: &S, req: R) -> HttpResponse
where
    S: Service<R, Response = ServiceResponse<BoxBody>, Error = error::Error>,
{
    match test::try_call_service(app, req).await {
        Ok(res) => res.into_parts().1,
        Err(err) => HttpResponse::from_error(err),
    }
}

async fn body(res: HttpResponse) -> Vec<u8> {
    to_bytes(res.into_body()).await.unwrap().to_vec()
}

#[actix_web::test]
async fn passes_through_success() {
    init_tracing();
    let log = Recorded::default();
    let app = app!(ErrorPages::new(registry(true)).log_sink(log.clone()));

    let req = test::TestRequest::get().uri("/ok").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(intercepted(&res), None);
    assert_eq!(test::read_body(res).await, "hello");
    assert!(log.records().is_empty());
}

#[actix_web::test]
async fn exact_page_for_status() {
    init_tracing();
    let log = Recorded::default();
    let app = app!(ErrorPages::new(registry(true)).log_sink(log.clone()));

    let req = test::TestRequest::get().uri("/missing").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let content_type = res.headers().get(header::CONTENT_TYPE).unwrap();
    assert!(content_type.to_str().unwrap().starts_with("text/html"));
    assert_eq!(
        intercepted(&res),
        Some(Intercepted {
            outcome: Outcome::Substituted,
            status: StatusCode::NOT_FOUND
        })
    );
    assert_eq!(test::read_body(res).await, contents("404.html"));
    assert!(log.records().is_empty());
}

#[actix_web::test]
async fn content_type_from_extension() {
    init_tracing();
    let app = app!(ErrorPages::new(registry(true)).log_sink(Recorded::default()));

    let req = test::TestRequest::get().uri("/teapot").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(
        res.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    assert_eq!(test::read_body(res).await, contents("teapot.json"));
}

#[actix_web::test]
async fn generic_page_fallback() {
    init_tracing();
    let app = app!(ErrorPages::new(registry(true)).log_sink(Recorded::default()));

    let req = test::TestRequest::get().uri("/unavailable").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(test::read_body(res).await, contents("default.html"));
}

#[actix_web::test]
async fn default_response_without_page() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let pages = ErrorPages::new(registry(false))
        .log_sink(Recorded::default())
        .default_handler(move |_, status| {
            counter.fetch_add(1, Ordering::SeqCst);
            HttpResponse::build(status).body("fallback")
        });
    let app = app!(pages);

    let req = test::TestRequest::get().uri("/unavailable").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(test::read_body(res).await, "fallback");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // exact pages still bypass the default responder
    let req = test::TestRequest::get().uri("/missing").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(test::read_body(res).await, contents("404.html"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[actix_web::test]
async fn builtin_default_response() {
    init_tracing();
    let app = app!(ErrorPages::new(PageRegistry::new()).log_sink(Recorded::default()));

    let req = test::TestRequest::get().uri("/unavailable").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        res.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/plain; charset=utf-8"
    );
    assert_eq!(test::read_body(res).await, "503 Service Unavailable");
}

#[actix_web::test]
async fn unreadable_page_degrades() {
    init_tracing();
    let log = Recorded::default();
    let app = app!(ErrorPages::new(registry(true)).log_sink(log.clone()));

    let req = test::TestRequest::get().uri("/gone?id=3").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::GONE);
    assert_eq!(test::read_body(res).await, "410 Gone");

    let records = log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].severity, Severity::Notice);
    let line = records[0].to_string();
    assert!(line.starts_with("[NOTICE 410 /gone?id=3] could not load error page:"), "{line}");
}

#[actix_web::test]
async fn handler_error_logged_and_kept() {
    init_tracing();
    let log = Recorded::default();
    let app = app!(ErrorPages::new(registry(true)).log_sink(log.clone()));

    let req = test::TestRequest::get().uri("/failed").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        res.response().error().map(|e| e.to_string()),
        Some("no such record".to_owned())
    );
    assert_eq!(
        intercepted(&res).map(|i| i.outcome),
        Some(Outcome::Substituted)
    );
    assert_eq!(test::read_body(res).await, contents("404.html"));
    assert_eq!(log.lines(), vec!["[ERROR 404 /failed] no such record"]);
}

#[actix_web::test]
async fn error_logged_without_substitution() {
    init_tracing();
    let log = Recorded::default();
    let app = app!(ErrorPages::new(registry(true)).log_sink(log.clone()));

    let req = test::TestRequest::get().uri("/redirect").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::FOUND);
    assert_eq!(intercepted(&res), None);
    assert_eq!(log.lines(), vec!["[ERROR 302 /redirect] moved away"]);
}

#[actix_web::test]
async fn service_error_substituted() {
    init_tracing();
    let log = Recorded::default();
    let app = app!(ErrorPages::new(registry(true)).log_sink(log.clone()));

    let req = test::TestRequest::get().uri("/denied").to_request();
    let res = respond(&app, req).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        res.error().map(|e| e.to_string()),
        Some("access denied".to_owned())
    );
    assert_eq!(
        res.extensions().get::<Intercepted>().copied(),
        Some(Intercepted {
            outcome: Outcome::Substituted,
            status: StatusCode::FORBIDDEN
        })
    );
    assert_eq!(body(res).await, contents("default.html"));
    assert_eq!(log.lines(), vec!["[ERROR 403 /denied] access denied"]);
}

#[actix_web::test]
async fn panic_recovered() {
    init_tracing();
    let log = Recorded::default();
    let app = app!(ErrorPages::new(registry(true)).log_sink(log.clone()));

    let req = test::TestRequest::get().uri("/panic").to_request();
    let res = respond(&app, req).await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        res.extensions().get::<Intercepted>().copied(),
        Some(Intercepted {
            outcome: Outcome::Recovered,
            status: StatusCode::INTERNAL_SERVER_ERROR
        })
    );
    assert_eq!(body(res).await, contents("default.html"));

    let records = log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].severity, Severity::Panic);
    assert_eq!(records[0].detail, "nil pointer");
    let source = records[0].source.clone().expect("panic location");
    assert!(source.file.ends_with("errorpages.rs"), "{source}");
    assert!(source.line > 0);

    let line = records[0].to_string();
    assert!(line.starts_with("[PANIC /panic] "), "{line}");
    assert!(line.ends_with(" - nil pointer"), "{line}");

    // worker keeps serving after the panic
    let req = test::TestRequest::get().uri("/ok").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[actix_web::test]
async fn panic_source_root_trimmed() {
    init_tracing();
    let log = Recorded::default();
    let pages = ErrorPages::new(PageRegistry::new())
        .log_sink(log.clone())
        .source_root("tests/");
    let app = app!(pages);

    let req = test::TestRequest::get().uri("/panic").to_request();
    let res = respond(&app, req).await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body(res).await, b"500 Internal Server Error");

    let source = log.records()[0].source.clone().expect("panic location");
    assert_eq!(source.file, "errorpages.rs");
}

#[actix_web::test]
async fn substituted_page_keeps_headers() {
    init_tracing();
    let app = app!(ErrorPages::new(registry(true)).log_sink(Recorded::default()));

    let req = test::TestRequest::get().uri("/unauthorized").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let headers = res.headers();
    assert_eq!(
        headers.get(header::WWW_AUTHENTICATE).unwrap(),
        "Basic realm=\"admin\""
    );
    assert_eq!(headers.get(header::SET_COOKIE).unwrap(), "session=expired");
    let content_type = headers.get(header::CONTENT_TYPE).unwrap();
    assert!(content_type.to_str().unwrap().starts_with("text/html"));
    assert_eq!(test::read_body(res).await, contents("default.html"));
}

#[actix_web::test]
async fn panic_located_by_stack_scan() {
    init_tracing();
    let log = Recorded::default();
    let pages = ErrorPages::new(registry(true))
        .log_sink(log.clone())
        .locator(StackScan::default());
    let app = app!(pages);

    let req = test::TestRequest::get().uri("/panic").to_request();
    let res = respond(&app, req).await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let records = log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].detail, "nil pointer");
    let source = records[0].source.clone().expect("frame outside the machinery");
    assert!(source.file.ends_with("errorpages.rs"), "{source:?}");
    let function = source.function.unwrap_or_default();
    assert!(function.contains("boom"), "{function}");
}

#[actix_web::test]
async fn relative_log_destination() {
    init_tracing();
    let dir = std::env::temp_dir().join(format!("actix-errorpages-rel-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();

    let input = format!(
        "errors errors.log {{\n  404 \"{}\"\n}}\n",
        page("404.html").display()
    );
    let config = ConfigBuilder::new(&dir).parse(&input).unwrap();
    let app = app!(ErrorPages::from_config(config).unwrap());

    let req = test::TestRequest::get().uri("/failed").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(test::read_body(res).await, contents("404.html"));

    let written = fs::read_to_string(dir.join("errors.log")).unwrap();
    assert!(written.contains("[ERROR 404 /failed] no such record\n"), "{written}");
    fs::remove_dir_all(&dir).ok();
}

#[actix_web::test]
async fn configured_from_directive() {
    init_tracing();
    let dir = std::env::temp_dir().join(format!("actix-errorpages-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    let log_path = dir.join("errors.log");

    let root = page("");
    let input = format!(
        "errors {} {{\n  404 404.html\n  * default.html\n  rotate_keep 2\n}}\n",
        log_path.display()
    );
    let config = ConfigBuilder::new(root).parse(&input).unwrap();
    let pages = ErrorPages::from_config(config).unwrap();
    let app = app!(pages);

    let req = test::TestRequest::get().uri("/failed").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(test::read_body(res).await, contents("404.html"));

    let req = test::TestRequest::get().uri("/unavailable").to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(test::read_body(res).await, contents("default.html"));

    let written = fs::read_to_string(&log_path).unwrap();
    assert!(written.contains("[ERROR 404 /failed] no such record\n"), "{written}");
    fs::remove_dir_all(&dir).ok();
}
