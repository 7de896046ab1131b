mod config;
mod error;
mod factory;
mod log;
mod recover;
mod registry;
mod render;
mod service;

pub use config::{ConfigBuilder, DIRECTIVE, Directive, Entry, ErrorsConfig, parse_directives};
pub use error::{ConfigError, RenderError};
pub use factory::ErrorPages;
pub use log::{
    Diagnostic, LogOutput, LogRoller, LogSink, LogTarget, Severity, TracingSink, WriterSink,
};
pub use recover::{Capture, Fault, Locate, PanicSite, SourceLocation, StackScan};
pub use registry::{PageKey, PageRegistry};
pub use render::{DefaultHandler, default_response};
pub use service::{ErrorPagesService, Intercepted, Outcome};
