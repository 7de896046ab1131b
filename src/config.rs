//! `errors` Directive Configuration
//!
//! ```text
//! errors [<log-destination>] {
//!     <status-code-or-*> <page-file-path>
//!     <rotate_size|rotate_age|rotate_keep|rotate_compress> <args...>
//! }
//! ```

use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use super::error::ConfigError;
use super::log::{LogOutput, LogRoller, LogTarget};
use super::registry::{PageKey, PageRegistry};

/// Name of the only directive understood by the parser
pub const DIRECTIVE: &str = "errors";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Open,
    Close,
    Newline,
}

/// Split the input into tokens tagged with their line number.
fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConfigError> {
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => {
                tokens.push((line, Token::Newline));
                line += 1;
            }
            '{' => tokens.push((line, Token::Open)),
            '}' => tokens.push((line, Token::Close)),
            '#' => {
                while chars.next_if(|c| *c != '\n').is_some() {}
            }
            '"' => {
                let start = line;
                let mut word = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => word.push(escaped),
                            None => break,
                        },
                        Some(c) => {
                            if c == '\n' {
                                line += 1;
                            }
                            word.push(c)
                        }
                        None => {
                            return Err(ConfigError::Syntax {
                                line: start,
                                msg: "unterminated quoted string".to_owned(),
                            });
                        }
                    }
                }
                tokens.push((start, Token::Word(word)));
            }
            c if c.is_whitespace() => {}
            c => {
                let mut word = String::from(c);
                while let Some(c) =
                    chars.next_if(|c| !c.is_whitespace() && !matches!(*c, '{' | '}' | '"'))
                {
                    word.push(c);
                }
                tokens.push((line, Token::Word(word)));
            }
        }
    }
    Ok(tokens)
}

/// Single line within an `errors` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// `<status-code-or-*> <page-file-path>`
    Page {
        line: usize,
        key: PageKey,
        path: String,
    },
    /// Log rotation sub-directive, forwarded to [`LogRoller`]
    Roller {
        line: usize,
        name: String,
        args: Vec<String>,
    },
}

/// Parsed `errors` directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub line: usize,
    /// Log destination, when given
    pub destination: Option<String>,
    pub entries: Vec<Entry>,
}

/// Recursive-descent parser over the token stream.
struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or(self.tokens.last())
            .map(|(l, _)| *l)
            .unwrap_or(1)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn skip_newlines(&mut self) {
        while self.peek() == Some(&Token::Newline) {
            self.pos += 1;
        }
    }

    /// Collect words until the end of the current line or a brace.
    fn words(&mut self) -> Vec<String> {
        let mut words = Vec::new();
        while let Some(Token::Word(word)) = self.peek() {
            words.push(word.clone());
            self.pos += 1;
        }
        words
    }

    fn directives(&mut self) -> Result<Vec<Directive>, ConfigError> {
        let mut directives = Vec::new();
        loop {
            self.skip_newlines();
            if self.peek().is_none() {
                return Ok(directives);
            }
            directives.push(self.directive()?);
        }
    }

    fn directive(&mut self) -> Result<Directive, ConfigError> {
        let line = self.line();
        match self.next() {
            Some(Token::Word(name)) if name == DIRECTIVE => {}
            Some(Token::Word(name)) => {
                return Err(ConfigError::Syntax {
                    line,
                    msg: format!("unknown directive '{name}'"),
                });
            }
            _ => {
                return Err(ConfigError::Syntax {
                    line,
                    msg: format!("expected '{DIRECTIVE}' directive"),
                });
            }
        }

        let mut args = self.words();
        if args.len() > 1 {
            return Err(ConfigError::Argument {
                line,
                msg: format!("Only 1 Argument expected for {DIRECTIVE} directive"),
            });
        }
        let entries = match self.peek() {
            Some(Token::Open) => {
                self.pos += 1;
                self.block()?
            }
            Some(Token::Close) => {
                return Err(ConfigError::Syntax {
                    line: self.line(),
                    msg: "unexpected '}'".to_owned(),
                });
            }
            _ => Vec::new(),
        };
        Ok(Directive {
            line,
            destination: args.pop(),
            entries,
        })
    }

    fn block(&mut self) -> Result<Vec<Entry>, ConfigError> {
        let mut entries = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Some(Token::Close) => {
                    self.pos += 1;
                    return Ok(entries);
                }
                Some(Token::Word(_)) => entries.push(self.entry()?),
                Some(Token::Open) => {
                    return Err(ConfigError::Syntax {
                        line: self.line(),
                        msg: "unexpected '{'".to_owned(),
                    });
                }
                _ => {
                    return Err(ConfigError::Syntax {
                        line: self.line(),
                        msg: "unclosed block, expected '}'".to_owned(),
                    });
                }
            }
        }
    }

    fn entry(&mut self) -> Result<Entry, ConfigError> {
        let line = self.line();
        let mut words = self.words();
        let name = words.remove(0);
        if LogRoller::is_subdirective(&name) {
            return Ok(Entry::Roller {
                line,
                name,
                args: words,
            });
        }
        if words.len() != 1 {
            return Err(ConfigError::Argument {
                line,
                msg: format!("Wrong argument count for '{name}': expected a single page path"),
            });
        }
        let key = name.parse::<PageKey>().map_err(|e| e.at_line(line))?;
        Ok(Entry::Page {
            line,
            key,
            path: words.remove(0),
        })
    }
}

/// Parse configuration text into typed [`Directive`]s without validating
/// the registry contents.
pub fn parse_directives(input: &str) -> Result<Vec<Directive>, ConfigError> {
    let tokens = tokenize(input)?;
    Parser { tokens, pos: 0 }.directives()
}

/// Validated error-pages configuration
#[derive(Debug, Clone, Default)]
pub struct ErrorsConfig {
    pub registry: PageRegistry,
    pub log: Option<LogTarget>,
}

impl FromStr for ErrorsConfig {
    type Err = ConfigError;

    /// Parse with relative page paths resolved against the current directory.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigBuilder::new(".").parse(s)
    }
}

/// Builds an [`ErrorsConfig`] from `errors` directives.
///
/// # Examples
///
/// ```
/// use actix_web::http::StatusCode;
/// use actix_errorpages::ConfigBuilder;
///
/// let config = ConfigBuilder::new("/var/www")
///     .parse("errors {\n  404 errors/404.html\n  * /srv/default.html\n}")
///     .unwrap();
///
/// let page = config.registry.lookup(StatusCode::NOT_FOUND).unwrap();
/// assert_eq!(page.to_str(), Some("/var/www/errors/404.html"));
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    root: PathBuf,
}

impl ConfigBuilder {
    /// Creates a new builder resolving relative page and log file paths
    /// against `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match path.is_absolute() {
            true => path.to_owned(),
            false => self.root.join(path),
        }
    }

    /// Parse and validate configuration text.
    pub fn parse(&self, input: &str) -> Result<ErrorsConfig, ConfigError> {
        self.build(parse_directives(input)?)
    }

    /// Validate parsed directives into a single [`ErrorsConfig`].
    ///
    /// Repeated directives accumulate into the same registry.
    pub fn build(&self, directives: Vec<Directive>) -> Result<ErrorsConfig, ConfigError> {
        let mut config = ErrorsConfig::default();
        for directive in directives {
            if let Some(destination) = directive.destination {
                let output = match destination.as_str() {
                    "stdout" => LogOutput::Stdout,
                    "stderr" => LogOutput::Stderr,
                    path => LogOutput::File(self.resolve(path)),
                };
                config.log = Some(LogTarget {
                    output,
                    roller: Some(LogRoller::default()),
                });
            }

            for entry in directive.entries {
                match entry {
                    Entry::Roller { line, name, args } => {
                        let roller = config
                            .log
                            .as_mut()
                            .and_then(|log| log.roller.as_mut())
                            .ok_or_else(|| ConfigError::Argument {
                                line,
                                msg: format!("'{name}' requires a log destination"),
                            })?;
                        roller
                            .apply(&name, &args)
                            .map_err(|msg| ConfigError::Roller { line, msg })?;
                    }
                    Entry::Page { line, key, path } => {
                        config
                            .registry
                            .register(key, self.resolve(&path))
                            .map_err(|e| e.at_line(line))?;
                    }
                }
            }
        }
        Ok(config)
    }
}
