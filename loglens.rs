//! # loglens - Structured Logging & Log Analysis Engine
//!
//! A format-driven log writer and its inverse: a pattern parser that turns the
//! emitted lines back into typed records, and a streaming statistics engine
//! that aggregates those records by any combination of their fields.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               LOGLENS ENGINE                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  WRITER: CALL SITE → SEVERITY GATE → LINE SESSION → FILTER → FORMAT → SINK  │
//! │  READER: RAW LINES → PATTERN PARSER → DOMAIN AGGREGATOR → STREAMING STATS   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Free When Disabled**: calls below the threshold never allocate, hash or lock
//! - **Template Driven**: `%` placeholders bound to an ordered list of emitters
//! - **Identity Hashing**: every line carries a fingerprint of what was logged
//! - **Whole Lines**: concurrent writers never interleave inside a line
//! - **Inverse Parsing**: any writer format yields the pattern that reads it back
//! - **Streaming Statistics**: min/max/mean/histogram/outliers per numeric field
//!
//! ## Quick Start
//!
//! ```no_run
//! use loglens::{log_at, Level, Logger};
//!
//! let logger = Logger::new(std::io::stderr());
//! let balance = 9_999;
//! log_at!(logger, Level::WARNING)
//!     .append("Balance after withdraw: ")
//!     .append(&balance);
//! ```

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Display, Formatter, Write as FmtWrite};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rayon::prelude::*;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::{CompactString, ToCompactString};
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use xxhash_rust::xxh3::xxh3_64;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::Local;

// ----------------------------------------------------------------------------
// Statistics & Math
// ----------------------------------------------------------------------------
use ordered_float::OrderedFloat;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use regex::Regex;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format as _, Toml},
    Figment,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define default formats and analysis parameters.
// ============================================================================

/// Engine version - follows semantic versioning
pub const LENS_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const LENS_NAME: &str = "loglens";
pub const LENS_FULL_NAME: &str = "loglens structured logging engine";

// ----------------------------------------------------------------------------
// Writer Defaults
// ----------------------------------------------------------------------------

/// Marker substituted by the next emitter when rendering a template
pub const PLACEHOLDER: char = '%';

/// Default template: `file(func:line):message`
pub const DEFAULT_TEMPLATE: &str = "%(%:%):%";

/// Emitters bound to [`DEFAULT_TEMPLATE`], in placeholder order
pub const DEFAULT_EMITTERS: [&str; 4] = ["file", "func", "line", "message"];

/// Default severity threshold (everything is written)
pub const DEFAULT_THRESHOLD: &str = "NOTSET";

/// Initial capacity of a session's message buffer
pub const DEFAULT_LINE_CAPACITY: usize = 128;

// ----------------------------------------------------------------------------
// Reader Defaults
// ----------------------------------------------------------------------------

/// Extraction pattern that reads lines written with the default format
pub const DEFAULT_PATTERN: &str = r"^(.*?)\((.*?):(.*?)\):(.*) (0x[0-9a-f]+)$";

/// Properties bound to the capture groups of [`DEFAULT_PATTERN`]
pub const DEFAULT_PATTERN_PROPERTIES: [&str; 5] = ["file", "func", "line", "message", "hash"];

/// Default grouping for aggregation
pub const DEFAULT_GROUP_BY: [&str; 2] = ["file", "func"];

/// Maximum message tokens inspected by the numeric extractor
pub const DEFAULT_MAX_NUMBER_TOKENS: usize = 100;

// ----------------------------------------------------------------------------
// Statistics Defaults
// ----------------------------------------------------------------------------

/// Histogram bucket width
pub const DEFAULT_PRECISION: f64 = 1.0;

/// Maximum number of buckets reported as outliers
pub const DEFAULT_OUTLIER_COUNT: usize = 100;

/// Maximum cumulative frequency fraction an outlier run may cover
pub const DEFAULT_OUTLIER_FRACTION: f64 = 0.1;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "loglens.toml";

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "LOGLENS_";

// ============================================================================
// SECTION 3: PROPERTY MODEL
// ============================================================================
// The vocabulary shared by the writer and the reader:
// - Severity levels
// - Property identifiers (file, func, line, level, date, time, thread, hash, message)
// - Call-site capture
// - Code context ("where") and run context ("when")
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Severity Levels
// ----------------------------------------------------------------------------

/// Integer severity of a logging call.
///
/// The six named levels follow the usual 10-step spacing. Any other value is a
/// valid custom level and renders as `LEVEL<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Level(u32);

impl Level {
    pub const NOTSET: Level = Level(0);
    pub const DEBUG: Level = Level(10);
    pub const INFO: Level = Level(20);
    pub const WARNING: Level = Level(30);
    pub const ERROR: Level = Level(40);
    pub const CRITICAL: Level = Level(50);

    /// Create a level from its integer value.
    pub const fn new(value: u32) -> Self {
        Level(value)
    }

    /// Integer value compared against the threshold.
    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Rendered name of the level.
    pub fn name(self) -> Cow<'static, str> {
        match self.0 {
            0 => Cow::Borrowed("NOTSET"),
            10 => Cow::Borrowed("DEBUG"),
            20 => Cow::Borrowed("INFO"),
            30 => Cow::Borrowed("WARNING"),
            40 => Cow::Borrowed("ERROR"),
            50 => Cow::Borrowed("CRITICAL"),
            n => Cow::Owned(format!("LEVEL{}", n)),
        }
    }

    /// Parse a level name (case-insensitive) or a bare integer.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let trimmed = value.trim();
        if let Ok(n) = trimmed.parse::<u32>() {
            return Ok(Level(n));
        }

        let upper = trimmed.to_ascii_uppercase();
        match upper.as_str() {
            "NOTSET" => Ok(Level::NOTSET),
            "DEBUG" => Ok(Level::DEBUG),
            "INFO" => Ok(Level::INFO),
            "WARNING" | "WARN" => Ok(Level::WARNING),
            "ERROR" => Ok(Level::ERROR),
            "CRITICAL" => Ok(Level::CRITICAL),
            other => other
                .strip_prefix("LEVEL")
                .and_then(|n| n.parse::<u32>().ok())
                .map(Level)
                .ok_or_else(|| ConfigError::InvalidLevel {
                    value: value.to_string(),
                }),
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Level::NOTSET
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Level {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::parse(s)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Properties
// ----------------------------------------------------------------------------

/// Any item that can be printed in, or recovered from, a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Property {
    /// Source file name (code context)
    File,
    /// Function name (code context)
    Func,
    /// Source line (code context)
    Line,
    /// Severity level name (code context)
    Level,
    /// Date the line was created (run context)
    Date,
    /// Time of day the line was created (run context)
    Time,
    /// Thread that created the line (run context)
    Thread,
    /// Identity hash of the logged values
    Hash,
    /// Free-form content added by the caller
    Message,
}

impl Property {
    /// Every property, in declaration order.
    pub const ALL: [Property; 9] = [
        Property::File,
        Property::Func,
        Property::Line,
        Property::Level,
        Property::Date,
        Property::Time,
        Property::Thread,
        Property::Hash,
        Property::Message,
    ];

    /// Canonical configuration name.
    pub fn name(self) -> &'static str {
        match self {
            Property::File => "file",
            Property::Func => "func",
            Property::Line => "line",
            Property::Level => "level",
            Property::Date => "date",
            Property::Time => "time",
            Property::Thread => "thread",
            Property::Hash => "hash",
            Property::Message => "message",
        }
    }

    /// Resolve a property from its name or one of its aliases.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Property::File),
            "func" | "function" => Ok(Property::Func),
            "line" => Ok(Property::Line),
            "level" | "severity" => Ok(Property::Level),
            "date" => Ok(Property::Date),
            "time" => Ok(Property::Time),
            "thread" => Ok(Property::Thread),
            "hash" => Ok(Property::Hash),
            "message" | "msg" => Ok(Property::Message),
            _ => Err(ConfigError::UnknownProperty {
                name: name.to_string(),
            }),
        }
    }

    /// Resolve an ordered list of property names.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>, ConfigError> {
        names.iter().map(|n| Property::parse(n.as_ref())).collect()
    }
}

impl Display for Property {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Property {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Property::parse(s)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Call Sites
// ----------------------------------------------------------------------------

/// Static facts about the place a logging call was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub file: &'static str,
    pub func: &'static str,
    pub line: u32,
}

impl CallSite {
    pub const fn new(file: &'static str, func: &'static str, line: u32) -> Self {
        Self { file, func, line }
    }
}

/// Name of the enclosing function, recovered from the type name of a local item.
#[macro_export]
macro_rules! function_name {
    () => {{
        fn __loglens_marker() {}
        fn __loglens_type_name<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        let name = __loglens_type_name(__loglens_marker);
        let name = name.strip_suffix("::__loglens_marker").unwrap_or(name);
        let name = name.trim_end_matches("::{{closure}}");
        match name.rfind("::") {
            Some(pos) => &name[pos + 2..],
            None => name,
        }
    }};
}

/// Open a logging session at the current call site.
///
/// ```no_run
/// # use loglens::{log_at, Level, Logger};
/// # let logger = Logger::new(Vec::new());
/// log_at!(logger, Level::ERROR).append("broke down");
/// ```
#[macro_export]
macro_rules! log_at {
    ($logger:expr, $level:expr) => {
        $logger.log(
            $level,
            $crate::CallSite::new(file!(), $crate::function_name!(), line!()),
        )
    };
}

// ----------------------------------------------------------------------------
// 3.4 Code Context - "Where"
// ----------------------------------------------------------------------------

/// Call-site facts recovered from a parsed line.
///
/// Field order gives the ordering: file, function, level, line, hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CodeContext {
    pub file: CompactString,
    pub func: CompactString,
    pub level: CompactString,
    pub line: u32,
    pub hash: CompactString,
}

impl Display for CodeContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.file, self.func, self.line)?;
        if !self.level.is_empty() {
            write!(f, " {}", self.level)?;
        }
        if !self.hash.is_empty() {
            write!(f, " {}", self.hash)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 3.5 Run Context - "When"
// ----------------------------------------------------------------------------

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, AtomicOrdering::Relaxed);
}

/// Sequential per-process tag of the calling thread.
pub fn thread_tag() -> u64 {
    THREAD_TAG.with(|tag| *tag)
}

/// Facts that vary per invocation. Ordered by date, time, thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunContext {
    pub date: CompactString,
    pub time: CompactString,
    pub thread: CompactString,
}

impl RunContext {
    /// Capture local date, time of day and the calling thread's tag.
    pub fn capture() -> Self {
        let now = Local::now();
        Self {
            date: now.format("%Y-%m-%d").to_compact_string(),
            time: now.format("%H:%M:%S%.6f").to_compact_string(),
            thread: format!("{:#x}", thread_tag()).to_compact_string(),
        }
    }
}

impl Display for RunContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.date, self.time, self.thread)
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem:
// - Configuration (names, levels, patterns, numeric settings)
// - Parsing (lines that do not fit the extraction pattern)
// - IO (sink writes, file reads)
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum LensError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LensError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            LensError::Config(_) => false,
            LensError::Parse(_) => true,
            LensError::Io(_) => true,
            LensError::Serialization(_) => false,
            LensError::Internal(_) => false,
        }
    }

    /// Get the error category for diagnostics
    pub fn category(&self) -> &'static str {
        match self {
            LensError::Config(_) => "config",
            LensError::Parse(_) => "parse",
            LensError::Io(_) => "io",
            LensError::Serialization(_) => "serialization",
            LensError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation.
///
/// A template whose placeholder count differs from its emitter count is not an
/// error: extra emitters are ignored and extra placeholders render literally.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unknown property: '{name}'")]
    UnknownProperty { name: String },

    #[error("Invalid severity level: '{value}'")]
    InvalidLevel { value: String },

    #[error("Invalid extraction pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Extraction pattern has {groups} capture groups but {properties} properties were given")]
    GroupCountMismatch { groups: usize, properties: usize },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Parse Errors
// ----------------------------------------------------------------------------

/// Errors raised while reading one emitted line back into a record
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Line does not match the extraction pattern: {line:?}")]
    MalformedLine { line: String },

    #[error("Invalid value {value:?} for property '{property}'")]
    InvalidField { property: Property, value: String },
}

impl ParseError {
    pub fn malformed(line: impl Into<String>) -> Self {
        ParseError::MalformedLine { line: line.into() }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type LensResult<T> = Result<T, LensError>;

/// Result type for line parsing
pub type ParseResult<T> = Result<T, ParseError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (LOGLENS_SECTION__FIELD)
// - Validation
// - Sensible defaults
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LensConfig {
    /// Writer (logger) settings
    #[serde(default)]
    pub writer: WriterConfig,

    /// Parser and aggregation settings
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Diagnostics logging for the engine itself
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LensConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.writer.validate()?;
        self.analysis.validate()?;
        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.2 Writer Configuration
// ----------------------------------------------------------------------------

/// Settings for constructing a [`Logger`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Calls below this level are free no-ops (name or integer)
    #[serde(default = "default_threshold")]
    pub threshold: String,

    /// Template with `%` placeholders
    #[serde(default = "default_template")]
    pub template: String,

    /// Property names bound to the placeholders, in order
    #[serde(default = "default_emitters")]
    pub emitters: Vec<String>,

    /// Append ` 0x<hash>` after the rendered template
    #[serde(default = "default_true")]
    pub trailing_hash: bool,

    /// How streamed values are fingerprinted
    #[serde(default)]
    pub hash_mode: HashMode,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            template: default_template(),
            emitters: default_emitters(),
            trailing_hash: true,
            hash_mode: HashMode::default(),
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        Level::parse(&self.threshold)?;
        Format::from_names(&self.template, &self.emitters)?;
        Ok(())
    }
}

fn default_threshold() -> String {
    DEFAULT_THRESHOLD.into()
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.into()
}

fn default_emitters() -> Vec<String> {
    DEFAULT_EMITTERS.iter().map(|s| s.to_string()).collect()
}

// ----------------------------------------------------------------------------
// 5.3 Analysis Configuration
// ----------------------------------------------------------------------------

/// Settings for parsing emitted lines and aggregating them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Extraction pattern (one capture group per property)
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// Properties bound to the capture groups, in order
    #[serde(default = "default_pattern_properties")]
    pub properties: Vec<String>,

    /// Properties forming the grouping key, in order
    #[serde(default = "default_group_by")]
    pub group_by: Vec<String>,

    /// Histogram bucket width
    #[serde(default = "default_precision")]
    pub precision: f64,

    /// Maximum number of outlier buckets reported
    #[serde(default = "default_outlier_count")]
    pub outlier_count: usize,

    /// Maximum cumulative frequency fraction of an outlier run
    #[serde(default = "default_outlier_fraction")]
    pub outlier_fraction: f64,

    /// Message tokens inspected by the numeric extractor
    #[serde(default = "default_max_number_tokens")]
    pub max_number_tokens: usize,

    /// Parse lines on the rayon pool
    #[serde(default = "default_true")]
    pub parallel: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            pattern: default_pattern(),
            properties: default_pattern_properties(),
            group_by: default_group_by(),
            precision: default_precision(),
            outlier_count: default_outlier_count(),
            outlier_fraction: default_outlier_fraction(),
            max_number_tokens: default_max_number_tokens(),
            parallel: true,
        }
    }
}

impl AnalysisConfig {
    /// Compile the extraction pattern
    pub fn pattern(&self) -> Result<Pattern, ConfigError> {
        Pattern::from_names(&self.pattern, &self.properties)
    }

    /// Resolve the grouping domain
    pub fn domain(&self) -> Result<Domain, ConfigError> {
        Domain::from_names(&self.group_by)
    }

    /// Statistics parameters for every series
    pub fn stat_config(&self) -> StatConfig {
        StatConfig {
            precision: self.precision,
            outlier_count: self.outlier_count,
            outlier_fraction: self.outlier_fraction,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pattern()?;
        self.domain()?;

        if !(self.precision.is_finite() && self.precision > 0.0) {
            return Err(ConfigError::invalid_value(
                "analysis.precision",
                format!("Bucket width must be a positive number, got {}", self.precision),
            ));
        }

        if !(self.outlier_fraction > 0.0 && self.outlier_fraction <= 1.0) {
            return Err(ConfigError::invalid_value(
                "analysis.outlier_fraction",
                format!("Fraction must be in (0, 1], got {}", self.outlier_fraction),
            ));
        }

        if self.max_number_tokens == 0 {
            return Err(ConfigError::invalid_value(
                "analysis.max_number_tokens",
                "At least one token must be inspected",
            ));
        }

        Ok(())
    }
}

fn default_pattern() -> String {
    DEFAULT_PATTERN.into()
}

fn default_pattern_properties() -> Vec<String> {
    DEFAULT_PATTERN_PROPERTIES.iter().map(|s| s.to_string()).collect()
}

fn default_group_by() -> Vec<String> {
    DEFAULT_GROUP_BY.iter().map(|s| s.to_string()).collect()
}

fn default_precision() -> f64 {
    DEFAULT_PRECISION
}

fn default_outlier_count() -> usize {
    DEFAULT_OUTLIER_COUNT
}

fn default_outlier_fraction() -> f64 {
    DEFAULT_OUTLIER_FRACTION
}

fn default_max_number_tokens() -> usize {
    DEFAULT_MAX_NUMBER_TOKENS
}

// ----------------------------------------------------------------------------
// 5.4 Logging Configuration
// ----------------------------------------------------------------------------

/// Diagnostics logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            source_location: false,
            colors: true,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

// ============================================================================
// SECTION 6: DIAGNOSTICS LOGGING
// ============================================================================
// The engine's own diagnostics go through `tracing`, separate from the lines
// a Logger writes to its sink. Output goes to stderr so reports on stdout
// stay clean.
// ============================================================================

/// Initialize the diagnostics subscriber based on configuration
pub fn init_logging(config: &LoggingConfig) -> LensResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format.as_str() {
        "json" => registry
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_ids(true),
            )
            .try_init(),
        "pretty" => registry
            .with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
        _ => registry
            .with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            )
            .try_init(),
    };

    installed.map_err(|e| LensError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "loglens::init",
        level = %config.level,
        format = %config.format,
        "Diagnostics logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: LINE SESSION
// ============================================================================
// One in-flight logging call. Values appended to the session are rendered
// into its message buffer and folded into its identity hash. The session is
// finalized exactly once, when it is finished or dropped.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Hash Modes
// ----------------------------------------------------------------------------

/// How an appended value contributes to the line's hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMode {
    /// Fold the memory address of the value: the same object logged twice
    /// hashes the same, an equal copy does not.
    #[default]
    Identity,
    /// Fold an xxh3 digest of the rendered text: equal values hash the same.
    Content,
}

/// Address of a value, as folded by [`HashMode::Identity`].
#[inline]
pub fn identity_token<T: ?Sized>(value: &T) -> u64 {
    value as *const T as *const () as usize as u64
}

// ----------------------------------------------------------------------------
// 7.2 Line
// ----------------------------------------------------------------------------

/// The mutable accumulator behind a live logging call.
///
/// Filters receive a `&mut Line` and may rewrite `level` or `message` before
/// the line is rendered.
#[derive(Debug, Clone)]
pub struct Line {
    pub site: CallSite,
    pub level: Level,
    pub run: RunContext,
    pub message: String,
    hash: u64,
    hashing: bool,
    mode: HashMode,
}

impl Line {
    /// Create a new line and capture its run context.
    pub fn new(site: CallSite, level: Level, mode: HashMode) -> Self {
        Self {
            site,
            level,
            run: RunContext::capture(),
            message: String::with_capacity(DEFAULT_LINE_CAPACITY),
            hash: 0,
            hashing: true,
            mode,
        }
    }

    /// Render `value` into the message and fold it into the hash when hashing is on.
    pub fn append<T: Display + ?Sized>(&mut self, value: &T) {
        let start = self.message.len();
        // Writing into a String cannot fail.
        let _ = write!(self.message, "{}", value);

        if self.hashing {
            let token = match self.mode {
                HashMode::Identity => identity_token(value),
                HashMode::Content => xxh3_64(self.message[start..].as_bytes()),
            };
            self.hash ^= token;
        }
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    #[inline]
    pub fn is_hashing(&self) -> bool {
        self.hashing
    }

    pub fn set_hashing(&mut self, on: bool) {
        self.hashing = on;
    }

    pub fn hash_mode(&self) -> HashMode {
        self.mode
    }
}

// ============================================================================
// SECTION 8: FORMAT COMPILER
// ============================================================================
// A format is a template plus an ordered list of emitters. Rendering walks
// the template and substitutes the k-th `%` with the k-th emitter's output.
// The same format can be inverted into the extraction pattern that reads its
// output back.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Emitters
// ----------------------------------------------------------------------------

/// User supplied rendering function for a custom emitter
pub type EmitFn = Arc<dyn Fn(&Line, &mut String) + Send + Sync>;

/// Renders one item of a line
#[derive(Clone)]
pub enum Emitter {
    /// The accumulated message
    Message,
    /// A built-in property of the line
    Property(Property),
    /// A caller-defined item
    Custom { name: CompactString, emit: EmitFn },
}

impl Emitter {
    /// Create a custom emitter.
    pub fn custom<F>(name: &str, emit: F) -> Self
    where
        F: Fn(&Line, &mut String) + Send + Sync + 'static,
    {
        Emitter::Custom {
            name: CompactString::from(name),
            emit: Arc::new(emit),
        }
    }

    /// Resolve a built-in emitter by property name.
    pub fn named(name: &str) -> Result<Self, ConfigError> {
        Ok(Emitter::from(Property::parse(name)?))
    }

    pub fn name(&self) -> &str {
        match self {
            Emitter::Message => Property::Message.name(),
            Emitter::Property(p) => p.name(),
            Emitter::Custom { name, .. } => name.as_str(),
        }
    }

    fn emit(&self, line: &Line, out: &mut String) {
        match self {
            Emitter::Message => out.push_str(&line.message),
            Emitter::Property(p) => emit_property(*p, line, out),
            Emitter::Custom { emit, .. } => (**emit)(line, out),
        }
    }
}

impl From<Property> for Emitter {
    fn from(property: Property) -> Self {
        match property {
            Property::Message => Emitter::Message,
            other => Emitter::Property(other),
        }
    }
}

impl Debug for Emitter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Emitter::Message => f.write_str("Message"),
            Emitter::Property(p) => f.debug_tuple("Property").field(p).finish(),
            Emitter::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

/// Render a built-in property of `line`.
pub fn emit_property(property: Property, line: &Line, out: &mut String) {
    match property {
        Property::File => out.push_str(line.site.file),
        Property::Func => out.push_str(line.site.func),
        Property::Line => {
            let _ = write!(out, "{}", line.site.line);
        }
        Property::Level => out.push_str(&line.level.name()),
        Property::Date => out.push_str(&line.run.date),
        Property::Time => out.push_str(&line.run.time),
        Property::Thread => out.push_str(&line.run.thread),
        Property::Hash => {
            let _ = write!(out, "{:#x}", line.hash());
        }
        Property::Message => out.push_str(&line.message),
    }
}

// ----------------------------------------------------------------------------
// 8.2 Format
// ----------------------------------------------------------------------------

/// A template and the emitters bound to its placeholders.
#[derive(Debug, Clone)]
pub struct Format {
    template: String,
    emitters: Vec<Emitter>,
}

impl Format {
    /// Create a format with no emitters bound yet.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            emitters: Vec::new(),
        }
    }

    /// Bind the next placeholder to `emitter`.
    pub fn with(mut self, emitter: Emitter) -> Self {
        self.emitters.push(emitter);
        self
    }

    /// Bind the next placeholder to a built-in property.
    pub fn with_property(self, property: Property) -> Self {
        self.with(Emitter::from(property))
    }

    /// Build a format from a template and emitter names.
    pub fn from_names<S: AsRef<str>>(template: &str, names: &[S]) -> Result<Self, ConfigError> {
        let emitters = names
            .iter()
            .map(|n| Emitter::named(n.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            template: template.to_string(),
            emitters,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn emitters(&self) -> &[Emitter] {
        &self.emitters
    }

    pub fn placeholder_count(&self) -> usize {
        self.template.matches(PLACEHOLDER).count()
    }

    /// Append the rendered template to `out`.
    ///
    /// Placeholders without an emitter are written as a literal `%`; emitters
    /// without a placeholder are never invoked.
    pub fn render(&self, line: &Line, out: &mut String) {
        let mut emitters = self.emitters.iter();
        for (i, literal) in self.template.split(PLACEHOLDER).enumerate() {
            if i > 0 {
                match emitters.next() {
                    Some(emitter) => emitter.emit(line, out),
                    None => out.push(PLACEHOLDER),
                }
            }
            out.push_str(literal);
        }
    }

    /// Derive the extraction pattern that reads lines rendered by this format.
    ///
    /// Literals are escaped, built-in fields match lazily, the message matches
    /// greedily, and custom emitters match without capturing. With
    /// `trailing_hash` the pattern also captures the ` 0x<hash>` suffix.
    pub fn inverse_pattern(&self, trailing_hash: bool) -> Result<Pattern, ConfigError> {
        let mut source = String::from("^");
        let mut properties = Vec::new();
        let mut emitters = self.emitters.iter();

        for (i, literal) in self.template.split(PLACEHOLDER).enumerate() {
            if i > 0 {
                match emitters.next() {
                    Some(Emitter::Message) => {
                        source.push_str("(.*)");
                        properties.push(Property::Message);
                    }
                    Some(Emitter::Property(p)) => {
                        source.push_str("(.*?)");
                        properties.push(*p);
                    }
                    Some(Emitter::Custom { .. }) => source.push_str("(?:.*?)"),
                    None => source.push_str(&regex::escape("%")),
                }
            }
            source.push_str(&regex::escape(literal));
        }

        if trailing_hash {
            source.push_str(" (0x[0-9a-f]+)");
            properties.push(Property::Hash);
        }
        source.push('$');

        Pattern::new(&source, properties)
    }
}

impl Default for Format {
    fn default() -> Self {
        Format::new(DEFAULT_TEMPLATE)
            .with_property(Property::File)
            .with_property(Property::Func)
            .with_property(Property::Line)
            .with(Emitter::Message)
    }
}

// ============================================================================
// SECTION 9: FILTER CHAIN & CONCURRENT SINK
// ============================================================================
// The sink owns the output stream and the active filter behind one mutex.
// A finalized line takes the lock, runs the filter, renders, writes the whole
// line with a single write_all, and releases. Lines from concurrent writers
// therefore never interleave.
//
// The filter runs while the lock is held: it must not log through the same
// logger.
// ============================================================================

/// Predicate deciding whether a finalized line is written
pub type Filter = Box<dyn FnMut(&mut Line) -> bool + Send>;

/// The default filter: every line is written.
pub fn approve_all(_line: &mut Line) -> bool {
    true
}

/// Counters kept by the sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkStats {
    pub written: u64,
    pub vetoed: u64,
}

struct SinkState<W> {
    out: W,
    filter: Filter,
    stats: SinkStats,
}

/// Serialized output stream with its filter
pub struct Sink<W: Write> {
    state: Mutex<SinkState<W>>,
}

impl<W: Write> Sink<W> {
    /// Create a new sink writing to `out` with the approve-all filter.
    pub fn new(out: W) -> Self {
        Self {
            state: Mutex::new(SinkState {
                out,
                filter: Box::new(approve_all),
                stats: SinkStats::default(),
            }),
        }
    }

    /// Replace the active filter. Takes effect for lines finalized afterwards.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: FnMut(&mut Line) -> bool + Send + 'static,
    {
        self.state.lock().filter = Box::new(filter);
    }

    /// Restore the approve-all filter.
    pub fn clear_filter(&self) {
        self.state.lock().filter = Box::new(approve_all);
    }

    /// Filter, render and write one line atomically.
    ///
    /// Returns the line's hash when it was written, `None` when the filter
    /// vetoed it.
    pub fn commit<R>(&self, mut line: Line, render: R) -> io::Result<Option<u64>>
    where
        R: FnOnce(&Line, &mut String),
    {
        let mut state = self.state.lock();

        if !(state.filter)(&mut line) {
            state.stats.vetoed += 1;
            trace!(target: "loglens::writer", file = line.site.file, line = line.site.line, "Line vetoed by filter");
            return Ok(None);
        }

        let mut rendered = String::with_capacity(line.message.len() + DEFAULT_LINE_CAPACITY);
        render(&line, &mut rendered);
        state.out.write_all(rendered.as_bytes())?;
        state.stats.written += 1;

        Ok(Some(line.hash()))
    }

    pub fn flush(&self) -> io::Result<()> {
        self.state.lock().out.flush()
    }

    pub fn stats(&self) -> SinkStats {
        self.state.lock().stats
    }

    /// Inspect the output stream under the lock.
    pub fn with_output<T>(&self, f: impl FnOnce(&W) -> T) -> T {
        f(&self.state.lock().out)
    }

    pub fn into_inner(self) -> W {
        self.state.into_inner().out
    }
}

impl<W: Write> Debug for Sink<W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink").field("stats", &self.stats()).finish()
    }
}

// ============================================================================
// SECTION 10: LOGGER
// ============================================================================
// The severity gate and the entry point for logging calls.
//
//     log_at!(logger, Level::ERROR).append("Balance: ").append(&balance);
//
// A call below the threshold returns `Entry::Disabled`, whose methods do
// nothing. A call at or above it opens a live session that is written when
// finished or dropped.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Logger
// ----------------------------------------------------------------------------

/// A configured writer: threshold, format, hashing policy and sink
pub struct Logger<W: Write> {
    threshold: AtomicU32,
    format: Format,
    trailing_hash: bool,
    hash_mode: HashMode,
    sink: Sink<W>,
}

impl<W: Write> Logger<W> {
    /// Create a logger with the default format, writing everything to `out`.
    pub fn new(out: W) -> Self {
        LoggerBuilder::new(out).build()
    }

    pub fn builder(out: W) -> LoggerBuilder<W> {
        LoggerBuilder::new(out)
    }

    /// Create a logger from the `[writer]` configuration section.
    pub fn from_config(out: W, config: &WriterConfig) -> Result<Self, ConfigError> {
        let logger = LoggerBuilder::new(out)
            .threshold(Level::parse(&config.threshold)?)
            .format(Format::from_names(&config.template, &config.emitters)?)
            .trailing_hash(config.trailing_hash)
            .hash_mode(config.hash_mode)
            .build();
        Ok(logger)
    }

    /// Whether a call at `level` would be written.
    #[inline]
    pub fn enabled(&self, level: Level) -> bool {
        level.value() >= self.threshold.load(AtomicOrdering::Relaxed)
    }

    /// Open a logging session. Prefer the [`log_at!`] macro.
    #[inline]
    pub fn log(&self, level: Level, site: CallSite) -> Entry<'_, W> {
        if !self.enabled(level) {
            return Entry::Disabled;
        }
        Entry::Live(LiveEntry {
            logger: self,
            line: Some(Line::new(site, level, self.hash_mode)),
        })
    }

    pub fn threshold(&self) -> Level {
        Level::new(self.threshold.load(AtomicOrdering::Relaxed))
    }

    /// Change the threshold. Sessions already open are unaffected.
    pub fn set_threshold(&self, level: Level) {
        self.threshold.store(level.value(), AtomicOrdering::Relaxed);
        debug!(target: "loglens::writer", threshold = %level, "Threshold changed");
    }

    pub fn set_filter<F>(&self, filter: F)
    where
        F: FnMut(&mut Line) -> bool + Send + 'static,
    {
        self.sink.set_filter(filter);
    }

    pub fn clear_filter(&self) {
        self.sink.clear_filter();
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    pub fn trailing_hash(&self) -> bool {
        self.trailing_hash
    }

    /// The extraction pattern matching this logger's output.
    pub fn inverse_pattern(&self) -> Result<Pattern, ConfigError> {
        self.format.inverse_pattern(self.trailing_hash)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.sink.flush()
    }

    pub fn stats(&self) -> SinkStats {
        self.sink.stats()
    }

    pub fn with_output<T>(&self, f: impl FnOnce(&W) -> T) -> T {
        self.sink.with_output(f)
    }

    pub fn into_inner(self) -> W {
        self.sink.into_inner()
    }

    fn finalize(&self, line: Line) -> io::Result<Option<u64>> {
        let format = &self.format;
        let trailing_hash = self.trailing_hash;
        self.sink.commit(line, |line, out| {
            format.render(line, out);
            if trailing_hash {
                let _ = write!(out, " {:#x}", line.hash());
            }
            out.push('\n');
        })
    }
}

impl<W: Write> Debug for Logger<W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("threshold", &self.threshold())
            .field("format", &self.format)
            .field("trailing_hash", &self.trailing_hash)
            .field("hash_mode", &self.hash_mode)
            .field("sink", &self.sink)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 10.2 Builder
// ----------------------------------------------------------------------------

/// Builder for [`Logger`]
pub struct LoggerBuilder<W: Write> {
    out: W,
    threshold: Level,
    format: Format,
    trailing_hash: bool,
    hash_mode: HashMode,
    filter: Option<Filter>,
}

impl<W: Write> LoggerBuilder<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            threshold: Level::NOTSET,
            format: Format::default(),
            trailing_hash: true,
            hash_mode: HashMode::Identity,
            filter: None,
        }
    }

    pub fn threshold(mut self, level: Level) -> Self {
        self.threshold = level;
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn trailing_hash(mut self, on: bool) -> Self {
        self.trailing_hash = on;
        self
    }

    pub fn hash_mode(mut self, mode: HashMode) -> Self {
        self.hash_mode = mode;
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: FnMut(&mut Line) -> bool + Send + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn build(self) -> Logger<W> {
        let sink = Sink::new(self.out);
        if let Some(filter) = self.filter {
            sink.state.lock().filter = filter;
        }

        debug!(
            target: "loglens::writer",
            threshold = %self.threshold,
            template = %self.format.template(),
            emitters = self.format.emitters().len(),
            trailing_hash = self.trailing_hash,
            "Logger constructed"
        );

        Logger {
            threshold: AtomicU32::new(self.threshold.value()),
            format: self.format,
            trailing_hash: self.trailing_hash,
            hash_mode: self.hash_mode,
            sink,
        }
    }
}

impl<W: Write> Debug for LoggerBuilder<W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerBuilder")
            .field("threshold", &self.threshold)
            .field("format", &self.format)
            .field("trailing_hash", &self.trailing_hash)
            .field("hash_mode", &self.hash_mode)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 10.3 Entries
// ----------------------------------------------------------------------------

/// What happened to a finished session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The line was written with this hash
    Written { hash: u64 },
    /// The filter rejected the line
    Vetoed,
    /// The level was below the threshold
    Disabled,
}

impl Outcome {
    pub fn hash(&self) -> Option<u64> {
        match self {
            Outcome::Written { hash } => Some(*hash),
            _ => None,
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, Outcome::Written { .. })
    }
}

/// Handle returned by [`Logger::log`]
#[derive(Debug)]
pub enum Entry<'a, W: Write> {
    /// Below threshold: every operation is a no-op
    Disabled,
    Live(LiveEntry<'a, W>),
}

/// An open session bound to its logger
pub struct LiveEntry<'a, W: Write> {
    logger: &'a Logger<W>,
    line: Option<Line>,
}

impl<'a, W: Write> Entry<'a, W> {
    /// Append a value to the message.
    #[inline]
    pub fn append<T: Display + ?Sized>(&mut self, value: &T) -> &mut Self {
        if let Some(line) = self.line_mut() {
            line.append(value);
        }
        self
    }

    /// Stop folding appended values into the hash.
    pub fn hash_off(&mut self) -> &mut Self {
        if let Some(line) = self.line_mut() {
            line.set_hashing(false);
        }
        self
    }

    /// Resume folding appended values into the hash.
    pub fn hash_on(&mut self) -> &mut Self {
        if let Some(line) = self.line_mut() {
            line.set_hashing(true);
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Entry::Live(_))
    }

    /// Current hash of the open session.
    pub fn hash(&self) -> Option<u64> {
        self.line().map(Line::hash)
    }

    pub fn line(&self) -> Option<&Line> {
        match self {
            Entry::Live(live) => live.line.as_ref(),
            Entry::Disabled => None,
        }
    }

    fn line_mut(&mut self) -> Option<&mut Line> {
        match self {
            Entry::Live(live) => live.line.as_mut(),
            Entry::Disabled => None,
        }
    }

    /// Finalize now and report the outcome, surfacing write errors.
    pub fn finish(mut self) -> LensResult<Outcome> {
        match &mut self {
            Entry::Disabled => Ok(Outcome::Disabled),
            Entry::Live(live) => live.finalize(),
        }
    }
}

impl<'a, W: Write> LiveEntry<'a, W> {
    fn finalize(&mut self) -> LensResult<Outcome> {
        let line = match self.line.take() {
            Some(line) => line,
            None => return Err(LensError::Internal("Session already finalized".into())),
        };

        match self.logger.finalize(line)? {
            Some(hash) => Ok(Outcome::Written { hash }),
            None => Ok(Outcome::Vetoed),
        }
    }
}

impl<'a, W: Write> Drop for LiveEntry<'a, W> {
    fn drop(&mut self) {
        if let Some(line) = self.line.take() {
            let (file, number) = (line.site.file, line.site.line);
            if let Err(e) = self.logger.finalize(line) {
                error!(target: "loglens::writer", file, line = number, error = %e, "Failed to write log line");
            }
        }
    }
}

impl<'a, W: Write> Debug for LiveEntry<'a, W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveEntry").field("line", &self.line).finish()
    }
}

// ============================================================================
// SECTION 11: WRITER TESTS
// ============================================================================


// ============================================================================
// SECTION 12: PATTERN PARSER
// ============================================================================
// Reads emitted lines back into records:
// - An extraction pattern binds capture groups to properties
// - Each matched group is stored through the property's setter
// - Numeric tokens of the message become the record's number series
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Records
// ----------------------------------------------------------------------------

/// One parsed line
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub code: CodeContext,
    pub run: RunContext,
    pub message: String,
    /// Numeric tokens of the message, in order
    pub numbers: SmallVec<[f64; 4]>,
}

impl LogRecord {
    /// Store a captured value into the field named by `property`.
    pub fn set(&mut self, property: Property, value: &str) -> ParseResult<()> {
        match property {
            Property::File => self.code.file = CompactString::from(value),
            Property::Func => self.code.func = CompactString::from(value),
            Property::Level => self.code.level = CompactString::from(value),
            Property::Hash => self.code.hash = CompactString::from(value),
            Property::Line => {
                self.code.line = value.trim().parse().map_err(|_| ParseError::InvalidField {
                    property,
                    value: value.to_string(),
                })?;
            }
            Property::Date => self.run.date = CompactString::from(value),
            Property::Time => self.run.time = CompactString::from(value),
            Property::Thread => self.run.thread = CompactString::from(value),
            Property::Message => {
                self.message.clear();
                self.message.push_str(value);
            }
        }
        Ok(())
    }

    /// Read the field named by `property` as text.
    pub fn get(&self, property: Property) -> Cow<'_, str> {
        match property {
            Property::File => Cow::Borrowed(self.code.file.as_str()),
            Property::Func => Cow::Borrowed(self.code.func.as_str()),
            Property::Level => Cow::Borrowed(self.code.level.as_str()),
            Property::Hash => Cow::Borrowed(self.code.hash.as_str()),
            Property::Line => Cow::Owned(self.code.line.to_string()),
            Property::Date => Cow::Borrowed(self.run.date.as_str()),
            Property::Time => Cow::Borrowed(self.run.time.as_str()),
            Property::Thread => Cow::Borrowed(self.run.thread.as_str()),
            Property::Message => Cow::Borrowed(self.message.as_str()),
        }
    }
}

impl Display for LogRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({} {})", self.code, self.message)
    }
}

// ----------------------------------------------------------------------------
// 12.2 Numeric Extraction
// ----------------------------------------------------------------------------

/// Parse the numeric tokens of `text`.
///
/// Tokens are split on whitespace and commas. Only the first `max_tokens`
/// tokens are inspected; non-numeric and non-finite tokens are skipped.
pub fn extract_numbers(text: &str, max_tokens: usize) -> SmallVec<[f64; 4]> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .take(max_tokens)
        .filter_map(|token| token.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .collect()
}

// ----------------------------------------------------------------------------
// 12.3 Extraction Pattern
// ----------------------------------------------------------------------------

static DEFAULT_PATTERN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(DEFAULT_PATTERN).expect("default extraction pattern is a valid regex"));

/// A regular expression whose capture groups are bound to properties.
///
/// The expression must match a whole line.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
    properties: Vec<Property>,
}

impl Pattern {
    /// Compile `pattern`, requiring exactly one capture group per property.
    pub fn new(pattern: &str, properties: Vec<Property>) -> Result<Self, ConfigError> {
        let anchored = format!("^(?:{})$", pattern);
        let regex = Regex::new(&anchored).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        let groups = regex.captures_len() - 1;
        if groups != properties.len() {
            return Err(ConfigError::GroupCountMismatch {
                groups,
                properties: properties.len(),
            });
        }

        Ok(Self {
            source: pattern.to_string(),
            regex,
            properties,
        })
    }

    /// Compile a pattern whose properties are given by name.
    pub fn from_names<S: AsRef<str>>(pattern: &str, names: &[S]) -> Result<Self, ConfigError> {
        Pattern::new(pattern, Property::parse_list(names)?)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Parse one line with the default numeric token limit.
    pub fn parse(&self, raw: &str) -> ParseResult<LogRecord> {
        self.parse_with(raw, DEFAULT_MAX_NUMBER_TOKENS)
    }

    /// Parse one line, inspecting at most `max_tokens` message tokens for numbers.
    pub fn parse_with(&self, raw: &str, max_tokens: usize) -> ParseResult<LogRecord> {
        let captures = self
            .regex
            .captures(raw)
            .ok_or_else(|| ParseError::malformed(raw))?;

        let mut record = LogRecord::default();
        for (property, group) in self.properties.iter().zip(captures.iter().skip(1)) {
            // Optional groups that did not participate read as empty.
            record.set(*property, group.map_or("", |m| m.as_str()))?;
        }
        record.numbers = extract_numbers(&record.message, max_tokens);

        Ok(record)
    }
}

impl Default for Pattern {
    fn default() -> Self {
        Self {
            source: DEFAULT_PATTERN.to_string(),
            regex: DEFAULT_PATTERN_REGEX.clone(),
            properties: vec![
                Property::File,
                Property::Func,
                Property::Line,
                Property::Message,
                Property::Hash,
            ],
        }
    }
}

// ----------------------------------------------------------------------------
// 12.4 Parser
// ----------------------------------------------------------------------------

/// Records parsed from a batch of lines, plus the lines that were skipped
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParseReport {
    pub records: Vec<LogRecord>,
    /// 1-based numbers of the lines that failed to parse
    pub malformed: Vec<usize>,
}

impl ParseReport {
    pub fn total_lines(&self) -> usize {
        self.records.len() + self.malformed.len()
    }

    /// Distinct code contexts seen in the parsed records.
    pub fn states(&self) -> BTreeSet<CodeContext> {
        self.records.iter().map(|r| r.code.clone()).collect()
    }
}

/// Batch parser over a compiled pattern
#[derive(Debug, Clone)]
pub struct Parser {
    pattern: Pattern,
    max_number_tokens: usize,
    parallel: bool,
}

impl Parser {
    pub fn new(pattern: Pattern) -> Self {
        Self {
            pattern,
            max_number_tokens: DEFAULT_MAX_NUMBER_TOKENS,
            parallel: true,
        }
    }

    pub fn from_config(config: &AnalysisConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.pattern()?)
            .with_max_number_tokens(config.max_number_tokens)
            .with_parallel(config.parallel))
    }

    pub fn with_max_number_tokens(mut self, max_tokens: usize) -> Self {
        self.max_number_tokens = max_tokens;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn parse_line(&self, raw: &str) -> ParseResult<LogRecord> {
        self.pattern.parse_with(raw, self.max_number_tokens)
    }

    /// Parse every line, skipping and reporting the ones that fail.
    ///
    /// Records keep the input order in both sequential and parallel mode.
    pub fn parse_lines<S: AsRef<str> + Sync>(&self, lines: &[S]) -> ParseReport {
        let results: Vec<ParseResult<LogRecord>> = if self.parallel {
            lines.par_iter().map(|l| self.parse_line(l.as_ref())).collect()
        } else {
            lines.iter().map(|l| self.parse_line(l.as_ref())).collect()
        };

        let mut report = ParseReport::default();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(record) => report.records.push(record),
                Err(e) => {
                    warn!(target: "loglens::parser", line = index + 1, error = %e, "Skipping line");
                    report.malformed.push(index + 1);
                }
            }
        }

        debug!(
            target: "loglens::parser",
            parsed = report.records.len(),
            malformed = report.malformed.len(),
            "Parsed batch"
        );

        report
    }

    /// Read a file and parse all of its lines.
    pub fn read_file<P: AsRef<Path>>(&self, path: P) -> LensResult<ParseReport> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let lines = reader.lines().collect::<io::Result<Vec<String>>>()?;

        info!(target: "loglens::parser", path = %path.display(), lines = lines.len(), "Read log file");
        Ok(self.parse_lines(&lines))
    }
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new(Pattern::default())
    }
}

// ============================================================================
// SECTION 13: STREAMING STATISTICS
// ============================================================================
// Single-pass accumulators over number series:
// - Stat: min, max, count, running mean, bucketed histogram, outliers
// - VectorStat: one Stat per position of a series
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Parameters
// ----------------------------------------------------------------------------

/// Histogram and outlier parameters of a [`Stat`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatConfig {
    pub precision: f64,
    pub outlier_count: usize,
    pub outlier_fraction: f64,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            precision: DEFAULT_PRECISION,
            outlier_count: DEFAULT_OUTLIER_COUNT,
            outlier_fraction: DEFAULT_OUTLIER_FRACTION,
        }
    }
}

// ----------------------------------------------------------------------------
// 13.2 Stat
// ----------------------------------------------------------------------------

/// Streaming statistics over one number series.
///
/// An empty Stat reports `max = -inf` and `min = +inf`.
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    max: f64,
    min: f64,
    num: u64,
    mean: f64,
    freq_dist: BTreeMap<OrderedFloat<f64>, u64>,
    config: StatConfig,
}

impl Stat {
    pub fn new(config: StatConfig) -> Self {
        Self {
            max: f64::NEG_INFINITY,
            min: f64::INFINITY,
            num: 0,
            mean: 0.0,
            freq_dist: BTreeMap::new(),
            config,
        }
    }

    /// Histogram bucket of `x`: `precision * floor(x / precision)`.
    pub fn bucket(&self, x: f64) -> f64 {
        self.config.precision * (x / self.config.precision).floor()
    }

    /// Add an observation.
    pub fn add(&mut self, x: f64) {
        self.max = self.max.max(x);
        self.min = self.min.min(x);

        let n = self.num as f64;
        self.mean = self.mean * (n / (n + 1.0)) + x / (n + 1.0);
        self.num += 1;

        *self.freq_dist.entry(OrderedFloat(self.bucket(x))).or_insert(0) += 1;
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn num(&self) -> u64 {
        self.num
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn config(&self) -> StatConfig {
        self.config
    }

    /// Buckets in ascending order with their frequencies.
    pub fn histogram(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.freq_dist.iter().map(|(bucket, freq)| (bucket.0, *freq))
    }

    /// The rare low buckets.
    ///
    /// Walks the histogram from its lowest bucket and keeps each bucket while
    /// fewer than `outlier_count` buckets have been visited and the cumulative
    /// frequency stays below `outlier_fraction` of all observations. Stops at
    /// the first bucket that breaks either bound.
    pub fn outliers(&self) -> Vec<(f64, u64)> {
        let limit = self.num as f64 * self.config.outlier_fraction;
        let mut cum_freq = 0u64;
        let mut cum_count = 0usize;
        let mut outliers = Vec::new();

        for (bucket, freq) in self.histogram() {
            cum_freq += freq;
            cum_count += 1;
            if cum_count < self.config.outlier_count && (cum_freq as f64) < limit {
                outliers.push((bucket, freq));
            } else {
                break;
            }
        }

        outliers
    }

    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            max: self.max,
            min: self.min,
            num: self.num,
            mean: self.mean,
            histogram: self.histogram().collect(),
            outliers: self.outliers(),
        }
    }
}

impl Default for Stat {
    fn default() -> Self {
        Stat::new(StatConfig::default())
    }
}

impl Display for Stat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max:{} min:{} num:{} mean:{} outliers:(",
            self.max, self.min, self.num, self.mean
        )?;
        for (i, (bucket, freq)) in self.outliers().into_iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "<{},{}>", bucket, freq)?;
        }
        f.write_str(")")
    }
}

/// Serializable view of a [`Stat`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub max: f64,
    pub min: f64,
    pub num: u64,
    pub mean: f64,
    pub histogram: Vec<(f64, u64)>,
    pub outliers: Vec<(f64, u64)>,
}

// ----------------------------------------------------------------------------
// 13.3 Vector Stat
// ----------------------------------------------------------------------------

/// One [`Stat`] per position of a number series.
///
/// Series may differ in length; a position's Stat only sees the series long
/// enough to reach it.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorStat {
    stats: Vec<Stat>,
    config: StatConfig,
}

impl VectorStat {
    pub fn new(config: StatConfig) -> Self {
        Self {
            stats: Vec::new(),
            config,
        }
    }

    pub fn add(&mut self, values: &[f64]) {
        for (i, &value) in values.iter().enumerate() {
            if i == self.stats.len() {
                self.stats.push(Stat::new(self.config));
            }
            self.stats[i].add(value);
        }
    }

    pub fn get(&self, index: usize) -> Option<&Stat> {
        self.stats.get(index)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stat> + '_ {
        self.stats.iter()
    }

    pub fn snapshot(&self) -> Vec<StatSnapshot> {
        self.stats.iter().map(Stat::snapshot).collect()
    }
}

impl Default for VectorStat {
    fn default() -> Self {
        VectorStat::new(StatConfig::default())
    }
}

impl Display for VectorStat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("{ ")?;
        for (i, stat) in self.stats.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", i, stat)?;
        }
        f.write_str(" }")
    }
}

// ============================================================================
// SECTION 14: DOMAIN AGGREGATOR
// ============================================================================
// Groups records by the text of an ordered list of properties and keeps a
// tally per group: either a plain count or a VectorStat over the records'
// number series.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Domain
// ----------------------------------------------------------------------------

/// An ordered list of properties forming a grouping key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Domain(Vec<Property>);

impl Domain {
    pub fn new(properties: Vec<Property>) -> Self {
        Domain(properties)
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ConfigError> {
        Ok(Domain(Property::parse_list(names)?))
    }

    pub fn properties(&self) -> &[Property] {
        &self.0
    }

    /// Property texts of `record` joined by single spaces.
    ///
    /// Values are not escaped, so fields that contain spaces can collide:
    /// `("a b", "c")` and `("a", "b c")` both key as `a b c`. Group on
    /// space-free properties when that matters.
    pub fn key(&self, record: &LogRecord) -> String {
        let mut key = String::new();
        for (i, property) in self.0.iter().enumerate() {
            if i > 0 {
                key.push(' ');
            }
            key.push_str(&record.get(*property));
        }
        key
    }
}

impl Default for Domain {
    fn default() -> Self {
        Domain(vec![Property::File, Property::Func])
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, property) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(property.name())?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 14.2 Tallies
// ----------------------------------------------------------------------------

/// Per-group aggregate
#[derive(Debug, Clone, PartialEq)]
pub enum Tally {
    Count(u64),
    Series(VectorStat),
}

impl Tally {
    pub fn as_count(&self) -> Option<u64> {
        match self {
            Tally::Count(n) => Some(*n),
            Tally::Series(_) => None,
        }
    }

    pub fn as_series(&self) -> Option<&VectorStat> {
        match self {
            Tally::Series(stats) => Some(stats),
            Tally::Count(_) => None,
        }
    }

    pub fn snapshot(&self) -> TallySnapshot {
        match self {
            Tally::Count(n) => TallySnapshot::Count(*n),
            Tally::Series(stats) => TallySnapshot::Series(stats.snapshot()),
        }
    }
}

impl Display for Tally {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Tally::Count(n) => write!(f, "{}", n),
            Tally::Series(stats) => write!(f, "{}", stats),
        }
    }
}

/// Serializable view of a [`Tally`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TallySnapshot {
    Count(u64),
    Series(Vec<StatSnapshot>),
}

// ----------------------------------------------------------------------------
// 14.3 Domain Stat
// ----------------------------------------------------------------------------

/// Records grouped by a [`Domain`], keyed in ascending key order
#[derive(Debug, Clone, PartialEq)]
pub struct DomainStat {
    domain: Domain,
    groups: BTreeMap<String, Tally>,
}

impl DomainStat {
    /// Group `records` and accumulate each record's number series.
    pub fn build(records: &[LogRecord], domain: &Domain, config: StatConfig) -> Self {
        let mut groups: BTreeMap<String, Tally> = BTreeMap::new();
        for record in records {
            let tally = groups
                .entry(domain.key(record))
                .or_insert_with(|| Tally::Series(VectorStat::new(config)));
            if let Tally::Series(stats) = tally {
                stats.add(&record.numbers);
            }
        }

        debug!(target: "loglens::analysis", domain = %domain, records = records.len(), groups = groups.len(), "Built domain statistics");
        Self {
            domain: domain.clone(),
            groups,
        }
    }

    /// Group `records` and count them.
    pub fn count(records: &[LogRecord], domain: &Domain) -> Self {
        let mut groups: BTreeMap<String, Tally> = BTreeMap::new();
        for record in records {
            let tally = groups.entry(domain.key(record)).or_insert(Tally::Count(0));
            if let Tally::Count(n) = tally {
                *n += 1;
            }
        }

        debug!(target: "loglens::analysis", domain = %domain, records = records.len(), groups = groups.len(), "Counted domain groups");
        Self {
            domain: domain.clone(),
            groups,
        }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn groups(&self) -> &BTreeMap<String, Tally> {
        &self.groups
    }

    pub fn get(&self, key: &str) -> Option<&Tally> {
        self.groups.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.groups.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn snapshot(&self) -> DomainSnapshot {
        DomainSnapshot {
            domain: self.domain.properties().to_vec(),
            groups: self
                .groups
                .iter()
                .map(|(key, tally)| (key.clone(), tally.snapshot()))
                .collect(),
        }
    }
}

impl Display for DomainStat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (key, tally) in &self.groups {
            writeln!(f, "{} : {}", key, tally)?;
        }
        Ok(())
    }
}

/// Serializable view of a [`DomainStat`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSnapshot {
    pub domain: Vec<Property>,
    pub groups: BTreeMap<String, TallySnapshot>,
}

// ----------------------------------------------------------------------------
// 14.4 Analysis Pipeline
// ----------------------------------------------------------------------------

/// Parsed lines and their aggregate
#[derive(Debug, Clone)]
pub struct Analysis {
    pub report: ParseReport,
    pub stats: DomainStat,
}

/// Parse `lines` and aggregate their number series by the configured domain.
pub fn analyse_lines<S: AsRef<str> + Sync>(lines: &[S], config: &AnalysisConfig) -> Result<Analysis, ConfigError> {
    let parser = Parser::from_config(config)?;
    let domain = config.domain()?;
    let report = parser.parse_lines(lines);
    let stats = DomainStat::build(&report.records, &domain, config.stat_config());
    Ok(Analysis { report, stats })
}

/// Read a log file and aggregate it.
pub fn analyse_file<P: AsRef<Path>>(path: P, config: &AnalysisConfig) -> LensResult<Analysis> {
    let start = Instant::now();
    let parser = Parser::from_config(config)?;
    let domain = config.domain()?;
    let report = parser.read_file(path)?;
    let stats = DomainStat::build(&report.records, &domain, config.stat_config());

    info!(
        target: "loglens::analysis",
        records = report.records.len(),
        malformed = report.malformed.len(),
        groups = stats.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Analysis complete"
    );

    Ok(Analysis { report, stats })
}

// ============================================================================
// SECTION 15: ANALYSIS TESTS
// ============================================================================

#[cfg(test)]
mod analysis_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::io::Write as _;

    fn record(file: &str, func: &str, numbers: &[f64]) -> LogRecord {
        let mut record = LogRecord::default();
        record.code.file = file.into();
        record.code.func = func.into();
        record.numbers = numbers.iter().copied().collect();
        record
    }

    // ------------------------------------------------------------------------
    // Numeric extraction
    // ------------------------------------------------------------------------

    #[test]
    fn test_extract_numbers() {
        let numbers = extract_numbers("Balance after withdraw: 9999 logging a random integer 1042", 100);
        assert_eq!(numbers.as_slice(), &[9999.0, 1042.0]);

        let numbers = extract_numbers("1,2.5, x,-3e2", 100);
        assert_eq!(numbers.as_slice(), &[1.0, 2.5, -300.0]);
    }

    #[test]
    fn test_extract_numbers_limits_and_skips() {
        assert_eq!(extract_numbers("1 2 3 4", 2).as_slice(), &[1.0, 2.0]);
        assert_eq!(extract_numbers("a b 3", 2).as_slice(), &[] as &[f64]);
        assert_eq!(extract_numbers("nan inf -inf 5", 100).as_slice(), &[5.0]);
        assert!(extract_numbers("", 100).is_empty());
    }

    // ------------------------------------------------------------------------
    // Pattern parser
    // ------------------------------------------------------------------------

    #[test]
    fn test_parse_default_line() {
        let record = Pattern::default().parse("src/main.rs(main:42):Balance 12 0x1f").unwrap();
        assert_eq!(record.code.file, "src/main.rs");
        assert_eq!(record.code.func, "main");
        assert_eq!(record.code.line, 42);
        assert_eq!(record.code.hash, "0x1f");
        assert_eq!(record.message, "Balance 12");
        assert_eq!(record.numbers.as_slice(), &[12.0]);
        assert_eq!(record.to_string(), "(src/main.rs main 42 0x1f Balance 12)");
    }

    #[test]
    fn test_parse_malformed_line() {
        let result = Pattern::default().parse("no structure here");
        assert_eq!(result, Err(ParseError::malformed("no structure here")));
    }

    #[test]
    fn test_parse_invalid_line_number() {
        let result = Pattern::default().parse("a.c(f:seven):msg 0x1");
        assert!(matches!(
            result,
            Err(ParseError::InvalidField { property: Property::Line, .. })
        ));
    }

    #[test]
    fn test_pattern_group_count_mismatch() {
        let result = Pattern::from_names(r"(.*):(.*)", &["file"]);
        assert!(matches!(
            result,
            Err(ConfigError::GroupCountMismatch { groups: 2, properties: 1 })
        ));
    }

    #[test]
    fn test_pattern_invalid_regex() {
        let result = Pattern::from_names(r"(.*", &["file"]);
        assert!(matches!(result, Err(ConfigError::InvalidPattern { .. })));
    }

    #[test]
    fn test_pattern_matches_whole_line() {
        let pattern = Pattern::from_names(r"(\w+)=(\d+)", &["func", "line"]).unwrap();
        assert!(pattern.parse("x=1").is_ok());
        assert!(pattern.parse("x=1 trailing").is_err());
    }

    #[test]
    fn test_pattern_optional_group_reads_empty() {
        let pattern = Pattern::from_names(r"(\w+)(?: \[(\w+)\])?:(.*)", &["file", "level", "message"]).unwrap();
        let record = pattern.parse("main: 5 apples").unwrap();
        assert_eq!(record.code.level, "");
        assert_eq!(record.numbers.as_slice(), &[5.0]);
    }

    #[test]
    fn test_record_get_set() {
        let mut record = LogRecord::default();
        for property in Property::ALL {
            let value = if property == Property::Line { "12" } else { property.name() };
            record.set(property, value).unwrap();
            assert_eq!(record.get(property), value);
        }
    }

    #[test]
    fn test_parse_lines_skips_and_reports() {
        let lines = [
            "a.c(f:1):x 1 0x1",
            "garbage",
            "a.c(g:2):x 2 0x2",
            "",
            "b.c(f:3):x 3 0x3",
        ];

        for parallel in [false, true] {
            let parser = Parser::default().with_parallel(parallel);
            let report = parser.parse_lines(&lines);
            assert_eq!(report.malformed, vec![2, 4]);
            assert_eq!(report.total_lines(), 5);

            let lines_seen: Vec<u32> = report.records.iter().map(|r| r.code.line).collect();
            assert_eq!(lines_seen, vec![1, 2, 3]);
        }
    }

    #[test]
    fn test_parse_report_states() {
        let lines = ["a.c(f:1):x 0x1", "a.c(f:1):y 0x1", "a.c(f:2):z 0x2"];
        let report = Parser::default().parse_lines(&lines);

        let states: Vec<String> = report.states().iter().map(|c| c.to_string()).collect();
        assert_eq!(states, vec!["a.c f 1 0x1", "a.c f 2 0x2"]);
    }

    #[test]
    fn test_read_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "w.rs(withdraw:10):Balance after withdraw: 90 0xa").unwrap();
        writeln!(file, "w.rs(withdraw:10):Balance after withdraw: 80 0xa").unwrap();
        writeln!(file, "not a log line").unwrap();

        let report = Parser::default().read_file(file.path()).unwrap();
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.malformed, vec![3]);
    }

    #[test]
    fn test_read_missing_file() {
        let result = Parser::default().read_file("/definitely/not/here.log");
        assert!(matches!(result, Err(LensError::Io(_))));
    }

    // ------------------------------------------------------------------------
    // Streaming statistics
    // ------------------------------------------------------------------------

    #[test]
    fn test_stat_two_values() {
        let mut stat = Stat::default();
        stat.add(1.0);
        stat.add(2.0);

        assert_eq!(stat.min(), 1.0);
        assert_eq!(stat.max(), 2.0);
        assert_eq!(stat.num(), 2);
        assert_eq!(stat.mean(), 1.5);
        assert_eq!(stat.histogram().collect::<Vec<_>>(), vec![(1.0, 1), (2.0, 1)]);
    }

    #[test]
    fn test_stat_empty() {
        let stat = Stat::default();
        assert_eq!(stat.num(), 0);
        assert_eq!(stat.max(), f64::NEG_INFINITY);
        assert_eq!(stat.min(), f64::INFINITY);
        assert!(stat.outliers().is_empty());
    }

    #[test]
    fn test_stat_running_mean() {
        let values = [3.5, -2.0, 10.25, 7.0, 0.0, 1.0];
        let mut stat = Stat::default();
        values.iter().for_each(|v| stat.add(*v));

        let expected = values.iter().sum::<f64>() / values.len() as f64;
        assert!((stat.mean() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_stat_buckets_by_precision() {
        let mut stat = Stat::new(StatConfig {
            precision: 0.5,
            ..StatConfig::default()
        });
        for v in [0.1, 0.4, 0.6, -0.2] {
            stat.add(v);
        }
        assert_eq!(
            stat.histogram().collect::<Vec<_>>(),
            vec![(-0.5, 1), (0.0, 2), (0.5, 1)]
        );
    }

    #[test]
    fn test_stat_outliers_prefix_scan() {
        let config = StatConfig {
            precision: 1.0,
            outlier_count: 3,
            outlier_fraction: 0.5,
        };
        let mut stat = Stat::new(config);
        for v in [1.0, 2.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0] {
            stat.add(v);
        }
        assert_eq!(stat.outliers(), vec![(1.0, 1), (2.0, 1)]);

        let mut capped = Stat::new(StatConfig {
            outlier_count: 2,
            ..config
        });
        for v in [1.0, 2.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0] {
            capped.add(v);
        }
        assert_eq!(capped.outliers(), vec![(1.0, 1)]);
    }

    #[test]
    fn test_stat_display() {
        let mut stat = Stat::new(StatConfig {
            outlier_fraction: 1.0,
            ..StatConfig::default()
        });
        stat.add(1.0);
        stat.add(2.0);
        assert_eq!(stat.to_string(), "max:2 min:1 num:2 mean:1.5 outliers:(<1,1>)");
    }

    #[test]
    fn test_vector_stat_uneven_series() {
        let mut stats = VectorStat::default();
        stats.add(&[-100.0, 5.32, 24.0]);
        for _ in 0..28 {
            stats.add(&[2.0, 6.32, 25.0]);
        }
        let first = stats.get(0).unwrap();
        assert_eq!(first.num(), 29);
        assert!(first.min() <= -100.0);
        assert!(first.max() >= -100.0);

        stats.add(&[7.0]);

        assert_eq!(stats.len(), 3);
        let first = stats.get(0).unwrap();
        assert_eq!(first.num(), 30);
        assert_eq!(first.min(), -100.0);
        assert_eq!(first.max(), 7.0);

        let second = stats.get(1).unwrap();
        assert_eq!(second.num(), 29);
        assert_eq!(second.histogram().collect::<Vec<_>>(), vec![(5.0, 1), (6.0, 28)]);
        assert_eq!(stats.get(2).unwrap().num(), 29);
        assert!(stats.get(3).is_none());
        assert_eq!(stats.iter().map(Stat::num).collect::<Vec<_>>(), vec![30, 29, 29]);
    }

    #[test]
    fn test_vector_stat_display() {
        let mut stats = VectorStat::new(StatConfig {
            outlier_fraction: 1.0,
            ..StatConfig::default()
        });
        assert_eq!(stats.to_string(), "{  }");
        stats.add(&[1.0, 4.0]);
        assert_eq!(
            stats.to_string(),
            "{ 0: max:1 min:1 num:1 mean:1 outliers:(), 1: max:4 min:4 num:1 mean:4 outliers:() }"
        );
    }

    // ------------------------------------------------------------------------
    // Domain aggregation
    // ------------------------------------------------------------------------

    #[test]
    fn test_domain_key() {
        let domain = Domain::from_names(&["file", "func", "line"]).unwrap();
        let mut rec = record("a.c", "f", &[]);
        rec.code.line = 9;
        assert_eq!(domain.key(&rec), "a.c f 9");
        assert_eq!(domain.to_string(), "file,func,line");
    }

    #[test]
    fn test_domain_count() {
        let records = vec![
            record("a.c", "f", &[]),
            record("a.c", "g", &[]),
            record("a.c", "f", &[]),
            record("b.c", "f", &[]),
        ];
        let counts = DomainStat::count(&records, &Domain::default());

        assert_eq!(counts.keys().collect::<Vec<_>>(), vec!["a.c f", "a.c g", "b.c f"]);
        assert_eq!(counts.get("a.c f").and_then(Tally::as_count), Some(2));
        assert_eq!(counts.to_string(), "a.c f : 2\na.c g : 1\nb.c f : 1\n");
    }

    #[test]
    fn test_domain_build_series() {
        let records = vec![
            record("w.rs", "withdraw", &[90.0]),
            record("w.rs", "withdraw", &[80.0, 1.0]),
            record("d.rs", "deposit", &[]),
        ];
        let stats = DomainStat::build(&records, &Domain::default(), StatConfig::default());

        let withdraw = stats.get("w.rs withdraw").and_then(Tally::as_series).unwrap();
        assert_eq!(withdraw.get(0).unwrap().mean(), 85.0);
        assert_eq!(withdraw.get(1).unwrap().num(), 1);

        let deposit = stats.get("d.rs deposit").and_then(Tally::as_series).unwrap();
        assert!(deposit.is_empty());
    }

    #[test]
    fn test_domain_snapshot_json() {
        let records = vec![record("a.c", "f", &[1.0])];
        let stats = DomainStat::build(&records, &Domain::default(), StatConfig::default());

        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["domain"], serde_json::json!(["file", "func"]));
        assert_eq!(json["groups"]["a.c f"]["series"][0]["num"], 1);
        assert_eq!(json["groups"]["a.c f"]["series"][0]["mean"], 1.0);
    }

    #[test]
    fn test_analyse_lines() {
        let lines = [
            "w.rs(withdraw:10):Balance after withdraw: 90 0xa",
            "w.rs(withdraw:10):Balance after withdraw: 70 0xa",
            "oops",
        ];
        let analysis = analyse_lines(&lines, &AnalysisConfig::default()).unwrap();
        assert_eq!(analysis.report.malformed, vec![3]);

        let series = analysis.stats.get("w.rs withdraw").and_then(Tally::as_series).unwrap();
        assert_eq!(series.get(0).unwrap().mean(), 80.0);
    }

    #[test]
    fn test_writer_output_feeds_analysis() {
        let logger = Logger::new(Vec::new());
        for balance in [90, 80, 70] {
            log_at!(logger, Level::INFO)
                .append("Balance after withdraw: ")
                .append(&balance);
        }
        let pattern = logger.inverse_pattern().unwrap();
        let text = String::from_utf8(logger.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        let report = Parser::new(pattern).parse_lines(&lines);
        assert!(report.malformed.is_empty());

        let domain = Domain::new(vec![Property::Func]);
        let stats = DomainStat::build(&report.records, &domain, StatConfig::default());
        let series = stats
            .get("test_writer_output_feeds_analysis")
            .and_then(Tally::as_series)
            .unwrap();
        assert_eq!(series.get(0).unwrap().num(), 3);
        assert_eq!(series.get(0).unwrap().mean(), 80.0);
    }

    proptest! {
        #[test]
        fn prop_finer_domain_refines_coarser(
            pairs in proptest::collection::vec((0usize..4, 0usize..4), 0..64),
        ) {
            let records: Vec<LogRecord> = pairs
                .iter()
                .map(|(file, func)| record(&format!("f{}.c", file), &format!("fn{}", func), &[]))
                .collect();

            let coarse = Domain::new(vec![Property::File]);
            let fine = Domain::new(vec![Property::File, Property::Func]);
            let coarse_counts = DomainStat::count(&records, &coarse);
            let fine_counts = DomainStat::count(&records, &fine);

            let mut parent: BTreeMap<String, String> = BTreeMap::new();
            for rec in &records {
                let previous = parent.insert(fine.key(rec), coarse.key(rec));
                if let Some(previous) = previous {
                    prop_assert_eq!(previous, coarse.key(rec));
                }
            }

            let mut summed: BTreeMap<String, u64> = BTreeMap::new();
            for (key, tally) in fine_counts.groups() {
                *summed.entry(parent[key].clone()).or_insert(0) += tally.as_count().unwrap();
            }
            for (key, tally) in coarse_counts.groups() {
                prop_assert_eq!(summed.get(key).copied(), tally.as_count());
            }
        }

        #[test]
        fn prop_stat_bounds_hold(values in proptest::collection::vec(-1.0e6f64..1.0e6, 1..100)) {
            let mut stat = Stat::default();
            values.iter().for_each(|v| stat.add(*v));

            prop_assert_eq!(stat.num(), values.len() as u64);
            prop_assert!(stat.min() <= stat.mean() + 1e-6);
            prop_assert!(stat.mean() <= stat.max() + 1e-6);
            prop_assert_eq!(stat.histogram().map(|(_, f)| f).sum::<u64>(), stat.num());
        }
    }
}

// ============================================================================
// SECTION 16: COMMAND LINE INTERFACE
// ============================================================================

/// Command line interface for the `lens` tool
#[derive(clap::Parser, Debug)]
#[command(
    name = "lens",
    author = "loglens developers",
    version,
    about = "Parse structured log output and report statistics per call site",
    long_about = "lens reads log files written by the loglens writer (or any format \
                  described by an extraction pattern), groups the lines by chosen \
                  properties and reports streaming statistics over the numbers \
                  found in each message."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "LOGLENS_CONFIG")]
    pub config: PathBuf,

    /// Override the diagnostics log level
    #[arg(short, long, env = "LOGLENS_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Aggregate a log file by domain and print statistics
    Analyse {
        /// Log file to read
        file: PathBuf,

        /// Properties to group by (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        group_by: Option<Vec<String>>,

        /// Histogram bucket width
        #[arg(short, long)]
        precision: Option<f64>,

        /// Count lines per group instead of collecting statistics
        #[arg(long)]
        count: bool,

        /// Output format (text, json)
        #[arg(short = 'o', long, default_value = "text")]
        output: String,
    },

    /// List the distinct code contexts in a log file
    States {
        /// Log file to read
        file: PathBuf,
    },

    /// Validate configuration file
    Validate {
        /// Show the effective configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (prints to stdout when absent)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

/// Handle the analyse command
fn handle_analyse(
    config: &LensConfig,
    file: &Path,
    group_by: Option<&[String]>,
    precision: Option<f64>,
    count: bool,
    output: &str,
) -> LensResult<()> {
    let mut analysis = config.analysis.clone();
    if let Some(group_by) = group_by {
        analysis.group_by = group_by.to_vec();
    }
    if let Some(precision) = precision {
        analysis.precision = precision;
    }
    analysis.validate()?;

    let Analysis { report, stats } = if count {
        let report = Parser::from_config(&analysis)?.read_file(file)?;
        let stats = DomainStat::count(&report.records, &analysis.domain()?);
        Analysis { report, stats }
    } else {
        analyse_file(file, &analysis)?
    };

    if !report.malformed.is_empty() {
        warn!(
            target: "loglens::analysis",
            skipped = report.malformed.len(),
            total = report.total_lines(),
            "Some lines did not match the extraction pattern"
        );
    }

    match output {
        "json" => println!("{}", serde_json::to_string_pretty(&stats.snapshot())?),
        _ => print!("{}", stats),
    }
    Ok(())
}

/// Handle the states command
fn handle_states(config: &LensConfig, file: &Path) -> LensResult<()> {
    let report = Parser::from_config(&config.analysis)?.read_file(file)?;
    for state in report.states() {
        println!("{}", state);
    }
    Ok(())
}

/// Handle the validate command
fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = LensConfig::load(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    println!("✅ Configuration is valid");

    if verbose {
        println!("\n📋 Configuration Summary:");
        println!("  Writer:");
        println!("    Threshold: {}", config.writer.threshold);
        println!("    Template: {}", config.writer.template);
        println!("    Emitters: {}", config.writer.emitters.join(", "));
        println!("    Trailing Hash: {}", config.writer.trailing_hash);
        println!("  Analysis:");
        println!("    Pattern: {}", config.analysis.pattern);
        println!("    Properties: {}", config.analysis.properties.join(", "));
        println!("    Group By: {}", config.analysis.group_by.join(", "));
        println!("    Precision: {}", config.analysis.precision);
        println!(
            "    Outliers: {} buckets / {} of observations",
            config.analysis.outlier_count, config.analysis.outlier_fraction
        );
        println!("  Logging:");
        println!("    Level: {}", config.logging.level);
        println!("    Format: {}", config.logging.format);
    }

    Ok(())
}

/// Handle the generate-config command
fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config = LensConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config)
                .with_context(|| format!("Failed to write config to {}", path.display()))?;
            println!("✅ Configuration written to: {}", path.display());
        }
        None => println!("{}", config),
    }

    Ok(())
}

/// Handle the version command
fn handle_version() {
    println!("🔎 {} v{}", LENS_FULL_NAME, LENS_VERSION);
    println!();
    println!("Build Information:");
    println!("  Package: {}", LENS_NAME);
    println!("  Default template: {}", DEFAULT_TEMPLATE);
    println!("  Default pattern: {}", DEFAULT_PATTERN);
}

// ============================================================================
// SECTION 17: MAIN ENTRY POINT
// ============================================================================

#[allow(dead_code)]
fn main() -> AnyhowResult<()> {
    let cli = <Cli as clap::Parser>::parse();

    match &cli.command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::GenerateConfig { output } => return handle_generate_config(output.as_deref()),
        Commands::Validate { verbose } => return handle_validate(&cli.config, *verbose),
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        LensConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        LensConfig::default()
    };

    let mut logging = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    init_logging(&logging)?;

    if !config_found {
        warn!(target: "loglens::init", path = %cli.config.display(), "Config file not found, using defaults");
    }

    match &cli.command {
        Commands::Analyse {
            file,
            group_by,
            precision,
            count,
            output,
        } => handle_analyse(&config, file, group_by.as_deref(), *precision, *count, output)?,
        Commands::States { file } => handle_states(&config, file)?,
        _ => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 18: CONFIGURATION & CLI TESTS
// ============================================================================

#[cfg(test)]
mod config_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        let config = LensConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.writer.template, DEFAULT_TEMPLATE);
        assert!(config.writer.trailing_hash);
        assert_eq!(config.analysis.group_by, vec!["file", "func"]);
    }

    #[test]
    fn test_config_from_str() {
        let config = LensConfig::from_str(
            r#"
            [writer]
            threshold = "warning"
            template = "[%] %"
            emitters = ["level", "message"]
            hash_mode = "content"

            [analysis]
            group_by = ["level"]
            precision = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.writer.hash_mode, HashMode::Content);
        assert_eq!(config.analysis.precision, 0.5);
        assert_eq!(config.analysis.outlier_count, DEFAULT_OUTLIER_COUNT);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_rejects_unknown_emitter() {
        let result = LensConfig::from_str("[writer]\nemitters = [\"colour\"]\n");
        assert!(matches!(result, Err(ConfigError::UnknownProperty { .. })));
    }

    #[test]
    fn test_config_rejects_bad_numbers() {
        let result = LensConfig::from_str("[analysis]\nprecision = 0.0\n");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result = LensConfig::from_str("[analysis]\noutlier_fraction = 1.5\n");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_config_rejects_group_mismatch() {
        let result = LensConfig::from_str("[analysis]\npattern = \"(.*)\"\nproperties = [\"file\", \"func\"]\n");
        assert!(matches!(result, Err(ConfigError::GroupCountMismatch { .. })));
    }

    #[test]
    fn test_config_load_missing_file() {
        let result = LensConfig::load("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_config_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loglens.toml");
        fs::write(&path, "[writer]\nthreshold = \"error\"\n").unwrap();

        let config = LensConfig::load(&path).unwrap();
        assert_eq!(Level::parse(&config.writer.threshold).unwrap(), Level::ERROR);
    }

    #[test]
    fn test_generated_config_round_trips() {
        let generated = LensConfig::generate_default_config();
        assert!(generated.contains("[writer]"));
        assert!(generated.contains("[analysis]"));

        let config = LensConfig::from_str(&generated).unwrap();
        assert_eq!(config.analysis.pattern, DEFAULT_PATTERN);
        assert_eq!(config.writer.emitters, DEFAULT_EMITTERS.to_vec());
    }

    #[test]
    fn test_error_categories() {
        let err = LensError::from(ParseError::malformed("x"));
        assert_eq!(err.category(), "parse");
        assert!(err.is_recoverable());

        let err = LensError::from(ConfigError::invalid_value("a", "b"));
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_cli_parses_analyse() {
        let cli = <Cli as clap::Parser>::try_parse_from([
            "lens",
            "analyse",
            "app.log",
            "--group-by",
            "file,line",
            "--count",
        ])
        .unwrap();

        match cli.command {
            Commands::Analyse { file, group_by, count, output, .. } => {
                assert_eq!(file, PathBuf::from("app.log"));
                assert_eq!(group_by, Some(vec!["file".to_string(), "line".to_string()]));
                assert!(count);
                assert_eq!(output, "text");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
