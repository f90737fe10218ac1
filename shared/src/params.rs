//! Ordered `key value...` parameter files.
//!
//! The simulation programs read and write plain text files where each line is a
//! key followed by whitespace separated value tokens. [`ParameterSet`] keeps the
//! keys in first-insertion order and coerces each raw value into a [`ParamValue`]
//! the same way every time: integer, then float, then the `T`/`F` boolean
//! literals, then a quote-stripped string. The first parse that succeeds wins.
//!
//! Reading several files into the same set merges them; a key that appears again
//! keeps its original position but takes the newest value.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised while reading or writing parameter files.
#[derive(Debug, Error)]
pub enum ParamError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} exists already", .0.display())]
    AlreadyExists(PathBuf),
}

/// A coerced parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

type Coercion = fn(&str) -> Option<ParamValue>;

fn parse_int(raw: &str) -> Option<ParamValue> {
    raw.trim().parse::<i64>().ok().map(ParamValue::Int)
}

fn parse_float(raw: &str) -> Option<ParamValue> {
    raw.trim().parse::<f64>().ok().map(ParamValue::Float)
}

fn parse_bool(raw: &str) -> Option<ParamValue> {
    match raw.trim() {
        "T" => Some(ParamValue::Bool(true)),
        "F" => Some(ParamValue::Bool(false)),
        _ => None,
    }
}

/// Parse attempts in priority order. Strings are the fallback.
const COERCIONS: [Coercion; 3] = [parse_int, parse_float, parse_bool];

impl ParamValue {
    /// Coerce a raw value string, first successful parse wins.
    pub fn coerce(raw: &str) -> Self {
        COERCIONS
            .iter()
            .find_map(|attempt| attempt(raw))
            .unwrap_or_else(|| ParamValue::Str(raw.trim_matches('\'').to_string()))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of the value; integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// True for on/off switches set to one (`1`, `1.0` or `T`).
    pub fn is_switched_on(&self) -> bool {
        match self {
            ParamValue::Bool(b) => *b,
            other => other.as_f64() == Some(1.0),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            // Debug keeps a fractional part ("30.0") so the value reads back as a float
            ParamValue::Float(v) => write!(f, "{v:?}"),
            ParamValue::Bool(true) => write!(f, "T"),
            ParamValue::Bool(false) => write!(f, "F"),
            ParamValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// How [`ParameterSet::write`] treats an existing destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Clobber,
    NoClobber,
}

/// Insertion ordered map of parameter names to coerced values.
///
/// Not synchronised; share it by cloning rather than across threads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    entries: Vec<(String, ParamValue)>,
    index: HashMap<String, usize>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a single file into a fresh set.
    pub fn from_file(path: &Path) -> Result<Self, ParamError> {
        let mut params = Self::new();
        params.read(path)?;
        Ok(params)
    }

    /// Insert or overwrite a value. Overwriting keeps the key's position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        let key = key.into();
        let value = value.into();
        match self.index.get(&key) {
            Some(&slot) => self.entries[slot].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.index.get(key).map(|&slot| &self.entries[slot].1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge `key value...` lines. Blank lines and `#` comments are skipped.
    pub fn merge_lines<'a>(&mut self, lines: impl IntoIterator<Item = &'a str>) {
        for line in lines {
            if let Some((key, raw)) = split_param_line(line) {
                self.insert(key, ParamValue::coerce(&raw));
            }
        }
    }

    /// Merge another set into this one, later values win.
    pub fn merge(&mut self, other: &ParameterSet) {
        for (key, value) in other.iter() {
            self.insert(key, value.clone());
        }
    }

    /// Merge the contents of a parameter file into the set.
    pub fn read(&mut self, path: &Path) -> Result<(), ParamError> {
        let text = std::fs::read_to_string(path).map_err(|source| ParamError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.merge_lines(text.lines());
        Ok(())
    }

    /// Render as `key value` lines in insertion order.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out
    }

    /// Write the set to `path`.
    ///
    /// The file is staged next to its destination and renamed into place, so
    /// readers never observe a partially written file.
    pub fn write(&self, path: &Path, mode: WriteMode) -> Result<(), ParamError> {
        if mode == WriteMode::NoClobber && path.exists() {
            return Err(ParamError::AlreadyExists(path.to_path_buf()));
        }
        write_atomic(path, self.to_text().as_bytes())
    }
}

/// Split a parameter line into its key and the space-joined value tokens.
pub fn split_param_line(line: &str) -> Option<(&str, String)> {
    let mut tokens = line.split_whitespace();
    let key = tokens.next()?;
    if key.starts_with('#') {
        return None;
    }
    Some((key, tokens.collect::<Vec<_>>().join(" ")))
}

/// Write `contents` to `path` through a temporary file in the same directory.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ParamError> {
    let io_err = |source| ParamError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    staged.write_all(contents).map_err(io_err)?;
    staged.flush().map_err(io_err)?;
    staged.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
