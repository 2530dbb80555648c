use std::sync::Arc;
use std::fmt;
use std::collections::BTreeMap;

use ecow::EcoString;

/// Name → value bindings, used for caller-supplied variables and scope frames.
pub type Vars = hashbrown::HashMap<EcoString, Value>;

/// A runtime value.
///
/// Lists and maps are reference counted and never mutated after construction,
/// so cloning a `Value` is cheap and values can be shared across concurrent runs.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undef,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(EcoString),
    /// Text that is already safe for HTML output and is never escaped again.
    Raw(EcoString),
    List(Arc<[Value]>),
    Map(Arc<BTreeMap<EcoString, Value>>),
    Macro(MacroRef),
}

/// A reference to a macro defined by a running program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MacroRef {
    /// Id of the program that defined the macro.
    pub program: u64,
    /// Index into the program's macro table.
    pub index: u32,
    pub name: EcoString,
    /// Frame the macro was defined in; macro calls parent their frame to it.
    pub closure: usize,
}

impl Value {
    pub fn str(s: impl Into<EcoString>) -> Self {
        Value::Str(s.into())
    }

    pub fn raw(s: impl Into<EcoString>) -> Self {
        Value::Raw(s.into())
    }

    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<EcoString>,
        V: Into<Value>,
    {
        Value::Map(Arc::new(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    /// Short name of the value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undef => "undef",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Raw(_) => "raw",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Macro(_) => "macro",
        }
    }

    pub fn is_undef(&self) -> bool {
        matches!(self, Value::Undef)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undef => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::Str(s) | Value::Raw(s) => !s.is_empty() && s.as_str() != "0",
            Value::List(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
            Value::Macro(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Raw(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Stringification used for output and concatenation.
    pub fn to_text(&self) -> EcoString {
        match self {
            Value::Str(s) | Value::Raw(s) => s.clone(),
            Value::Undef => EcoString::new(),
            other => ecow::eco_format!("{}", other),
        }
    }

    /// Text for an output write, HTML-escaped unless the value is already raw.
    pub fn to_output(&self, escape: bool) -> EcoString {
        match self {
            Value::Raw(s) => s.clone(),
            other if escape => {
                let text = other.to_text();
                if text.contains(['&', '<', '>', '"', '\'']) {
                    EcoString::from(html_escape::encode_quoted_attribute(text.as_str()).as_ref())
                } else {
                    text
                }
            }
            other => other.to_text(),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Loose equality: numeric across int/float, textual across str/raw,
    /// structural for collections. Values of unrelated kinds are never equal.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undef, Value::Undef) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                self.as_number() == other.as_number()
            }
            (Value::Str(a) | Value::Raw(a), Value::Str(b) | Value::Raw(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.loose_eq(vb))
            }
            (Value::Macro(a), Value::Macro(b)) => a == b,
            _ => false,
        }
    }

    /// Ordering for numbers and text; `None` for anything else.
    pub fn loose_cmp(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                self.as_number()?.partial_cmp(&other.as_number()?)
            }
            (Value::Str(a) | Value::Raw(a), Value::Str(b) | Value::Raw(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // Raw and plain text with the same content are different outputs.
            (Value::Str(_), Value::Raw(_)) | (Value::Raw(_), Value::Str(_)) => false,
            _ => self.loose_eq(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undef => write!(f, "undef"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => format_float(f, *x),
            Value::Str(s) => write!(f, "\"{}\"", escape_string(s)),
            Value::Raw(s) => write!(f, "raw\"{}\"", escape_string(s)),
            Value::List(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Map(entries) => f.debug_map().entries(entries.iter()).finish(),
            Value::Macro(m) => write!(f, "<macro {}>", m.name),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undef => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => format_float(f, *x),
            Value::Str(s) | Value::Raw(s) => f.write_str(s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Value::Macro(m) => write!(f, "<macro {}>", m.name),
        }
    }
}

fn format_float(f: &mut fmt::Formatter<'_>, value: f64) -> fmt::Result {
    if value.is_nan() {
        write!(f, "nan")
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            write!(f, "inf")
        } else {
            write!(f, "-inf")
        }
    } else {
        write!(f, "{}", value)
    }
}

fn escape_string(s: &str) -> String {
    s.chars()
        .flat_map(|c| match c {
            '"' => vec!['\\', '"'],
            '\\' => vec!['\\', '\\'],
            '\n' => vec!['\\', 'n'],
            '\r' => vec!['\\', 'r'],
            '\t' => vec!['\\', 't'],
            c if c.is_control() => format!("\\u{{{:04x}}}", c as u32).chars().collect(),
            c => vec![c],
        })
        .collect()
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s.into())
    }
}

impl From<EcoString> for Value {
    fn from(s: EcoString) -> Self {
        Value::Str(s)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(items: Vec<V>) -> Self {
        Value::list(items)
    }
}

impl<V: Into<Value>> From<Option<V>> for Value {
    fn from(value: Option<V>) -> Self {
        value.map_or(Value::Undef, Into::into)
    }
}
