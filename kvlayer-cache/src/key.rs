//! Cache key derivation.
//!
//! A cached function is registered with a [`Signature`] naming its
//! parameters and a [`KeyPattern`]. Each call binds its [`Args`] against the
//! signature and derives the key from the bound values. The same arguments
//! always derive the same key, in every process.
//!
//! # Templates
//!
//! A template substitutes `{name}` with the bound value of parameter `name`
//! and `{0}`, `{1}`, ... with the parameter at that position. `{{` and `}}`
//! are literal braces. Placeholders are checked against the signature at
//! registration, so a typo fails early rather than producing a key that
//! never hits.
//!
//! Whitespace in a derived key is replaced with `_`; memcached keys cannot
//! contain it. An empty key means "do not cache this call".

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use kvlayer_core::{ConfigError, KvResult};

// ============================================================================
// ARGUMENT VALUES
// ============================================================================

/// A bound argument value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgValue {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl ArgValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

// Rendered the way keys written by older clients spell them.
impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {$(
        impl From<$t> for ArgValue {
            fn from(n: $t) -> Self {
                Self::Int(i64::from(n))
            }
        }
    )*};
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for ArgValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::None, Into::into)
    }
}

// ============================================================================
// SIGNATURE
// ============================================================================

/// A named parameter, optionally with a default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub default: Option<ArgValue>,
}

/// Parameters of a cached function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    function: String,
    params: Vec<Param>,
    variadic: bool,
}

impl Signature {
    pub fn new<I, S>(function: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            function: function.into(),
            params: params
                .into_iter()
                .map(|name| Param {
                    name: name.into(),
                    default: None,
                })
                .collect(),
            variadic: false,
        }
    }

    /// Give `name` a default, declaring it if the signature lacks it.
    pub fn with_default(mut self, name: &str, value: impl Into<ArgValue>) -> Self {
        let value = value.into();
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(param) => param.default = Some(value),
            None => self.params.push(Param {
                name: name.to_string(),
                default: Some(value),
            }),
        }
        self
    }

    /// Mark the function as taking a variable number of arguments.
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic
    }

    pub fn has(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    /// Bind call arguments: defaults first, then positional arguments by
    /// parameter order, then named arguments.
    pub fn bind(&self, args: &Args) -> Bound {
        let mut values = BTreeMap::new();
        for param in &self.params {
            if let Some(default) = &param.default {
                values.insert(param.name.clone(), default.clone());
            }
        }
        for (param, value) in self.params.iter().zip(&args.positional) {
            values.insert(param.name.clone(), value.clone());
        }
        for (name, value) in &args.named {
            values.insert(name.clone(), value.clone());
        }
        Bound {
            values,
            order: self.params.iter().map(|p| p.name.clone()).collect(),
        }
    }
}

// ============================================================================
// CALL ARGUMENTS
// ============================================================================

/// Arguments of one call to a cached function.
///
/// `force` is reserved: it bypasses the cache read for this call and never
/// takes part in key derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    positional: Vec<ArgValue>,
    named: BTreeMap<String, ArgValue>,
    force: bool,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn push(mut self, value: impl Into<ArgValue>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Bind a named argument.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn is_forced(&self) -> bool {
        self.force
    }
}

/// Arguments bound against a [`Signature`], as seen by the computation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bound {
    values: BTreeMap<String, ArgValue>,
    order: Vec<String>,
}

impl Bound {
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }

    /// Value of the parameter at `index` in signature order.
    pub fn at(&self, index: usize) -> Option<&ArgValue> {
        self.order.get(index).and_then(|name| self.values.get(name))
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ArgValue::as_int)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ArgValue::as_str)
    }

    /// A copy with `name` rebound to `value`.
    pub fn with(&self, name: &str, value: impl Into<ArgValue>) -> Self {
        let mut bound = self.clone();
        bound.values.insert(name.to_string(), value.into());
        bound
    }
}

// ============================================================================
// KEY PATTERNS
// ============================================================================

type KeyFn = Arc<dyn Fn(&Bound) -> Option<String> + Send + Sync>;

/// How a cache key is derived from bound arguments.
#[derive(Clone)]
pub enum KeyPattern {
    /// A template with `{name}` / `{index}` placeholders.
    Template(String),
    /// A function of the bound arguments; `None` skips caching.
    Func(KeyFn),
}

impl KeyPattern {
    pub fn func(f: impl Fn(&Bound) -> Option<String> + Send + Sync + 'static) -> Self {
        Self::Func(Arc::new(f))
    }
}

impl fmt::Debug for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Template(pattern) => f.debug_tuple("Template").field(pattern).finish(),
            Self::Func(_) => f.write_str("Func(..)"),
        }
    }
}

impl From<&str> for KeyPattern {
    fn from(pattern: &str) -> Self {
        Self::Template(pattern.to_string())
    }
}

impl From<String> for KeyPattern {
    fn from(pattern: String) -> Self {
        Self::Template(pattern)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Named(String),
    Index(usize),
}

fn invalid(pattern: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_template(pattern: &str, signature: &Signature) -> Result<Vec<Segment>, ConfigError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '}' => return Err(invalid(pattern, "unmatched '}'")),
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') | None => return Err(invalid(pattern, "unclosed '{'")),
                        Some(c) => name.push(c),
                    }
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(placeholder(pattern, &name, signature)?);
            }
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn placeholder(pattern: &str, name: &str, signature: &Signature) -> Result<Segment, ConfigError> {
    if name.is_empty() {
        return Err(invalid(pattern, "empty placeholder"));
    }
    let unknown = || ConfigError::UnknownPlaceholder {
        pattern: pattern.to_string(),
        placeholder: name.to_string(),
    };
    if name.bytes().all(|b| b.is_ascii_digit()) {
        let index: usize = name.parse().map_err(|_| unknown())?;
        if index >= signature.params().len() {
            return Err(unknown());
        }
        return Ok(Segment::Index(index));
    }
    if !signature.has(name) {
        return Err(unknown());
    }
    Ok(Segment::Named(name.to_string()))
}

#[derive(Clone)]
enum KeyKind {
    Template {
        pattern: String,
        segments: Vec<Segment>,
    },
    Func(KeyFn),
}

/// A key pattern validated against a signature.
#[derive(Clone)]
pub struct KeyGen {
    signature: Signature,
    kind: KeyKind,
}

impl KeyGen {
    /// Validate `pattern` against `signature`.
    ///
    /// Fails for variadic signatures, whose calls have no stable key, and for
    /// templates naming parameters the signature lacks.
    pub fn new(pattern: KeyPattern, signature: Signature) -> KvResult<Self> {
        if signature.is_variadic() {
            return Err(ConfigError::VariadicArguments {
                function: signature.function().to_string(),
            }
            .into());
        }
        let kind = match pattern {
            KeyPattern::Template(pattern) => {
                let segments = parse_template(&pattern, &signature)?;
                KeyKind::Template { pattern, segments }
            }
            KeyPattern::Func(f) => KeyKind::Func(f),
        };
        Ok(Self { signature, kind })
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Bind `args` and derive the key. The key is `None` when it comes out
    /// empty or references a parameter the call left unbound.
    pub fn derive(&self, args: &Args) -> (Option<String>, Bound) {
        let bound = self.signature.bind(args);
        let raw = match &self.kind {
            KeyKind::Template { segments, .. } => render(segments, &bound),
            KeyKind::Func(f) => f(&bound),
        };
        (raw.and_then(normalize), bound)
    }
}

impl fmt::Debug for KeyGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("KeyGen");
        s.field("function", &self.signature.function());
        match &self.kind {
            KeyKind::Template { pattern, .. } => s.field("pattern", pattern),
            KeyKind::Func(_) => s.field("pattern", &"<fn>"),
        };
        s.finish()
    }
}

fn render(segments: &[Segment], bound: &Bound) -> Option<String> {
    let mut key = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => key.push_str(text),
            Segment::Named(name) => key.push_str(&bound.get(name)?.to_string()),
            Segment::Index(index) => key.push_str(&bound.at(*index)?.to_string()),
        }
    }
    Some(key)
}

fn normalize(key: String) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    Some(
        key.chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlayer_core::KvError;

    fn feed() -> Signature {
        Signature::new("user_feed", ["user_id", "kind", "start", "limit"])
            .with_default("kind", "all")
            .with_default("start", 0)
    }

    #[test]
    fn test_named_and_indexed_placeholders() {
        let keygen = KeyGen::new("feed:{user_id}:{1}".into(), feed()).unwrap();
        let (key, bound) = keygen.derive(&Args::new().push(7).arg("limit", 20));
        assert_eq!(key.as_deref(), Some("feed:7:all"));
        assert_eq!(bound.int("start"), Some(0));
        assert_eq!(bound.int("limit"), Some(20));
    }

    #[test]
    fn test_named_arguments_override_defaults() {
        let keygen = KeyGen::new("feed:{user_id}:{kind}".into(), feed()).unwrap();
        let (key, _) = keygen.derive(&Args::new().arg("user_id", 7).arg("kind", "photo"));
        assert_eq!(key.as_deref(), Some("feed:7:photo"));
    }

    #[test]
    fn test_whitespace_is_replaced() {
        let keygen = KeyGen::new("q:{0}".into(), Signature::new("search", ["q"])).unwrap();
        let (key, _) = keygen.derive(&Args::new().push("hello big\tworld"));
        assert_eq!(key.as_deref(), Some("q:hello_big_world"));
    }

    #[test]
    fn test_force_is_not_part_of_key() {
        let keygen = KeyGen::new("feed:{user_id}".into(), feed()).unwrap();
        let (plain, _) = keygen.derive(&Args::new().push(1));
        let (forced, _) = keygen.derive(&Args::new().push(1).force(true));
        assert_eq!(plain, forced);
    }

    #[test]
    fn test_literal_braces_and_value_rendering() {
        let sig = Signature::new("f", ["a", "b", "c"]);
        let keygen = KeyGen::new("{{x}}:{a}:{b}:{c}".into(), sig).unwrap();
        let args = Args::new().push(true).push(None::<i64>).push(-3);
        let (key, _) = keygen.derive(&args);
        assert_eq!(key.as_deref(), Some("{x}:True:None:-3"));
    }

    #[test]
    fn test_unbound_parameter_yields_no_key() {
        let keygen = KeyGen::new("feed:{user_id}".into(), feed()).unwrap();
        let (key, _) = keygen.derive(&Args::new());
        assert_eq!(key, None);
    }

    #[test]
    fn test_func_pattern_and_empty_key() {
        let pattern = KeyPattern::func(|b| match b.int("user_id") {
            Some(0) => Some(String::new()),
            Some(id) => Some(format!("u:{id}")),
            None => None,
        });
        let keygen = KeyGen::new(pattern, feed()).unwrap();
        assert_eq!(keygen.derive(&Args::new().push(5)).0.as_deref(), Some("u:5"));
        assert_eq!(keygen.derive(&Args::new().push(0)).0, None);
    }

    #[test]
    fn test_variadic_rejected() {
        let err = KeyGen::new("x".into(), Signature::new("f", ["a"]).variadic()).unwrap_err();
        assert_eq!(
            err,
            KvError::Config(ConfigError::VariadicArguments {
                function: "f".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let err = KeyGen::new("feed:{uid}".into(), feed()).unwrap_err();
        assert!(matches!(
            err,
            KvError::Config(ConfigError::UnknownPlaceholder { ref placeholder, .. }) if placeholder == "uid"
        ));
        assert!(KeyGen::new("feed:{9}".into(), feed()).is_err());
    }

    #[test]
    fn test_malformed_templates_rejected() {
        for pattern in ["feed:{user_id", "feed:}", "feed:{}"] {
            let err = KeyGen::new(pattern.into(), feed()).unwrap_err();
            assert!(
                matches!(err, KvError::Config(ConfigError::InvalidPattern { .. })),
                "{pattern} should be rejected"
            );
        }
    }
}
