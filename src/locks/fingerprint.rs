//! Promise model and runtime fingerprints.
//!
//! The fingerprint identifies one evaluation of a promise. It feeds both the
//! per-pass "already verified" cache and the lock name, so two promises with
//! the same content must always produce the same digest.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Salt that makes every promiser of a package list update share one lock.
pub const PACKAGE_LIST_UPDATE_SALT: &str = "packageuplist";

/// Attributes whose values change between runs without changing meaning.
/// Their names are still hashed, their values are not.
const VOLATILE_ATTRIBUTES: [&str; 7] = [
    "mtime",
    "atime",
    "ctime",
    "stime_range",
    "ttime_range",
    "log_string",
    "template_data",
];

/// Attributes left out of the promise type string.
const TYPE_STRING_EXCLUDED: [&str; 2] = ["args", "arglist"];

/// Only this many leading attributes are considered for the type string.
const TYPE_STRING_ATTRIBUTES: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMethod {
    /// Cryptographic digest.
    #[default]
    Blake3,
    /// Fast non-cryptographic 128-bit hash. Adequate for telling promises
    /// apart, but crafted collisions are cheap.
    Xxh3,
}

impl HashMethod {
    pub fn name(&self) -> &'static str {
        match self {
            HashMethod::Blake3 => "BLAKE3",
            HashMethod::Xxh3 => "XXH3",
        }
    }
}

/// Attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Rval {
    Scalar(String),
    List(Vec<Rval>),
    FnCall(FnCall),
    Container(Value),
}

impl From<&str> for Rval {
    fn from(s: &str) -> Self {
        Rval::Scalar(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnCall {
    pub name: String,
    pub args: Vec<Rval>,
}

impl FnCall {
    pub fn new(name: impl Into<String>, args: Vec<Rval>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub lval: String,
    pub rval: Rval,
}

impl Constraint {
    pub fn new(lval: impl Into<String>, rval: impl Into<Rval>) -> Self {
        Self {
            lval: lval.into(),
            rval: rval.into(),
        }
    }
}

/// The parts of a promise that identify it for locking.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Promise {
    pub promiser: String,
    pub comment: Option<String>,
    pub promise_type: String,
    pub namespace: Option<String>,
    pub bundle: String,
    pub constraints: Vec<Constraint>,
}

impl Promise {
    pub fn new(
        promise_type: impl Into<String>,
        bundle: impl Into<String>,
        promiser: impl Into<String>,
    ) -> Self {
        Self {
            promiser: promiser.into(),
            promise_type: promise_type.into(),
            bundle: bundle.into(),
            ..Default::default()
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_constraint(mut self, lval: impl Into<String>, rval: impl Into<Rval>) -> Self {
        self.constraints.push(Constraint::new(lval, rval));
        self
    }

    /// `<type>.` followed by the names of the first few attributes.
    pub fn type_string(&self) -> String {
        let mut out = format!("{}.", self.promise_type);
        for constraint in self.constraints.iter().take(TYPE_STRING_ATTRIBUTES) {
            if TYPE_STRING_EXCLUDED.contains(&constraint.lval.as_str()) {
                continue;
            }
            out.push_str(&constraint.lval);
            out.push('.');
        }
        out
    }
}

/// Raw fingerprint bytes plus the method that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    method: HashMethod,
    bytes: Vec<u8>,
}

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn method(&self) -> HashMethod {
        self.method
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.method.name(), hex::encode(&self.bytes))
    }
}

enum Digest {
    Blake3(Box<blake3::Hasher>),
    Xxh3(Box<xxhash_rust::xxh3::Xxh3>),
    /// Keeps the fed fields verbatim, for ordering values.
    Record(Vec<u8>),
}

impl Digest {
    fn new(method: HashMethod) -> Self {
        match method {
            HashMethod::Blake3 => Digest::Blake3(Box::new(blake3::Hasher::new())),
            HashMethod::Xxh3 => Digest::Xxh3(Box::new(xxhash_rust::xxh3::Xxh3::new())),
        }
    }

    /// Feed one field. Fields are NUL-terminated so adjacent fields cannot
    /// trade bytes and still collide.
    fn field(&mut self, data: &[u8]) {
        match self {
            Digest::Blake3(h) => {
                h.update(data);
                h.update(&[0]);
            }
            Digest::Xxh3(h) => {
                h.update(data);
                h.update(&[0]);
            }
            Digest::Record(buf) => {
                buf.extend_from_slice(data);
                buf.push(0);
            }
        }
    }

    fn finish(self) -> Vec<u8> {
        match self {
            Digest::Blake3(h) => h.finalize().as_bytes().to_vec(),
            Digest::Xxh3(h) => h.digest128().to_be_bytes().to_vec(),
            Digest::Record(buf) => buf,
        }
    }
}

/// Digest of a promise's runtime identity, salted by `salt`.
///
/// Attribute order does not matter. Function calls contribute their name and
/// direct arguments only; nested calls contribute just their name.
pub fn promise_runtime_hash(promise: &Promise, salt: Option<&str>, method: HashMethod) -> Fingerprint {
    let mut digest = Digest::new(method);

    if salt != Some(PACKAGE_LIST_UPDATE_SALT) {
        digest.field(promise.promiser.as_bytes());
    }
    if let Some(comment) = &promise.comment {
        digest.field(comment.as_bytes());
    }
    if let Some(ns) = &promise.namespace {
        digest.field(ns.as_bytes());
    }
    digest.field(promise.bundle.as_bytes());
    if let Some(salt) = salt {
        digest.field(salt.as_bytes());
    }

    // Repeated lvals are ordered by value so insertion order never matters
    let mut constraints: Vec<(&Constraint, Vec<u8>)> = promise
        .constraints
        .iter()
        .map(|c| (c, canonical_value(c)))
        .collect();
    constraints.sort_by(|a, b| a.0.lval.cmp(&b.0.lval).then_with(|| a.1.cmp(&b.1)));

    for (constraint, _) in constraints {
        digest.field(constraint.lval.as_bytes());
        if VOLATILE_ATTRIBUTES.contains(&constraint.lval.as_str()) {
            continue;
        }
        hash_rval(&mut digest, &constraint.rval);
    }

    Fingerprint {
        method,
        bytes: digest.finish(),
    }
}

/// The bytes a constraint's value contributes; empty for volatile attributes.
fn canonical_value(constraint: &Constraint) -> Vec<u8> {
    if VOLATILE_ATTRIBUTES.contains(&constraint.lval.as_str()) {
        return Vec::new();
    }
    let mut record = Digest::Record(Vec::new());
    hash_rval(&mut record, &constraint.rval);
    record.finish()
}

fn hash_rval(digest: &mut Digest, rval: &Rval) {
    match rval {
        Rval::Scalar(s) => digest.field(s.as_bytes()),
        Rval::List(items) => {
            for item in items {
                hash_rval(digest, item);
            }
        }
        Rval::FnCall(call) => {
            digest.field(call.name.as_bytes());
            for arg in &call.args {
                match arg {
                    Rval::FnCall(inner) => digest.field(inner.name.as_bytes()),
                    other => hash_rval(digest, other),
                }
            }
        }
        Rval::Container(value) => {
            let mut canonical = String::new();
            write_canonical(value, &mut canonical);
            digest.field(canonical.as_bytes());
        }
    }
}

/// Compact JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Promise {
        Promise::new("files", "main", "/etc/motd")
            .with_comment("message of the day")
            .with_constraint("create", "true")
            .with_constraint("perms", Rval::FnCall(FnCall::new("m", vec!["644".into()])))
    }

    #[test]
    fn test_deterministic() {
        for method in [HashMethod::Blake3, HashMethod::Xxh3] {
            let a = promise_runtime_hash(&sample(), Some("op"), method);
            let b = promise_runtime_hash(&sample(), Some("op"), method);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_attribute_order_ignored() {
        let reordered = Promise::new("files", "main", "/etc/motd")
            .with_comment("message of the day")
            .with_constraint("perms", Rval::FnCall(FnCall::new("m", vec!["644".into()])))
            .with_constraint("create", "true");
        assert_eq!(
            promise_runtime_hash(&sample(), None, HashMethod::Blake3),
            promise_runtime_hash(&reordered, None, HashMethod::Blake3)
        );
    }

    #[test]
    fn test_repeated_attribute_order_ignored() {
        let a = Promise::new("commands", "main", "/bin/run")
            .with_constraint("classes", "first")
            .with_constraint("classes", "second");
        let b = Promise::new("commands", "main", "/bin/run")
            .with_constraint("classes", "second")
            .with_constraint("classes", "first");
        for method in [HashMethod::Blake3, HashMethod::Xxh3] {
            assert_eq!(
                promise_runtime_hash(&a, None, method),
                promise_runtime_hash(&b, None, method)
            );
        }
    }

    #[test]
    fn test_salts_differ() {
        let a = promise_runtime_hash(&sample(), Some("one"), HashMethod::Blake3);
        let b = promise_runtime_hash(&sample(), Some("two"), HashMethod::Blake3);
        let none = promise_runtime_hash(&sample(), None, HashMethod::Blake3);
        assert_ne!(a, b);
        assert_ne!(a, none);
    }

    #[test]
    fn test_package_salt_ignores_promiser() {
        let other = Promise {
            promiser: "/etc/issue".to_string(),
            ..sample()
        };
        let salt = Some(PACKAGE_LIST_UPDATE_SALT);
        assert_eq!(
            promise_runtime_hash(&sample(), salt, HashMethod::Blake3),
            promise_runtime_hash(&other, salt, HashMethod::Blake3)
        );
        assert_ne!(
            promise_runtime_hash(&sample(), Some("x"), HashMethod::Blake3),
            promise_runtime_hash(&other, Some("x"), HashMethod::Blake3)
        );
    }

    #[test]
    fn test_volatile_values_ignored() {
        let a = sample().with_constraint("mtime", "1700000000");
        let b = sample().with_constraint("mtime", "1800000000");
        let without = sample();
        assert_eq!(
            promise_runtime_hash(&a, None, HashMethod::Blake3),
            promise_runtime_hash(&b, None, HashMethod::Blake3)
        );
        // The attribute name still counts
        assert_ne!(
            promise_runtime_hash(&a, None, HashMethod::Blake3),
            promise_runtime_hash(&without, None, HashMethod::Blake3)
        );
    }

    #[test]
    fn test_nested_fncall_hashes_name_only() {
        let inner_a = Rval::FnCall(FnCall::new("getenv", vec!["HOME".into()]));
        let inner_b = Rval::FnCall(FnCall::new("getenv", vec!["PATH".into()]));
        let a = sample().with_constraint("x", Rval::FnCall(FnCall::new("f", vec![inner_a])));
        let b = sample().with_constraint("x", Rval::FnCall(FnCall::new("f", vec![inner_b])));
        assert_eq!(
            promise_runtime_hash(&a, None, HashMethod::Blake3),
            promise_runtime_hash(&b, None, HashMethod::Blake3)
        );
    }

    #[test]
    fn test_container_key_order_ignored() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": [1, 2], "x": null}}"#).unwrap();
        let b = json!({"a": {"x": null, "y": [1, 2]}, "b": 1});
        let pa = sample().with_constraint("data", Rval::Container(a));
        let pb = sample().with_constraint("data", Rval::Container(b));
        assert_eq!(
            promise_runtime_hash(&pa, None, HashMethod::Xxh3),
            promise_runtime_hash(&pb, None, HashMethod::Xxh3)
        );
    }

    #[test]
    fn test_field_boundaries() {
        let a = Promise::new("files", "main", "ab").with_comment("c");
        let b = Promise::new("files", "main", "a").with_comment("bc");
        assert_ne!(
            promise_runtime_hash(&a, None, HashMethod::Blake3),
            promise_runtime_hash(&b, None, HashMethod::Blake3)
        );
    }

    #[test]
    fn test_display() {
        let fp = promise_runtime_hash(&sample(), None, HashMethod::Blake3);
        let printed = fp.to_string();
        assert!(printed.starts_with("BLAKE3="));
        assert_eq!(printed.len(), "BLAKE3=".len() + 64);
        let xxh = promise_runtime_hash(&sample(), None, HashMethod::Xxh3).to_string();
        assert_eq!(xxh.len(), "XXH3=".len() + 32);
    }

    #[test]
    fn test_type_string() {
        let promise = Promise::new("commands", "main", "/bin/true")
            .with_constraint("args", "-x")
            .with_constraint("contain", "c")
            .with_constraint("arglist", "y")
            .with_constraint("ifelapsed", "5")
            .with_constraint("module", "false")
            .with_constraint("handle", "h");
        // Excluded names still use up one of the five slots
        assert_eq!(promise.type_string(), "commands.contain.ifelapsed.module.");
    }
}
