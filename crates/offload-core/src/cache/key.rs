//! キャッシュキーの合成
//!
//! 各パートを文字列にして `:` でつなぐ。文字列パート内の `\`、`:`、先頭の `~`
//! はエスケープするので、`["a:b"]` と `["a", "b"]` は別のキーになり、リテラルの
//! `"~"` が absent パートと読まれることもない。

/// One component of a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPart<'a> {
    Str(&'a str),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Absent,
}

pub const SEPARATOR: char = ':';
const ABSENT: &str = "~";

/// Compose `parts`, in order, into one key.
pub fn make_key(parts: &[KeyPart<'_>]) -> String {
    let mut key = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(SEPARATOR);
        }
        match part {
            KeyPart::Str(s) => push_escaped(&mut key, s),
            KeyPart::Int(n) => key.push_str(&n.to_string()),
            KeyPart::UInt(n) => key.push_str(&n.to_string()),
            KeyPart::Bool(b) => key.push_str(if *b { "true" } else { "false" }),
            KeyPart::Absent => key.push_str(ABSENT),
        }
    }
    key
}

fn push_escaped(key: &mut String, s: &str) {
    if s.starts_with('~') {
        key.push('\\');
    }
    for c in s.chars() {
        if c == '\\' || c == SEPARATOR {
            key.push('\\');
        }
        key.push(c);
    }
}

impl<'a> From<&'a str> for KeyPart<'a> {
    fn from(s: &'a str) -> Self {
        KeyPart::Str(s)
    }
}

impl<'a> From<&'a String> for KeyPart<'a> {
    fn from(s: &'a String) -> Self {
        KeyPart::Str(s.as_str())
    }
}

impl From<bool> for KeyPart<'_> {
    fn from(b: bool) -> Self {
        KeyPart::Bool(b)
    }
}

macro_rules! signed_parts {
    ($($t:ty),*) => {$(
        impl From<$t> for KeyPart<'_> {
            fn from(n: $t) -> Self {
                KeyPart::Int(i64::from(n))
            }
        }
    )*};
}

macro_rules! unsigned_parts {
    ($($t:ty),*) => {$(
        impl From<$t> for KeyPart<'_> {
            fn from(n: $t) -> Self {
                KeyPart::UInt(u64::from(n))
            }
        }
    )*};
}

signed_parts!(i8, i16, i32, i64);
unsigned_parts!(u8, u16, u32, u64);

impl From<usize> for KeyPart<'_> {
    fn from(n: usize) -> Self {
        KeyPart::UInt(n as u64)
    }
}

impl<'a, T: Into<KeyPart<'a>>> From<Option<T>> for KeyPart<'a> {
    fn from(part: Option<T>) -> Self {
        part.map_or(KeyPart::Absent, Into::into)
    }
}

/// `cache_key!("vt", "sha256", digest)` - `make_key` over mixed literals.
#[macro_export]
macro_rules! cache_key {
    ($($part:expr),+ $(,)?) => {
        $crate::cache::make_key(&[$($crate::cache::KeyPart::from($part)),+])
    };
}
