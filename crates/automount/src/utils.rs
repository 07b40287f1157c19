use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split `s` on `sep`, ignoring separators inside double quotes.
///
/// Quotes are kept in the output; empty fields are dropped. `sep == ' '`
/// splits on any run of whitespace.
pub fn strsplit(s: &str, sep: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;

    let is_sep = |c: char| {
        if sep == ' ' {
            c.is_ascii_whitespace()
        } else {
            c == sep
        }
    };

    for c in s.chars() {
        if c == '"' {
            quoted = !quoted;
            cur.push(c);
        } else if !quoted && is_sep(c) {
            if !cur.is_empty() {
                out.push(std::mem::take(&mut cur));
            }
        } else {
            cur.push(c);
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }

    out
}

/// Strip one level of surrounding double quotes.
pub fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

#[test]
fn strsplit_respects_quotes() {
    assert_eq!(
        strsplit("type:=link;fs:=\"a;b\";opts:=ro", ';'),
        vec!["type:=link", "fs:=\"a;b\"", "opts:=ro"]
    );
    assert_eq!(strsplit("  a   b\tc ", ' '), vec!["a", "b", "c"]);
    assert_eq!(unquote("\"root\""), "root");
}
