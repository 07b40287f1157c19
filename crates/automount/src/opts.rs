//! Mount-specification parsing.
//!
//! A map entry is a whitespace separated list of locations. A location
//! starting with `-` replaces the defaults for the locations after it;
//! every other location is a `;` separated list of `name:=value` options
//! and `name==value` / `name!=value` selectors. Selectors that do not hold
//! disqualify the location.
//!
//! Values may reference `${var}`, where `var` is either a selector
//! variable (`key`, `map`, `host`, ...) or an option set for the same
//! location. `${/var}` expands to the last path component of the value
//! and `${var/}` to everything before it.

use {
    crate::utils::{strsplit, unquote},
    log::{debug, warn},
};

/// Options of one location after evaluation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsOpts {
    pub fstype: Option<String>,
    pub rhost: Option<String>,
    pub rfs: Option<String>,
    pub fs: Option<String>,
    pub opts: Option<String>,
    pub remopts: Option<String>,
    pub sublink: Option<String>,
    pub cache: Option<String>,
    pub pref: Option<String>,
    pub delay: u32,
}

/// Selector variables describing the lookup being evaluated.
#[derive(Clone, Debug, Default)]
pub struct OptsEnv {
    pub key: String,
    pub map: String,
    pub path: String,
    pub autodir: String,
    pub host: String,
    pub domain: String,
    pub arch: String,
    pub os: String,
}

impl OptsEnv {
    fn selector(&self, name: &str) -> Option<String> {
        let v = match name {
            "key" => &self.key,
            "map" => &self.map,
            "path" => &self.path,
            "autodir" => &self.autodir,
            "host" => &self.host,
            "domain" => &self.domain,
            "arch" | "karch" => &self.arch,
            "os" => &self.os,
            "hostd" => {
                return Some(if self.domain.is_empty() {
                    self.host.clone()
                } else {
                    format!("{}.{}", self.host, self.domain)
                });
            }
            _ => return None,
        };
        Some(v.clone())
    }
}

impl FsOpts {
    fn slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        Some(match name {
            "type" => &mut self.fstype,
            "rhost" => &mut self.rhost,
            "rfs" => &mut self.rfs,
            "fs" => &mut self.fs,
            "opts" => &mut self.opts,
            "remopts" => &mut self.remopts,
            "sublink" => &mut self.sublink,
            "cache" => &mut self.cache,
            "pref" => &mut self.pref,
            _ => return None,
        })
    }

    fn value(&self, name: &str) -> Option<&str> {
        match name {
            "type" => self.fstype.as_deref(),
            "rhost" => self.rhost.as_deref(),
            "rfs" => self.rfs.as_deref(),
            "fs" => self.fs.as_deref(),
            "opts" => self.opts.as_deref(),
            "remopts" => self.remopts.as_deref(),
            "sublink" => self.sublink.as_deref(),
            "cache" => self.cache.as_deref(),
            "pref" => self.pref.as_deref(),
            _ => None,
        }
    }
}

/// Split an entry into `(defaults, location)` pairs.
///
/// `dflts` is the map's `/defaults` entry, if any.
pub fn locations(dflts: Option<&str>, entry: &str) -> Vec<(String, String)> {
    let mut current = dflts
        .map(|d| d.trim().trim_start_matches('-').to_owned())
        .unwrap_or_default();
    let mut out = Vec::new();
    let mut pending_default = false;

    for word in strsplit(entry, ' ') {
        if let Some(d) = word.strip_prefix('-') {
            current = d.to_owned();
            pending_default = true;
            continue;
        }
        out.push((current.clone(), word));
        pending_default = false;
    }
    // An entry consisting only of defaults still describes one location
    if out.is_empty() && pending_default {
        out.push((current, String::new()));
    }
    out
}

enum Clause<'a> {
    Set(&'a str, &'a str),
    Eq(&'a str, &'a str),
    Ne(&'a str, &'a str),
}

fn clause(s: &str) -> Option<Clause<'_>> {
    if let Some((n, v)) = s.split_once(":=") {
        return Some(Clause::Set(n.trim(), unquote(v.trim())));
    }
    if let Some((n, v)) = s.split_once("==") {
        return Some(Clause::Eq(n.trim(), unquote(v.trim())));
    }
    if let Some((n, v)) = s.split_once("!=") {
        return Some(Clause::Ne(n.trim(), unquote(v.trim())));
    }
    None
}

/// Apply one `;` list to `fo`. Returns false if a selector fails.
fn eval_opts(fo: &mut FsOpts, env: &OptsEnv, list: &str) -> bool {
    for item in strsplit(list, ';') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match clause(item) {
            Some(Clause::Set("delay", v)) => fo.delay = v.parse().unwrap_or(0),
            Some(Clause::Set(name, v)) => match fo.slot(name) {
                Some(slot) => *slot = Some(v.to_owned()),
                None => warn!("key {}: Unrecognised file system option \"{}\"", env.key, name),
            },
            Some(Clause::Eq(name, v)) => {
                if !selector_holds(env, name, v, true) {
                    return false;
                }
            }
            Some(Clause::Ne(name, v)) => {
                if !selector_holds(env, name, v, false) {
                    return false;
                }
            }
            None => warn!("key {}: Can't parse \"{}\"", env.key, item),
        }
    }
    true
}

fn selector_holds(env: &OptsEnv, name: &str, value: &str, equal: bool) -> bool {
    let Some(actual) = env.selector(name) else {
        warn!("key {}: Unrecognised selector \"{}\"", env.key, name);
        return false;
    };
    if (actual == value) != equal {
        debug!("key {}: selector {} does not match", env.key, name);
        return false;
    }
    true
}

const MAX_EXPAND_DEPTH: usize = 4;

fn lookup_var(name: &str, fo: &FsOpts, env: &OptsEnv, depth: usize) -> String {
    let (name, part) = if let Some(n) = name.strip_prefix('/') {
        (n, Some(true))
    } else if let Some(n) = name.strip_suffix('/') {
        (n, Some(false))
    } else {
        (name, None)
    };

    let raw = match fo.value(name) {
        Some(v) => v.to_owned(),
        None => match env.selector(name) {
            Some(v) => v,
            None => {
                warn!("key {}: Unknown variable \"{}\"", env.key, name);
                String::new()
            }
        },
    };
    let value = if raw.contains("${") && depth < MAX_EXPAND_DEPTH {
        expand_depth(&raw, fo, env, depth + 1)
    } else {
        raw
    };

    match part {
        // ${/var}: last component
        Some(true) => match value.rfind('/') {
            Some(i) => value[i + 1..].to_owned(),
            None => value,
        },
        // ${var/}: everything before the last component
        Some(false) => match value.rfind('/') {
            Some(0) => "/".to_owned(),
            Some(i) => value[..i].to_owned(),
            None => String::new(),
        },
        None => value,
    }
}

fn expand_depth(s: &str, fo: &FsOpts, env: &OptsEnv, depth: usize) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&lookup_var(&after[..end], fo, env, depth));
                rest = &after[end + 1..];
            }
            None => {
                warn!("key {}: unterminated variable in \"{}\"", env.key, s);
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand `${var}` references in `s`.
pub fn expand(s: &str, fo: &FsOpts, env: &OptsEnv) -> String {
    expand_depth(s, fo, env, 0)
}

/// Evaluate one location against its defaults.
///
/// Returns `None` when a selector rules the location out.
pub fn eval_fs_opts(env: &OptsEnv, dflts: &str, location: &str) -> Option<FsOpts> {
    let mut fo = FsOpts::default();
    if !eval_opts(&mut fo, env, dflts) || !eval_opts(&mut fo, env, location) {
        return None;
    }

    if fo.fs.is_none() && fo.rhost.is_some() {
        fo.fs = Some("${autodir}/${rhost}${rfs}".to_owned());
    }

    // Each value sees the already expanded values before it
    let raw = fo.clone();
    for name in [
        "type", "rhost", "rfs", "fs", "opts", "remopts", "sublink", "cache", "pref",
    ] {
        let Some(v) = raw.value(name) else { continue };
        let expanded = expand(v, &fo, env);
        if let Some(slot) = fo.slot(name) {
            *slot = Some(expanded);
        }
    }
    Some(fo)
}

/// Does the comma separated mount option list contain `opt`?
pub fn has_opt(opts: &str, opt: &str) -> bool {
    opts.split(',').any(|o| {
        let o = o.trim();
        o == opt || o.split_once('=').is_some_and(|(n, _)| n == opt)
    })
}

/// Value of `opt=value` in a comma separated mount option list.
pub fn opt_value<'a>(opts: &'a str, opt: &str) -> Option<&'a str> {
    opts.split(',')
        .filter_map(|o| o.trim().split_once('='))
        .find(|(n, _)| *n == opt)
        .map(|(_, v)| v)
}
