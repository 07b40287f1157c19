//! Union maps: `union:/dir1:/dir2:...`.
//!
//! Every name found in any of the directories becomes a link into the
//! directory that holds it; later directories take precedence. Unknown
//! names resolve to the last directory.

use {
    super::{CacheMode, Lookup, MapBackend, MapKind, Mtime},
    crate::{error::errno_from_ioerror, utils::strsplit},
    log::warn,
    nix::errno::Errno,
    std::fs,
};

pub const UNION_PREFIX: &str = "union:";

const UNION_DEFAULTS: &str = "type:=link;opts:=nounmount;sublink:=${key}";

#[derive(Debug, Default)]
pub struct UnionMap;

fn dirs(map: &str) -> Vec<String> {
    map.strip_prefix(UNION_PREFIX)
        .map(|d| strsplit(d, ':'))
        .unwrap_or_default()
}

impl MapBackend for UnionMap {
    fn kind(&self) -> MapKind {
        MapKind::Union
    }

    fn default_mode(&self) -> CacheMode {
        CacheMode::All
    }

    fn init(&self, map: &str) -> Result<Mtime, Errno> {
        if map.starts_with(UNION_PREFIX) && !dirs(map).is_empty() {
            Ok(0)
        } else {
            Err(Errno::ENOENT)
        }
    }

    fn search(&self, map: &str, _key: &str, _modify: &mut Mtime) -> Lookup {
        match dirs(map).last() {
            Some(dir) => Lookup::Found(format!("fs:={}", dir)),
            None => Lookup::Failed(Errno::ENOENT),
        }
    }

    fn reload(&self, map: &str, add: &mut dyn FnMut(&str, &str)) -> Option<Result<(), Errno>> {
        let dirs = dirs(map);
        add("/defaults", UNION_DEFAULTS);
        for dir in &dirs {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("union map {}: {}: {}", map, dir, e);
                    return Some(Err(errno_from_ioerror(&e)));
                }
            };
            let val = format!("fs:={}", dir);
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    add(name, &val);
                }
            }
        }
        if let Some(last) = dirs.last() {
            add("*", &format!("fs:={}", last));
        }
        Some(Ok(()))
    }

    fn mtime(&self, _map: &str) -> Result<Mtime, Errno> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn later_directories_win() {
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();
        fs::write(d1.path().join("common"), b"").unwrap();
        fs::write(d1.path().join("only1"), b"").unwrap();
        fs::create_dir(d2.path().join("common")).unwrap();

        let p1 = d1.path().to_str().unwrap();
        let p2 = d2.path().to_str().unwrap();
        let map = format!("union:{}:{}", p1, p2);
        assert_eq!(UnionMap.init(&map), Ok(0));

        let mut kv = HashMap::new();
        UnionMap
            .reload(&map, &mut |k: &str, v: &str| {
                kv.insert(k.to_owned(), v.to_owned());
            })
            .unwrap()
            .unwrap();

        assert_eq!(kv["/defaults"], UNION_DEFAULTS);
        assert_eq!(kv["only1"], format!("fs:={}", p1));
        assert_eq!(kv["common"], format!("fs:={}", p2));
        assert_eq!(kv["*"], format!("fs:={}", p2));

        let mut t = 0;
        assert_eq!(
            UnionMap.search(&map, "anything", &mut t),
            Lookup::Found(format!("fs:={}", p2))
        );
    }

    #[test]
    fn plain_names_are_not_unions() {
        assert_eq!(UnionMap.init("/etc/amd.union"), Err(Errno::ENOENT));
        assert_eq!(UnionMap.init("union:"), Err(Errno::ENOENT));
    }
}
