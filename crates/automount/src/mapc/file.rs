//! Flat file maps.
//!
//! One entry per line: a key, whitespace, then the value. A backslash at
//! the end of a line continues the entry on the next one and `#` starts a
//! comment. Include lines (`+map`) are not supported.

use {
    super::{CacheMode, Lookup, MapBackend, MapKind, Mtime},
    filetime::FileTime,
    log::{debug, warn},
    nix::errno::Errno,
    std::{
        fs,
        io::{BufRead, BufReader},
    },
};

use crate::error::errno_from_ioerror;

#[derive(Debug, Default)]
pub struct FileMap;

fn open(map: &str) -> Result<BufReader<fs::File>, Errno> {
    fs::File::open(map)
        .map(BufReader::new)
        .map_err(|e| errno_from_ioerror(&e))
}

/// Walk the entries of `map`, stopping early when `f` returns false.
fn scan<F>(map: &str, mut f: F) -> Result<(), Errno>
where
    F: FnMut(&str, &str) -> bool,
{
    let reader = open(map)?;
    let mut entry = String::new();
    let mut line_no = 0;

    for line in reader.lines() {
        let line = line.map_err(|e| errno_from_ioerror(&e))?;
        line_no += 1;

        let line = match line.find('#') {
            Some(i) => &line[..i],
            None => &line[..],
        };
        if let Some(cont) = line.strip_suffix('\\') {
            entry.push_str(cont);
            entry.push(' ');
            continue;
        }
        entry.push_str(line);
        let text = std::mem::take(&mut entry);
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        if text.starts_with('+') {
            warn!("{}:{}: Cannot handle include \"{}\"", map, line_no, text);
            continue;
        }
        let Some((key, val)) = text.split_once(|c: char| c.is_ascii_whitespace()) else {
            warn!("{}:{}: key {} has no value field", map, line_no, text);
            continue;
        };
        if !f(key, val.trim()) {
            return Ok(());
        }
    }
    Ok(())
}

impl MapBackend for FileMap {
    fn kind(&self) -> MapKind {
        MapKind::File
    }

    fn default_mode(&self) -> CacheMode {
        CacheMode::All
    }

    fn init(&self, map: &str) -> Result<Mtime, Errno> {
        open(map)?;
        self.mtime(map)
    }

    fn search(&self, map: &str, key: &str, modify: &mut Mtime) -> Lookup {
        match self.mtime(map) {
            Ok(t) if t > *modify => {
                debug!("file map {} changed", map);
                *modify = t;
                return Lookup::Stale;
            }
            Ok(_) => {}
            Err(e) => return Lookup::Failed(e),
        }

        let mut found = None;
        let res = scan(map, |k, v| {
            if k == key {
                found = Some(v.to_owned());
                false
            } else {
                true
            }
        });
        match (res, found) {
            (_, Some(v)) => Lookup::Found(v),
            (Ok(()), None) => Lookup::Failed(Errno::ENOENT),
            (Err(e), None) => Lookup::Failed(e),
        }
    }

    fn reload(&self, map: &str, add: &mut dyn FnMut(&str, &str)) -> Option<Result<(), Errno>> {
        Some(scan(map, |k, v| {
            add(k, v);
            true
        }))
    }

    fn mtime(&self, map: &str) -> Result<Mtime, Errno> {
        let md = fs::metadata(map).map_err(|e| errno_from_ioerror(&e))?;
        Ok(FileTime::from_last_modification_time(&md).unix_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn map_file(text: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn entries_comments_and_continuations() {
        let f = map_file(
            "# home directories\n\
             jsp   type:=nfs;rhost:=fs1;rfs:=/home/jsp\n\
             \n\
             pub   type:=link;\\\n      fs:=/vol/pub   # trailing\n\
             +other.map\n\
             lonely\n",
        );
        let path = f.path().to_str().unwrap();
        let mut entries = Vec::new();
        FileMap
            .reload(path, &mut |k: &str, v: &str| entries.push((k.to_owned(), v.to_owned())))
            .unwrap()
            .unwrap();
        assert_eq!(
            entries,
            vec![
                ("jsp".to_owned(), "type:=nfs;rhost:=fs1;rfs:=/home/jsp".to_owned()),
                ("pub".to_owned(), "type:=link;       fs:=/vol/pub".to_owned()),
            ]
        );
    }

    #[test]
    fn search_reports_staleness_once() {
        let f = map_file("a fs:=/a\n");
        let path = f.path().to_str().unwrap();
        let mut modify = FileMap.init(path).unwrap();

        assert_eq!(FileMap.search(path, "a", &mut modify), Lookup::Found("fs:=/a".to_owned()));
        assert_eq!(FileMap.search(path, "b", &mut modify), Lookup::Failed(Errno::ENOENT));

        modify -= 10;
        assert_eq!(FileMap.search(path, "a", &mut modify), Lookup::Stale);
        assert_eq!(FileMap.search(path, "a", &mut modify), Lookup::Found("fs:=/a".to_owned()));
    }

    #[test]
    fn missing_file_does_not_init() {
        assert_eq!(FileMap.init("/nonexistent/amd.map"), Err(Errno::ENOENT));
    }
}
