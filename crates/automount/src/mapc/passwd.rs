//! Password file map.
//!
//! Keys are user names. A home directory of the form
//! `/anydir/dom3/dom2/dom1/user` becomes an NFS location on host
//! `dom1.dom2.dom3` with `user` as the sublink.

use {
    super::{CacheMode, Lookup, MapBackend, MapKind, Mtime},
    log::debug,
    nix::{errno::Errno, unistd::User},
};

pub const PASSWD_MAP: &str = "/etc/passwd";

#[derive(Debug, Default)]
pub struct PasswdMap;

/// Build the map entry for a home directory, if it has enough components.
pub fn passwd_entry(home: &str) -> Option<String> {
    let (dir, user) = home.rsplit_once('/')?;
    if user.is_empty() {
        return None;
    }
    // dir = /anydir/dom3/dom2/dom1: everything after the first component
    // names the host, most significant part first
    let rest = dir.strip_prefix('/')?;
    let (_, domains) = rest.split_once('/')?;
    let rhost = domains
        .split('/')
        .filter(|d| !d.is_empty())
        .rev()
        .collect::<Vec<_>>()
        .join(".");
    if rhost.is_empty() {
        return None;
    }
    Some(format!(
        "rfs:={};rhost:={};sublink:={};fs:=${{autodir}}${{rfs}}",
        dir, rhost, user
    ))
}

impl MapBackend for PasswdMap {
    fn kind(&self) -> MapKind {
        MapKind::Passwd
    }

    fn default_mode(&self) -> CacheMode {
        CacheMode::Inc
    }

    fn init(&self, map: &str) -> Result<Mtime, Errno> {
        if map == PASSWD_MAP {
            Ok(0)
        } else {
            Err(Errno::ENOENT)
        }
    }

    fn search(&self, _map: &str, key: &str, _modify: &mut Mtime) -> Lookup {
        if key == "/defaults" {
            return Lookup::Found("type:=nfs".to_owned());
        }
        match User::from_name(key) {
            Ok(Some(pw)) => match pw.dir.to_str().and_then(passwd_entry) {
                Some(v) => Lookup::Found(v),
                None => {
                    debug!("passwd: home directory of {} is not usable", key);
                    Lookup::Failed(Errno::ENOENT)
                }
            },
            Ok(None) => Lookup::Failed(Errno::ENOENT),
            Err(e) => Lookup::Failed(e),
        }
    }

    fn mtime(&self, _map: &str) -> Result<Mtime, Errno> {
        Ok(0)
    }
}
