use {
    super::{CacheMode, Lookup, MapBackend, MapKind, Mtime},
    nix::errno::Errno,
};

pub const ROOT_MAP: &str = "root";

/// The map of top-level automount points. Its entries are added directly
/// to the cache, so the backend itself never finds anything.
#[derive(Debug, Default)]
pub struct RootMap;

impl MapBackend for RootMap {
    fn kind(&self) -> MapKind {
        MapKind::Root
    }

    fn default_mode(&self) -> CacheMode {
        CacheMode::Root
    }

    fn init(&self, map: &str) -> Result<Mtime, Errno> {
        if map == ROOT_MAP {
            Ok(0)
        } else {
            Err(Errno::ENOENT)
        }
    }

    fn search(&self, _map: &str, _key: &str, _modify: &mut Mtime) -> Lookup {
        Lookup::Failed(Errno::ENOENT)
    }

    fn mtime(&self, _map: &str) -> Result<Mtime, Errno> {
        Ok(0)
    }
}
