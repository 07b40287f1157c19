//! Mount-map cache.
//!
//! A map resolves lookup keys to mount specifications. Each distinct map
//! name is loaded once, through the first registered backend willing to
//! open it, and cached according to its cache mode:
//!
//! * `none`: every lookup goes to the backend
//! * `inc`: successful lookups are remembered
//! * `all`: the whole map is loaded up front and the cache is authoritative
//! * `re`: like `all`, keys are anchored regular expressions
//!
//! Backends report a changed source by returning [`Lookup::Stale`]; the
//! cache then throws its contents away, reloads if it is authoritative,
//! and retries.

use {
    log::{error, info, warn},
    nix::errno::Errno,
    regex::Regex,
    std::{collections::BTreeMap, fmt, rc::Rc},
};

pub mod error;
pub mod file;
pub mod passwd;
pub mod root;
pub mod union;

use self::root::ROOT_MAP;

/// Modification time of a map source, seconds since the epoch.
pub type Mtime = i64;

/// Number of hash buckets per map.
pub const NKVHASH: usize = 31;

/// Key of the map-wide wildcard entry.
pub const WILDCARD: &str = "*";

/// Key of the entry holding defaults for every other entry.
pub const DEFAULTS: &str = "/defaults";

/// Result of a backend search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Found(String),
    /// The source changed since the cache last synchronised; the backend has
    /// already advanced the modify time it was handed
    Stale,
    Failed(Errno),
}

/// Backend families, in the order they are offered a new map.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MapKind {
    Root,
    Passwd,
    Hesiod,
    Union,
    Nis,
    Ndbm,
    File,
    Error,
}

impl MapKind {
    pub fn name(&self) -> &'static str {
        match *self {
            MapKind::Root => "root",
            MapKind::Passwd => "passwd",
            MapKind::Hesiod => "hesiod",
            MapKind::Union => "union",
            MapKind::Nis => "nis",
            MapKind::Ndbm => "ndbm",
            MapKind::File => "file",
            MapKind::Error => "error",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheMode {
    None,
    Inc,
    All,
    /// The root map: entries are added by the daemon, not the backend
    Root,
    Re,
}

impl CacheMode {
    fn authoritative(self) -> bool {
        matches!(self, CacheMode::All | CacheMode::Re)
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            CacheMode::None => "none",
            CacheMode::Inc => "inc",
            CacheMode::All => "all",
            CacheMode::Root => "root",
            CacheMode::Re => "regexp",
        })
    }
}

/// A map source.
pub trait MapBackend {
    fn kind(&self) -> MapKind;

    /// Mode used when a map asks for the default.
    fn default_mode(&self) -> CacheMode;

    /// Claim `map`, returning its initial modify time.
    fn init(&self, map: &str) -> Result<Mtime, Errno>;

    /// Look up `key`. A backend that notices its source is newer than
    /// `*modify` updates it and returns [`Lookup::Stale`].
    fn search(&self, map: &str, key: &str, modify: &mut Mtime) -> Lookup;

    /// Enumerate every entry through `add`. `None` means the backend
    /// cannot enumerate, which rules out the `all` and `re` modes.
    fn reload(&self, _map: &str, _add: &mut dyn FnMut(&str, &str)) -> Option<Result<(), Errno>> {
        None
    }

    fn mtime(&self, map: &str) -> Result<Mtime, Errno>;
}

/// Registered backends in probe order.
pub struct MapTypes {
    types: Vec<Rc<dyn MapBackend>>,
}

impl Default for MapTypes {
    fn default() -> Self {
        let mut types = MapTypes::empty();
        types.register(Rc::new(root::RootMap));
        types.register(Rc::new(passwd::PasswdMap));
        types.register(Rc::new(union::UnionMap));
        types.register(Rc::new(file::FileMap));
        types.register(Rc::new(error::ErrorMap));
        types
    }
}

impl MapTypes {
    pub fn empty() -> MapTypes {
        MapTypes { types: Vec::new() }
    }

    /// Add a backend; it is probed after every backend of an earlier kind.
    pub fn register(&mut self, backend: Rc<dyn MapBackend>) {
        let at = self
            .types
            .iter()
            .position(|t| t.kind() > backend.kind())
            .unwrap_or(self.types.len());
        self.types.insert(at, backend);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.types.iter().map(|t| t.kind().name()).collect()
    }

    fn probe(&self, map: &str) -> (Rc<dyn MapBackend>, Mtime) {
        for t in &self.types {
            if let Ok(modify) = t.init(map) {
                return (t.clone(), modify);
            }
        }
        (Rc::new(error::ErrorMap), 0)
    }
}

/// Requested caching behaviour, parsed from a `cache:=` option string.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheOpts {
    /// `None` asks for the backend's default
    pub mode: Option<CacheMode>,
    /// Poll the source's modify time before every lookup
    pub sync: bool,
}

pub fn parse_cache_opts(opts: &str) -> CacheOpts {
    let mut out = CacheOpts::default();
    let mut modes = Vec::new();

    for word in opts.split(',').map(str::trim).filter(|w| !w.is_empty()) {
        match word {
            "all" => modes.push(Some(CacheMode::All)),
            "default" | "mapdefault" => modes.push(None),
            "inc" => modes.push(Some(CacheMode::Inc)),
            "none" => modes.push(Some(CacheMode::None)),
            "re" | "regexp" => modes.push(Some(CacheMode::Re)),
            "sync" => out.sync = true,
            _ => warn!("map option \"{}\" not recognised", word),
        }
    }
    modes.dedup();
    out.mode = match modes.as_slice() {
        [] => None,
        [m] => *m,
        _ => {
            warn!("Ambiguous map cache type \"{}\"; using \"inc\"", opts);
            Some(CacheMode::Inc)
        }
    };
    out
}

fn kvhash_of(key: &str) -> usize {
    key.bytes().map(usize::from).sum::<usize>() % NKVHASH
}

#[derive(Debug)]
struct KeyValue {
    key: String,
    re: Option<Regex>,
    /// `None` records a known miss
    val: Option<String>,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Recurse {
    /// Plain lookup, no wildcards
    None,
    /// One step of wildcard truncation
    Part,
    Full,
}

pub struct MapCache {
    name: String,
    backend: Rc<dyn MapBackend>,
    mode: CacheMode,
    sync: bool,
    modify: Mtime,
    kvhash: Vec<Vec<KeyValue>>,
    wildcard: Option<String>,
    refc: u32,
}

impl fmt::Debug for MapCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapCache")
            .field("name", &self.name)
            .field("kind", &self.backend.kind())
            .field("mode", &self.mode)
            .field("refc", &self.refc)
            .finish()
    }
}

impl MapCache {
    fn create(types: &MapTypes, name: &str, opts: &str) -> MapCache {
        let requested = parse_cache_opts(opts);
        let (backend, modify) = types.probe(name);
        let mut mode = requested.mode.unwrap_or_else(|| backend.default_mode());
        if backend.kind() == MapKind::Error {
            error!("Couldn't open map {}", name);
        }

        let mut m = MapCache {
            name: name.to_owned(),
            backend,
            mode,
            sync: requested.sync,
            modify,
            kvhash: (0..NKVHASH).map(|_| Vec::new()).collect(),
            wildcard: None,
            refc: 1,
        };

        if mode.authoritative() && !m.reload_map() {
            warn!(
                "Map type \"{}\" does not support cache type \"{}\"; using \"inc\"",
                m.backend.kind().name(),
                mode
            );
            mode = CacheMode::Inc;
            m.mode = mode;
            m.clear();
        }
        m.find_wildcard();
        info!(
            "Map {} ({}) loaded with cache mode {}",
            m.name,
            m.backend.kind().name(),
            m.mode
        );
        m
    }

    fn add_kv(&mut self, key: &str, val: Option<String>) {
        let re = if self.mode == CacheMode::Re {
            match Regex::new(&format!("^{}$", key)) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("error compiling RE \"{}\" in map {}: {}", key, self.name, e);
                    return;
                }
            }
        } else {
            None
        };

        let bucket = &mut self.kvhash[kvhash_of(key)];
        match bucket.iter_mut().find(|kv| kv.key == key) {
            Some(kv) => {
                kv.val = val;
                kv.re = re;
            }
            None => bucket.insert(
                0,
                KeyValue {
                    key: key.to_owned(),
                    re,
                    val,
                },
            ),
        }
    }

    fn clear(&mut self) {
        for bucket in self.kvhash.iter_mut() {
            bucket.clear();
        }
        self.wildcard = None;
    }

    /// Load every entry from the backend. False if it cannot enumerate or
    /// the enumeration failed.
    fn reload_map(&mut self) -> bool {
        let backend = self.backend.clone();
        let mut added = Vec::new();
        let res = backend.reload(&self.name, &mut |k: &str, v: &str| {
            added.push((k.to_owned(), v.to_owned()));
        });
        for (k, v) in added {
            self.add_kv(&k, Some(v));
        }
        match res {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                error!("Couldn't reload map {}: {}", self.name, e);
                false
            }
            None => false,
        }
    }

    fn find_wildcard(&mut self) {
        self.wildcard = self.meta_search(WILDCARD, Recurse::None).ok();
    }

    /// Throw away cached state after the source changed.
    fn sync(&mut self) {
        if self.mode == CacheMode::Root {
            return;
        }
        self.clear();
        if self.mode.authoritative() && !self.reload_map() {
            warn!("Map {} can no longer be reloaded; using \"inc\"", self.name);
            self.mode = CacheMode::Inc;
            self.clear();
        }
        self.find_wildcard();
    }

    /// Ask the backend, resynchronising for as long as it reports the
    /// cache stale.
    fn search_map(&mut self, key: &str) -> Result<String, Errno> {
        loop {
            let backend = self.backend.clone();
            match backend.search(&self.name, key, &mut self.modify) {
                Lookup::Found(v) => return Ok(v),
                Lookup::Failed(e) => return Err(e),
                Lookup::Stale => {
                    info!("Re-synchronizing cache for map {}", self.name);
                    self.sync();
                }
            }
        }
    }

    fn cached(&self, key: &str, recurse: Recurse) -> Option<Option<String>> {
        if self.mode != CacheMode::Re || recurse != Recurse::Full {
            return self.kvhash[kvhash_of(key)]
                .iter()
                .find(|kv| kv.key == key)
                .map(|kv| kv.val.clone());
        }
        // Bucket order decides between overlapping patterns
        self.kvhash
            .iter()
            .flatten()
            .find(|kv| kv.re.as_ref().is_some_and(|re| re.is_match(key)))
            .map(|kv| kv.val.clone())
    }

    fn meta_search(&mut self, key: &str, recurse: Recurse) -> Result<String, Errno> {
        if self.sync {
            match self.backend.mtime(&self.name) {
                Ok(t) if t <= self.modify => {}
                Ok(t) => {
                    info!("Map {} is out of date", self.name);
                    self.modify = t;
                    self.sync();
                }
                Err(e) => {
                    warn!("Map {}: cannot check modify time: {}", self.name, e);
                    self.sync();
                }
            }
        }

        let mut res = match self.cached(key, recurse) {
            Some(Some(v)) => Ok(v),
            Some(None) => Err(Errno::ENOENT),
            None if self.mode.authoritative() => Err(Errno::ENOENT),
            None => {
                let res = self.search_map(key);
                match res {
                    Ok(ref v) if self.mode == CacheMode::Inc => self.add_kv(key, Some(v.clone())),
                    Err(Errno::ENOENT) | Ok(_) => {}
                    Err(e) => error!("Map {}: lookup of {} failed: {}", self.name, key, e),
                }
                res
            }
        };

        if res.is_err() && recurse == Recurse::Full && self.mode != CacheMode::Re {
            if !key.starts_with('/') {
                let mut wild = key.to_owned();
                while res.is_err() {
                    let Some(i) = wild.rfind('/') else { break };
                    wild.truncate(i);
                    wild.push_str("/*");
                    res = self.meta_search(&wild, Recurse::Part);
                    wild.truncate(i);
                }
            }
            if res.is_err() {
                if let Some(ref w) = self.wildcard {
                    res = Ok(w.clone());
                }
            }
        }
        res
    }

    fn keys(&self) -> Vec<String> {
        self.kvhash
            .iter()
            .flatten()
            .filter(|kv| kv.val.is_some())
            .map(|kv| kv.key.clone())
            .collect()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(u32);

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map#{}", self.0)
    }
}

/// Every live map, found by name and shared by reference count.
pub struct MapRegistry {
    maps: BTreeMap<MapId, MapCache>,
    types: MapTypes,
    next: u32,
    root: Option<MapId>,
}

impl MapRegistry {
    pub fn new(types: MapTypes) -> MapRegistry {
        MapRegistry {
            maps: BTreeMap::new(),
            types,
            next: 0,
            root: None,
        }
    }

    /// Reference the map called `name`, loading it with `opts` if it is not
    /// loaded yet. Never fails: unusable maps come back as error maps.
    pub fn find(&mut self, name: &str, opts: &str) -> MapId {
        if let Some((&id, m)) = self.maps.iter_mut().find(|(_, m)| m.name == name) {
            m.refc += 1;
            return id;
        }
        self.next += 1;
        let id = MapId(self.next);
        let m = MapCache::create(&self.types, name, opts);
        self.maps.insert(id, m);
        id
    }

    /// Drop a reference; the map is destroyed with the last one.
    pub fn release(&mut self, id: MapId) -> bool {
        let Some(m) = self.maps.get_mut(&id) else {
            warn!("release of unknown {}", id);
            return false;
        };
        m.refc -= 1;
        if m.refc > 0 {
            return false;
        }
        info!("Releasing map {}", m.name);
        self.maps.remove(&id);
        if self.root == Some(id) {
            self.root = None;
        }
        true
    }

    /// Resolve `key`, applying wildcard fallback. `ENOENT` is a definite
    /// miss; any other error has already been logged.
    pub fn search(&mut self, id: MapId, key: &str) -> Result<String, Errno> {
        match self.maps.get_mut(&id) {
            Some(m) => m.meta_search(key, Recurse::Full),
            None => {
                error!("Null map request for {}", key);
                Err(Errno::ENOENT)
            }
        }
    }

    /// The map's `/defaults` entry. Never falls back to a wildcard.
    pub fn defaults(&mut self, id: MapId) -> Option<String> {
        self.maps
            .get_mut(&id)?
            .meta_search(DEFAULTS, Recurse::None)
            .ok()
    }

    /// Resynchronise every map, as after SIGHUP.
    pub fn reload_all(&mut self) {
        for m in self.maps.values_mut() {
            if m.mode != CacheMode::Root {
                info!("Reloading map {}", m.name);
            }
            m.sync();
        }
    }

    /// Keys with a known value, in bucket order.
    pub fn keys(&self, id: MapId) -> Vec<String> {
        self.maps.get(&id).map(MapCache::keys).unwrap_or_default()
    }

    /// The map of top-level automount points.
    pub fn root_map(&mut self) -> MapId {
        if let Some(id) = self.root {
            return id;
        }
        let id = self.find(ROOT_MAP, "mapdefault");
        self.root = Some(id);
        id
    }

    /// Add a top-level automount point `dir` served from `map`.
    pub fn root_newmap(&mut self, dir: &str, opts: &str, map: Option<&str>) {
        let id = self.root_map();
        let val = match map {
            Some(map) => format!("cache:=mapdefault;type:=toplvl;fs:=\"{}\";{}", map, opts),
            None => opts.to_owned(),
        };
        if let Some(m) = self.maps.get_mut(&id) {
            m.add_kv(dir, Some(val));
        }
    }

    pub fn name(&self, id: MapId) -> Option<&str> {
        self.maps.get(&id).map(|m| m.name.as_str())
    }

    pub fn mode(&self, id: MapId) -> Option<CacheMode> {
        self.maps.get(&id).map(|m| m.mode)
    }

    pub fn kind(&self, id: MapId) -> Option<MapKind> {
        self.maps.get(&id).map(|m| m.backend.kind())
    }

    pub fn refc(&self, id: MapId) -> u32 {
        self.maps.get(&id).map(|m| m.refc).unwrap_or(0)
    }

    /// Number of live maps.
    pub fn live(&self) -> usize {
        self.maps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    /// In-memory backend that counts how often each key is searched.
    struct Mock {
        kind: MapKind,
        entries: RefCell<Vec<(String, String)>>,
        reloadable: bool,
        stale_once: Cell<bool>,
        stale_returned: Cell<usize>,
        calls: RefCell<HashMap<String, usize>>,
        mtime: Cell<Mtime>,
        reloads: Cell<usize>,
    }

    impl Mock {
        fn new(entries: &[(&str, &str)], reloadable: bool) -> Rc<Mock> {
            Rc::new(Mock {
                kind: MapKind::File,
                entries: RefCell::new(
                    entries
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                reloadable,
                stale_once: Cell::new(false),
                stale_returned: Cell::new(0),
                calls: RefCell::new(HashMap::new()),
                mtime: Cell::new(1),
                reloads: Cell::new(0),
            })
        }

        fn calls(&self, key: &str) -> usize {
            self.calls.borrow().get(key).copied().unwrap_or(0)
        }
    }

    impl MapBackend for Mock {
        fn kind(&self) -> MapKind {
            self.kind
        }

        fn default_mode(&self) -> CacheMode {
            CacheMode::Inc
        }

        fn init(&self, map: &str) -> Result<Mtime, Errno> {
            if map.starts_with("mock:") {
                Ok(1)
            } else {
                Err(Errno::ENOENT)
            }
        }

        fn search(&self, _map: &str, key: &str, modify: &mut Mtime) -> Lookup {
            *self.calls.borrow_mut().entry(key.to_owned()).or_default() += 1;
            if self.stale_once.replace(false) {
                *modify += 1;
                self.stale_returned.set(self.stale_returned.get() + 1);
                return Lookup::Stale;
            }
            match self.entries.borrow().iter().find(|(k, _)| k == key) {
                Some((_, v)) => Lookup::Found(v.clone()),
                None => Lookup::Failed(Errno::ENOENT),
            }
        }

        fn reload(&self, _map: &str, add: &mut dyn FnMut(&str, &str)) -> Option<Result<(), Errno>> {
            if !self.reloadable {
                return None;
            }
            self.reloads.set(self.reloads.get() + 1);
            for (k, v) in self.entries.borrow().iter() {
                add(k, v);
            }
            Some(Ok(()))
        }

        fn mtime(&self, _map: &str) -> Result<Mtime, Errno> {
            Ok(self.mtime.get())
        }
    }

    fn registry(mock: &Rc<Mock>) -> MapRegistry {
        let mut types = MapTypes::empty();
        types.register(mock.clone());
        MapRegistry::new(types)
    }

    #[test]
    fn incremental_cache_memoizes_hits() {
        let mock = Mock::new(&[("home", "fs:=/home")], false);
        let mut maps = registry(&mock);
        let id = maps.find("mock:auto", "inc");

        assert_eq!(maps.search(id, "home").as_deref(), Ok("fs:=/home"));
        assert_eq!(mock.calls("home"), 1);
        assert_eq!(maps.search(id, "home").as_deref(), Ok("fs:=/home"));
        assert_eq!(mock.calls("home"), 1);
        assert_eq!(maps.keys(id), vec!["home".to_owned()]);
    }

    #[test]
    fn stale_backend_causes_exactly_one_resync() {
        let mock = Mock::new(&[("k", "fs:=/k")], false);
        let mut maps = registry(&mock);
        let id = maps.find("mock:stale", "inc");

        mock.stale_once.set(true);
        assert_eq!(maps.search(id, "k").as_deref(), Ok("fs:=/k"));
        assert_eq!(mock.stale_returned.get(), 1);
        assert_eq!(mock.calls("k"), 2);
    }

    #[test]
    fn wildcards_in_authoritative_maps() {
        let mock = Mock::new(
            &[("/a/b", "V1"), ("*", "VW"), ("x/*", "VX"), ("x/y/z", "VZ")],
            true,
        );
        let mut maps = registry(&mock);
        let id = maps.find("mock:wild", "all");
        assert_eq!(maps.mode(id), Some(CacheMode::All));

        assert_eq!(maps.search(id, "/a/b/c").as_deref(), Ok("VW"));
        assert_eq!(maps.search(id, "/a/b").as_deref(), Ok("V1"));
        assert_eq!(maps.search(id, "x/y/q").as_deref(), Ok("VX"));
        assert_eq!(maps.search(id, "x/y/z").as_deref(), Ok("VZ"));
        assert_eq!(maps.search(id, "other").as_deref(), Ok("VW"));
        assert!(mock.calls.borrow().is_empty());
    }

    #[test]
    fn sync_maps_reload_when_the_source_changes() {
        let mock = Mock::new(&[("k", "fs:=/old")], true);
        let mut maps = registry(&mock);
        let id = maps.find("mock:sync", "all,sync");
        assert_eq!(mock.reloads.get(), 1);

        assert_eq!(maps.search(id, "k").as_deref(), Ok("fs:=/old"));
        assert_eq!(mock.reloads.get(), 1);

        *mock.entries.borrow_mut() = vec![("k".to_owned(), "fs:=/new".to_owned())];
        assert_eq!(maps.search(id, "k").as_deref(), Ok("fs:=/old"));
        mock.mtime.set(2);
        assert_eq!(maps.search(id, "k").as_deref(), Ok("fs:=/new"));
        assert_eq!(mock.reloads.get(), 2);

        assert_eq!(maps.search(id, "k").as_deref(), Ok("fs:=/new"));
        assert_eq!(mock.reloads.get(), 2);
        assert!(mock.calls.borrow().is_empty());
    }

    #[test]
    fn absolute_keys_skip_directory_wildcards() {
        let mock = Mock::new(&[("/a/b/*", "V1"), ("*", "VW"), ("a/*", "VA")], true);
        let mut maps = registry(&mock);
        let id = maps.find("mock:abs", "all");

        assert_eq!(maps.search(id, "/a/b/c").as_deref(), Ok("VW"));
        assert_eq!(maps.search(id, "/a/b/*").as_deref(), Ok("V1"));
        assert_eq!(maps.search(id, "a/c").as_deref(), Ok("VA"));
    }

    #[test]
    fn wildcard_absent_means_miss() {
        let mock = Mock::new(&[("a", "A")], true);
        let mut maps = registry(&mock);
        let id = maps.find("mock:nowild", "all");
        assert_eq!(maps.search(id, "a/b"), Err(Errno::ENOENT));
    }

    #[test]
    fn find_is_reference_counted() {
        let mock = Mock::new(&[], false);
        let mut maps = registry(&mock);
        let first = maps.find("mock:shared", "");
        for _ in 0..4 {
            assert_eq!(maps.find("mock:shared", ""), first);
        }
        assert_eq!(maps.refc(first), 5);
        assert_eq!(maps.live(), 1);

        for _ in 0..4 {
            assert!(!maps.release(first));
        }
        assert!(maps.release(first));
        assert_eq!(maps.live(), 0);
        assert!(!maps.release(first));
        assert_eq!(maps.search(first, "x"), Err(Errno::ENOENT));
    }

    #[test]
    fn regexp_keys_are_anchored() {
        let mock = Mock::new(&[("a.*", "fs:=/a"), ("b[0-9]+", "fs:=/b"), ("(", "bad")], true);
        let mut maps = registry(&mock);
        let id = maps.find("mock:re", "regexp");
        assert_eq!(maps.mode(id), Some(CacheMode::Re));

        assert_eq!(maps.search(id, "abc").as_deref(), Ok("fs:=/a"));
        assert_eq!(maps.search(id, "b12").as_deref(), Ok("fs:=/b"));
        assert_eq!(maps.search(id, "xb12"), Err(Errno::ENOENT));
        assert_eq!(maps.search(id, "b"), Err(Errno::ENOENT));
    }

    #[test]
    fn all_without_reload_downgrades_to_inc() {
        let mock = Mock::new(&[("k", "v")], false);
        let mut maps = registry(&mock);
        let id = maps.find("mock:noreload", "all");
        assert_eq!(maps.mode(id), Some(CacheMode::Inc));
        assert_eq!(maps.search(id, "k").as_deref(), Ok("v"));
    }

    #[test]
    fn unopenable_map_falls_back_to_error_backend() {
        let mut maps = MapRegistry::new(MapTypes::default());
        let id = maps.find("/nonexistent/amd.map", "");
        assert_eq!(maps.kind(id), Some(MapKind::Error));
        assert_eq!(maps.mode(id), Some(CacheMode::None));
        assert_eq!(maps.search(id, "anything"), Err(Errno::ENOENT));
    }

    #[test]
    fn reload_picks_up_new_entries() {
        let mock = Mock::new(&[("a", "old")], true);
        let mut maps = registry(&mock);
        let id = maps.find("mock:reload", "all");
        assert_eq!(maps.search(id, "a").as_deref(), Ok("old"));

        *mock.entries.borrow_mut() = vec![("a".to_owned(), "new".to_owned())];
        assert_eq!(maps.search(id, "a").as_deref(), Ok("old"));
        maps.reload_all();
        assert_eq!(maps.search(id, "a").as_deref(), Ok("new"));
    }

    #[test]
    fn backends_are_probed_in_kind_order() {
        let mut types = MapTypes::default();
        let nis = Rc::new(Mock {
            kind: MapKind::Nis,
            ..Rc::try_unwrap(Mock::new(&[], false)).ok().unwrap()
        });
        types.register(nis);
        assert_eq!(
            types.names(),
            vec!["root", "passwd", "union", "nis", "file", "error"]
        );

        let mut maps = MapRegistry::new(types);
        let id = maps.find("mock:nis", "");
        assert_eq!(maps.kind(id), Some(MapKind::Nis));
        let id = maps.find(passwd::PASSWD_MAP, "");
        assert_eq!(maps.kind(id), Some(MapKind::Passwd));
    }

    #[test]
    fn cache_option_table() {
        assert_eq!(parse_cache_opts(""), CacheOpts::default());
        assert_eq!(
            parse_cache_opts("all,sync"),
            CacheOpts {
                mode: Some(CacheMode::All),
                sync: true
            }
        );
        assert_eq!(parse_cache_opts("mapdefault").mode, None);
        assert_eq!(parse_cache_opts("re").mode, Some(CacheMode::Re));
        assert_eq!(parse_cache_opts("inc,all").mode, Some(CacheMode::Inc));
        assert_eq!(parse_cache_opts("bogus"), CacheOpts::default());
    }

    #[test]
    fn root_map_holds_top_level_points() {
        let mut maps = MapRegistry::new(MapTypes::default());
        maps.root_newmap("/home", "opts:=rw", Some("amd.home"));
        let root = maps.root_map();
        assert_eq!(maps.mode(root), Some(CacheMode::Root));
        assert_eq!(
            maps.search(root, "/home").as_deref(),
            Ok("cache:=mapdefault;type:=toplvl;fs:=\"amd.home\";opts:=rw")
        );
        assert_eq!(maps.keys(root), vec!["/home".to_owned()]);
        maps.reload_all();
        assert_eq!(maps.keys(root), vec!["/home".to_owned()]);
    }
}
