//! Daemon configuration.

use {
    crate::{io_err, utils::Result},
    log::warn,
    std::time::Duration,
};

pub const DEFAULT_AUTODIR: &str = "/.amd_mnt";

#[derive(Clone, Debug)]
pub struct Config {
    /// Where remote filesystems are really mounted
    pub autodir: String,
    /// How long a mounted node stays without being used
    pub cache_duration: Duration,
    /// Interval between dismount scans
    pub dismount_interval: Duration,
    pub map_reload_interval: Duration,
    /// Ping interval for file servers whose state is known
    pub ping_interval: Duration,
    /// Cache options for maps that do not specify `cache:=`
    pub map_options: String,
    pub hostname: String,
    pub domain: String,
    pub arch: String,
    pub os: String,
    /// Fork for mounts and unmounts
    pub background_mounts: bool,
    pub amq_port: u16,
    pub nfs_port: u16,
}

impl Default for Config {
    fn default() -> Config {
        let full = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_owned());
        let (hostname, domain) = match full.split_once('.') {
            Some((h, d)) => (h.to_owned(), d.to_owned()),
            None => (full, String::new()),
        };
        Config {
            autodir: DEFAULT_AUTODIR.to_owned(),
            cache_duration: Duration::from_secs(300),
            dismount_interval: Duration::from_secs(120),
            map_reload_interval: Duration::from_secs(3600),
            ping_interval: Duration::from_secs(30),
            map_options: String::new(),
            hostname,
            domain,
            arch: std::env::consts::ARCH.to_owned(),
            os: std::env::consts::OS.to_owned(),
            background_mounts: true,
            amq_port: 0,
            nfs_port: 0,
        }
    }
}

/// A top-level automount point given on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapArg {
    pub dir: String,
    pub map: String,
    pub opts: String,
}

/// Parse `dir map [-opts]` sequences.
pub fn parse_map_args<S: AsRef<str>>(args: &[S]) -> Result<Vec<MapArg>> {
    let mut out = Vec::new();
    let mut it = args.iter().map(|a| a.as_ref()).peekable();
    while let Some(dir) = it.next() {
        let Some(map) = it.next() else {
            return Err(io_err!(InvalidInput, format!("directory {} has no map", dir)).into());
        };
        if !dir.starts_with('/') {
            warn!("{}: automount point should be an absolute path", dir);
        }
        let opts = match it.next_if(|a| a.starts_with('-')) {
            Some(o) => o[1..].to_owned(),
            None => String::new(),
        };
        out.push(MapArg {
            dir: dir.to_owned(),
            map: map.to_owned(),
            opts,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_arguments() {
        let args = parse_map_args(&["/home", "amd.home", "/net", "amd.net", "-type:=host"]).unwrap();
        assert_eq!(
            args,
            vec![
                MapArg {
                    dir: "/home".to_owned(),
                    map: "amd.home".to_owned(),
                    opts: String::new(),
                },
                MapArg {
                    dir: "/net".to_owned(),
                    map: "amd.net".to_owned(),
                    opts: "type:=host".to_owned(),
                },
            ]
        );
        assert!(parse_map_args(&["/home"]).is_err());
        assert!(parse_map_args::<&str>(&[]).unwrap().is_empty());
    }
}
