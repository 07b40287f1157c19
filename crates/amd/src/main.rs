use {
    automount::{
        Automounter, Config,
        config::{DEFAULT_AUTODIR, parse_map_args},
        io_err,
        mapc::MapTypes,
        platform::LinuxPlatform,
        res,
        srv::Server,
    },
    clap::Parser,
    log::{LevelFilter, error, info, warn},
    nix::unistd::geteuid,
    std::{rc::Rc, time::Duration, time::Instant},
};

#[derive(Debug, clap::Parser)]
#[command(disable_version_flag = true)]
struct Cli {
    /// Directory under which filesystems are really mounted
    #[arg(short = 'a', long, default_value = DEFAULT_AUTODIR)]
    autodir: String,

    /// Seconds a mounted filesystem is kept without being used
    #[arg(short = 'c', long, default_value_t = 300)]
    cache_duration: u64,

    /// Seconds between dismount scans
    #[arg(short = 'w', long, default_value_t = 120)]
    dismount_interval: u64,

    /// Seconds between map reloads
    #[arg(long, default_value_t = 3600)]
    map_reload_interval: u64,

    /// Default cache options for maps
    #[arg(short = 'C', long, default_value = "")]
    map_options: String,

    /// Local domain name
    #[arg(short = 'd', long)]
    domain: Option<String>,

    /// Machine architecture
    #[arg(short = 'k', long)]
    arch: Option<String>,

    /// Operating system name
    #[arg(short = 'O', long)]
    os: Option<String>,

    /// Run mounts and unmounts in the daemon itself instead of forking
    #[arg(short = 'D', long)]
    nofork: bool,

    /// Port for the amq service (0 picks one)
    #[arg(long, default_value_t = 0)]
    amq_port: u16,

    /// Port for the NFS service (0 picks one)
    #[arg(long, default_value_t = 0)]
    nfs_port: u16,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Print version information and exit
    #[arg(short = 'v', long)]
    version: bool,

    /// Automount points: dir map [-opts] ...
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    maps: Vec<String>,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config {
            autodir: self.autodir.clone(),
            cache_duration: Duration::from_secs(self.cache_duration),
            dismount_interval: Duration::from_secs(self.dismount_interval),
            map_reload_interval: Duration::from_secs(self.map_reload_interval),
            map_options: self.map_options.clone(),
            background_mounts: !self.nofork,
            amq_port: self.amq_port,
            nfs_port: self.nfs_port,
            ..Config::default()
        };
        if let Some(ref domain) = self.domain {
            config.domain = domain.clone();
        }
        if let Some(ref arch) = self.arch {
            config.arch = arch.clone();
        }
        if let Some(ref os) = self.os {
            config.os = os.clone();
        }
        config
    }
}

async fn amd_main(cli: Cli) -> automount::Result<i32> {
    let config = cli.config();

    if cli.version {
        println!(
            "amd {} ({}-{})",
            env!("CARGO_PKG_VERSION"),
            config.arch,
            config.os
        );
        println!("Map support for: {}", MapTypes::default().names().join(", "));
        return Ok(0);
    }

    let args = parse_map_args(cli.maps.as_slice())?;
    if args.is_empty() {
        return res!(io_err!(InvalidInput, "no automount points given"));
    }

    if !geteuid().is_root() {
        warn!("not running as root, mounts will fail");
    }

    let mut am = Automounter::new(
        config,
        MapTypes::default(),
        Rc::new(LinuxPlatform),
        Instant::now(),
    );
    for arg in &args {
        if let Err(e) = am.add_map(&arg.dir, &arg.map, &arg.opts) {
            error!("{}: cannot add map {}: {}", arg.dir, arg.map, e);
        }
    }

    let server = Server::bind(&am.config).await?;
    info!(
        "amd {} starting with {} automount points",
        env!("CARGO_PKG_VERSION"),
        args.len()
    );
    server.run(&mut am).await.and(Ok(0))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level)
        .parse_default_env()
        .init();

    let exit_code = amd_main(cli).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_reach_the_config() {
        let cli = Cli::parse_from([
            "amd", "-a", "/tmp_mnt", "-c", "60", "-D", "-k", "sparc", "/home", "amd.home",
            "/net", "amd.net", "-type:=host",
        ]);
        let config = cli.config();
        assert_eq!(config.autodir, "/tmp_mnt");
        assert_eq!(config.cache_duration, Duration::from_secs(60));
        assert!(!config.background_mounts);
        assert_eq!(config.arch, "sparc");
        assert_eq!(cli.maps.len(), 5);

        let args = parse_map_args(cli.maps.as_slice()).unwrap();
        assert_eq!(args[1].opts, "type:=host");
    }
}
