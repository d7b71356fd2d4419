//! Command-line flags, grounded on `olivehc.c`'s `getopt` table:
//! `-h` help, `-v` version, `-b` run in the foreground ("bare", i.e. don't
//! daemonize), `-c` config file, `-p` path prefix prepended to relative
//! paths in the config, `-a` admin port, `-i` pid file.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "olivehc", version, about = "Multi-tenant HTTP object cache over raw block devices")]
pub struct Cli {
    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'b', long = "bare")]
    pub bare: bool,

    /// Path to the configuration file.
    #[arg(short = 'c', long = "conf", default_value = "olivehc.conf")]
    pub conf_file: PathBuf,

    /// Prefix prepended to relative paths named in the config file.
    #[arg(short = 'p', long = "prefix")]
    pub prefix: Option<PathBuf>,

    /// TCP port the admin text protocol listens on.
    #[arg(short = 'a', long = "admin-port", default_value_t = 5210)]
    pub admin_port: u16,

    /// Where to write the daemon's pid once started.
    #[arg(short = 'i', long = "pid-file", default_value = "olivehc.pid")]
    pub pid_file: PathBuf,
}

impl Cli {
    pub fn resolve_conf_path(&self) -> PathBuf {
        match &self.prefix {
            Some(prefix) if self.conf_file.is_relative() => prefix.join(&self.conf_file),
            _ => self.conf_file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_original_daemon() {
        let cli = Cli::parse_from(["olivehc"]);
        assert_eq!(cli.admin_port, 5210);
        assert_eq!(cli.conf_file, PathBuf::from("olivehc.conf"));
        assert_eq!(cli.pid_file, PathBuf::from("olivehc.pid"));
        assert!(!cli.bare);
    }

    #[test]
    fn prefix_only_applies_to_relative_conf_paths() {
        let cli = Cli::parse_from(["olivehc", "-p", "/etc/olivehc", "-c", "olivehc.conf"]);
        assert_eq!(cli.resolve_conf_path(), PathBuf::from("/etc/olivehc/olivehc.conf"));

        let cli = Cli::parse_from(["olivehc", "-p", "/etc/olivehc", "-c", "/opt/olivehc.conf"]);
        assert_eq!(cli.resolve_conf_path(), PathBuf::from("/opt/olivehc.conf"));
    }
}
