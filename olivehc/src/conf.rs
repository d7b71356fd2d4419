//! Configuration file parser, grounded on `conf.c` in full: a line-at-a-
//! time directive parser (`directive value...`), `#` line comments,
//! `include <path>` with a depth guard against include cycles, global
//! directives accepted until the first `listen <port>` opens a server
//! block, and size-suffix literals (`K`/`M`/`G`/`T`, binary shifts of
//! 10/20/30/40) for anything byte-denominated.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use olivehc_core::device::DEVICE_CAPACITY_LIMIT_270G;
use olivehc_core::server::ServerConfig;

/// `conf.c` refuses to follow `include` past this many levels, matching
/// the real daemon's guard against an include cycle hanging startup.
const MAX_INCLUDE_DEPTH: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfError {
    #[error("{path}:{line}: unknown directive '{directive}'")]
    UnknownDirective { path: String, line: u32, directive: String },
    #[error("{path}:{line}: '{directive}' expects {expected} argument(s), got {got}")]
    WrongArity { path: String, line: u32, directive: String, expected: usize, got: usize },
    #[error("{path}:{line}: invalid size literal '{value}'")]
    BadSize { path: String, line: u32, value: String },
    #[error("{path}:{line}: invalid integer '{value}'")]
    BadInt { path: String, line: u32, value: String },
    #[error("{path}:{line}: invalid flag '{value}' (expected on/off)")]
    BadFlag { path: String, line: u32, value: String },
    #[error("{path}:{line}: 'device' directive outside a device block is not allowed before any 'listen'")]
    DeviceBeforeListen { path: String, line: u32 },
    #[error("include depth exceeded {0} while including '{1}'")]
    IncludeTooDeep(u32, String),
    #[error("failed to read '{0}': {1}")]
    Io(String, String),
    #[error("{path}:{line}: device capacity {capacity} exceeds the 270G safety limit")]
    CapacityTooLarge { path: String, line: u32, capacity: u64 },
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub path: PathBuf,
    pub capacity: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    pub threads: u32,
    pub quit_timeout_secs: u32,
    pub device_badblock_percent: u32,
    pub device_check_270g: bool,
    pub access_log: PathBuf,
    pub devices: Vec<DeviceConfig>,
}

impl GlobalConfig {
    fn defaults() -> Self {
        GlobalConfig {
            threads: 4,
            quit_timeout_secs: 60,
            device_badblock_percent: 1,
            device_check_270g: true,
            access_log: PathBuf::from("access.log"),
            devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    pub servers: Vec<ServerConfig>,
}

/// Parses `path` as the top-level config file.
pub fn parse_file(path: &Path) -> Result<Config, ConfError> {
    let mut global = GlobalConfig::defaults();
    let mut servers = Vec::new();
    let mut current: Option<ServerConfig> = None;

    parse_into(path, 0, &mut global, &mut servers, &mut current)?;
    if let Some(server) = current.take() {
        servers.push(server);
    }

    Ok(Config { global, servers })
}

fn parse_into(
    path: &Path,
    depth: u32,
    global: &mut GlobalConfig,
    servers: &mut Vec<ServerConfig>,
    current: &mut Option<ServerConfig>,
) -> Result<(), ConfError> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(ConfError::IncludeTooDeep(MAX_INCLUDE_DEPTH, path.display().to_string()));
    }

    let text = fs::read_to_string(path).map_err(|e| ConfError::Io(path.display().to_string(), e.to_string()))?;
    let path_str = path.display().to_string();

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx as u32 + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let mut words = line.split_whitespace();
        let directive = words.next().unwrap();
        let args: Vec<&str> = words.collect();

        match directive {
            "include" => {
                expect_arity(&path_str, line_no, "include", &args, 1)?;
                let include_path = resolve_relative(path, args[0]);
                parse_into(&include_path, depth + 1, global, servers, current)?;
            }
            "threads" => global.threads = parse_int(&path_str, line_no, "threads", &args)?,
            "quit_timeout" => global.quit_timeout_secs = parse_int(&path_str, line_no, "quit_timeout", &args)?,
            "device_badblock_percent" => {
                global.device_badblock_percent = parse_int(&path_str, line_no, "device_badblock_percent", &args)?
            }
            "device_check_270G" => {
                global.device_check_270g = parse_flag(&path_str, line_no, "device_check_270G", &args)?
            }
            "access_log" => {
                expect_arity(&path_str, line_no, "access_log", &args, 1)?;
                global.access_log = PathBuf::from(args[0]);
            }
            "device" => {
                expect_arity(&path_str, line_no, "device", &args, 2)?;
                let capacity = parse_size(&path_str, line_no, args[1])?;
                if global.device_check_270g && capacity > DEVICE_CAPACITY_LIMIT_270G {
                    return Err(ConfError::CapacityTooLarge { path: path_str, line: line_no, capacity });
                }
                global.devices.push(DeviceConfig { path: PathBuf::from(args[0]), capacity });
            }
            "listen" => {
                expect_arity(&path_str, line_no, "listen", &args, 1)?;
                if let Some(server) = current.take() {
                    servers.push(server);
                }
                let port: u32 = parse_int(&path_str, line_no, "listen", &args)?;
                let mut server = ServerConfig::default();
                server.port = port as u16;
                *current = Some(server);
            }
            "connections_limit" => {
                let server = require_server(current, &path_str, line_no)?;
                server.connections_limit = parse_int(&path_str, line_no, "connections_limit", &args)?;
            }
            "item_max_size" => {
                let value = parse_size(&path_str, line_no, args.first().copied().unwrap_or(""))?;
                let server = require_server(current, &path_str, line_no)?;
                server.item_max_size = value;
            }
            "expire_default" => {
                let value = parse_int::<i64>(&path_str, line_no, "expire_default", &args)?;
                let server = require_server(current, &path_str, line_no)?;
                server.expire_default_secs = value;
            }
            "status_period" => {
                let value = parse_int(&path_str, line_no, "status_period", &args)?;
                let server = require_server(current, &path_str, line_no)?;
                server.status_period_secs = value;
            }
            "capacity" => {
                let value = parse_size(&path_str, line_no, args.first().copied().unwrap_or(""))?;
                let server = require_server(current, &path_str, line_no)?;
                server.quota_bytes = if value == 0 { None } else { Some(value) };
            }
            "server_dump" => {
                let value = parse_flag(&path_str, line_no, "server_dump", &args)?;
                let server = require_server(current, &path_str, line_no)?;
                server.server_dump = value;
            }
            "passby_enable" => {
                let value = parse_flag(&path_str, line_no, "passby_enable", &args)?;
                let server = require_server(current, &path_str, line_no)?;
                server.passby_enable = value;
            }
            "passby_begin_item_nr" => {
                let value = parse_int(&path_str, line_no, "passby_begin_item_nr", &args)?;
                let server = require_server(current, &path_str, line_no)?;
                server.passby_begin_item_nr = value;
            }
            "passby_begin_consumed" => {
                let value = parse_size(&path_str, line_no, args.first().copied().unwrap_or(""))?;
                let server = require_server(current, &path_str, line_no)?;
                server.passby_begin_consumed = value;
            }
            "passby_limit_nr" => {
                let value = parse_int(&path_str, line_no, "passby_limit_nr", &args)?;
                let server = require_server(current, &path_str, line_no)?;
                server.passby_limit_nr = value;
            }
            "passby_expire" => {
                let value = parse_int::<i64>(&path_str, line_no, "passby_expire", &args)?;
                let server = require_server(current, &path_str, line_no)?;
                server.passby_expire = value;
            }
            other => {
                return Err(ConfError::UnknownDirective {
                    path: path_str,
                    line: line_no,
                    directive: other.to_string(),
                })
            }
        }
    }

    Ok(())
}

fn require_server<'a>(
    current: &'a mut Option<ServerConfig>,
    path: &str,
    line: u32,
) -> Result<&'a mut ServerConfig, ConfError> {
    current.as_mut().ok_or(ConfError::DeviceBeforeListen { path: path.to_string(), line })
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn resolve_relative(current_file: &Path, target: &str) -> PathBuf {
    let target = PathBuf::from(target);
    if target.is_absolute() {
        target
    } else {
        current_file.parent().map(|p| p.join(&target)).unwrap_or(target)
    }
}

fn expect_arity(path: &str, line: u32, directive: &str, args: &[&str], expected: usize) -> Result<(), ConfError> {
    if args.len() != expected {
        return Err(ConfError::WrongArity {
            path: path.to_string(),
            line,
            directive: directive.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn parse_int<T: std::str::FromStr>(path: &str, line: u32, directive: &str, args: &[&str]) -> Result<T, ConfError> {
    expect_arity(path, line, directive, args, 1)?;
    args[0]
        .parse()
        .map_err(|_| ConfError::BadInt { path: path.to_string(), line, value: args[0].to_string() })
}

fn parse_flag(path: &str, line: u32, directive: &str, args: &[&str]) -> Result<bool, ConfError> {
    expect_arity(path, line, directive, args, 1)?;
    match args[0] {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(ConfError::BadFlag { path: path.to_string(), line, value: other.to_string() }),
    }
}

/// Parses a size literal with an optional `K`/`M`/`G`/`T` suffix (binary,
/// matching `conf_set_size`'s `1<<10`/`1<<20`/`1<<30`/`1<<40` shifts).
fn parse_size(path: &str, line: u32, value: &str) -> Result<u64, ConfError> {
    let err = || ConfError::BadSize { path: path.to_string(), line, value: value.to_string() };
    if value.is_empty() {
        return Err(err());
    }
    let (digits, shift) = match value.chars().last().unwrap() {
        'K' | 'k' => (&value[..value.len() - 1], 10),
        'M' | 'm' => (&value[..value.len() - 1], 20),
        'G' | 'g' => (&value[..value.len() - 1], 30),
        'T' | 't' => (&value[..value.len() - 1], 40),
        _ => (value, 0),
    };
    let base: u64 = digits.parse().map_err(|_| err())?;
    base.checked_shl(shift).ok_or_else(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> PathBuf {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("olivehc-conf-test-{:?}-{n}.conf", std::thread::current().id()));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_global_and_server_directives() {
        let path = write_temp(
            "threads 8\n\
             device_badblock_percent 2\n\
             device /dev/sdb 100G\n\
             listen 8080\n\
             connections_limit 500\n\
             item_max_size 10M\n\
             expire_default 120\n",
        );
        let conf = parse_file(&path).unwrap();
        assert_eq!(conf.global.threads, 8);
        assert_eq!(conf.global.devices.len(), 1);
        assert_eq!(conf.global.devices[0].capacity, 100 * (1 << 30));
        assert_eq!(conf.servers.len(), 1);
        assert_eq!(conf.servers[0].port, 8080);
        assert_eq!(conf.servers[0].connections_limit, 500);
        assert_eq!(conf.servers[0].item_max_size, 10 * (1 << 20));
        assert_eq!(conf.servers[0].expire_default_secs, 120);
    }

    #[test]
    fn server_dump_off_is_parsed() {
        let path = write_temp("listen 8080\nserver_dump off\n");
        let conf = parse_file(&path).unwrap();
        assert!(!conf.servers[0].server_dump);
    }

    #[test]
    fn server_dump_defaults_on() {
        let path = write_temp("listen 8080\n");
        let conf = parse_file(&path).unwrap();
        assert!(conf.servers[0].server_dump);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let path = write_temp("# a comment\n\nthreads 2 # trailing comment\n");
        let conf = parse_file(&path).unwrap();
        assert_eq!(conf.global.threads, 2);
    }

    #[test]
    fn unknown_directive_is_an_error() {
        let path = write_temp("bogus_directive 1\n");
        assert!(matches!(parse_file(&path), Err(ConfError::UnknownDirective { .. })));
    }

    #[test]
    fn oversized_device_is_rejected_under_270g_check() {
        let path = write_temp("device_check_270G on\ndevice /dev/sdb 300G\n");
        assert!(matches!(parse_file(&path), Err(ConfError::CapacityTooLarge { .. })));
    }

    #[test]
    fn oversized_device_allowed_when_check_disabled() {
        let path = write_temp("device_check_270G off\ndevice /dev/sdb 300G\n");
        let conf = parse_file(&path).unwrap();
        assert_eq!(conf.global.devices[0].capacity, 300 * (1 << 30));
    }

    #[test]
    fn passby_directives_are_parsed() {
        let path = write_temp(
            "listen 8080\n\
             passby_enable on\n\
             passby_begin_item_nr 0\n\
             passby_begin_consumed 0\n\
             passby_limit_nr 1000\n\
             passby_expire 60\n",
        );
        let conf = parse_file(&path).unwrap();
        let server = &conf.servers[0];
        assert!(server.passby_enable);
        assert_eq!(server.passby_begin_item_nr, 0);
        assert_eq!(server.passby_begin_consumed, 0);
        assert_eq!(server.passby_limit_nr, 1000);
        assert_eq!(server.passby_expire, 60);
    }

    #[test]
    fn multiple_listen_blocks_produce_multiple_servers() {
        let path = write_temp("listen 8080\nlisten 9090\n");
        let conf = parse_file(&path).unwrap();
        assert_eq!(conf.servers.len(), 2);
        assert_eq!(conf.servers[0].port, 8080);
        assert_eq!(conf.servers[1].port, 9090);
    }
}
