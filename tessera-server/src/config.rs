//! `key = value` configuration reader.
//!
//! Lines hold one `key = value` pair; `#` starts a comment. Keys are
//! consumed by a builder that accumulates into a [`NodeDescriptor`]; the
//! `backend` key switches the active key table to the named backend's
//! section, resolved through a registry populated at startup. `freeze`
//! validates and returns the immutable descriptor the node boots from.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("config line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("missing required config key '{0}'")]
    Missing(&'static str),
}

type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// `host:port:family` listen or peer address. The optional trailing group
/// tag on `remote` entries names the replication group the peer serves;
/// without it the peer is assumed to share this node's group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddr {
    pub host: String,
    pub port: u16,
    pub family: u32,
    pub group: Option<u32>,
}

impl EndpointAddr {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub enum BackendDescriptor {
    /// Volatile in-memory records.
    Memory,
    /// Flat-file blob store rooted at `data`.
    Blob(BlobConfig),
}

#[derive(Debug, Clone, Default)]
pub struct BlobConfig {
    pub data: Option<PathBuf>,
    pub sync_interval: u64,
    pub data_block_size: u64,
    pub blob_flags: u64,
    pub iterate_thread_num: usize,
    pub blob_size: u64,
    pub records_in_blob: u64,
    pub defrag_timeout: u64,
    pub defrag_percentage: u64,
}

/// Frozen node configuration; built once, then read-only.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub log: Option<PathBuf>,
    pub log_level: u32,
    pub join: bool,
    pub flags: u64,
    pub group: u32,
    pub addr: EndpointAddr,
    pub remotes: Vec<EndpointAddr>,
    pub wait_timeout: Duration,
    pub check_timeout: Duration,
    pub io_thread_num: usize,
    pub nonblocking_io_thread_num: usize,
    pub net_thread_num: usize,
    pub history: Option<PathBuf>,
    pub daemon: bool,
    pub auth_cookie: Option<String>,
    pub bg_ionice_class: u32,
    pub bg_ionice_prio: u32,
    pub server_net_prio: u32,
    pub client_net_prio: u32,
    pub cache_size: u64,
    pub backend: BackendDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BackendKind {
    Memory,
    Blob,
}

/// Accumulates keys until `freeze`; the `backend` key moves parsing into
/// the selected backend's section.
pub struct ConfigBuilder {
    log: Option<PathBuf>,
    log_level: u32,
    join: bool,
    flags: u64,
    group: Option<u32>,
    addr: Option<EndpointAddr>,
    remotes: Vec<EndpointAddr>,
    wait_timeout: Duration,
    check_timeout: Duration,
    io_thread_num: usize,
    nonblocking_io_thread_num: usize,
    net_thread_num: usize,
    history: Option<PathBuf>,
    daemon: bool,
    auth_cookie: Option<String>,
    bg_ionice_class: u32,
    bg_ionice_prio: u32,
    server_net_prio: u32,
    client_net_prio: u32,
    cache_size: u64,
    backends: HashMap<&'static str, BackendKind>,
    active_backend: Option<BackendKind>,
    blob: BlobConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        // The backend registry; `backend = <name>` looks names up here.
        let backends = HashMap::from([
            ("memory", BackendKind::Memory),
            ("blob", BackendKind::Blob),
        ]);

        ConfigBuilder {
            log: None,
            log_level: 2,
            join: false,
            flags: 0,
            group: None,
            addr: None,
            remotes: Vec::new(),
            wait_timeout: Duration::from_secs(30),
            check_timeout: Duration::from_secs(60),
            io_thread_num: 4,
            nonblocking_io_thread_num: 4,
            net_thread_num: 4,
            history: None,
            daemon: false,
            auth_cookie: None,
            bg_ionice_class: 0,
            bg_ionice_prio: 0,
            server_net_prio: 0,
            client_net_prio: 0,
            cache_size: 0,
            backends,
            active_backend: None,
            blob: BlobConfig::default(),
        }
    }
}

impl ConfigBuilder {
    pub fn new() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match self.active_backend {
            Some(BackendKind::Blob) => self.apply_blob(key, value),
            Some(BackendKind::Memory) => {
                tracing::debug!("memory backend ignores key '{}'", key);
                Ok(())
            }
            None => self.apply_root(key, value),
        }
    }

    fn apply_root(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "log" => self.log = Some(PathBuf::from(value)),
            "log_level" => self.log_level = parse_int(value)? as u32,
            "join" => self.join = parse_bool(value)?,
            "flags" => self.flags = parse_int(value)?,
            "group" => self.group = Some(parse_int(value)? as u32),
            "addr" => self.addr = Some(parse_endpoint(value)?),
            "remote" => {
                for token in value.split([',', ' ']).filter(|t| !t.is_empty()) {
                    self.remotes.push(parse_endpoint(token)?);
                }
            }
            "wait_timeout" => self.wait_timeout = Duration::from_secs(parse_int(value)?),
            "check_timeout" => self.check_timeout = Duration::from_secs(parse_int(value)?),
            "io_thread_num" => self.io_thread_num = parse_int(value)? as usize,
            "nonblocking_io_thread_num" => {
                self.nonblocking_io_thread_num = parse_int(value)? as usize
            }
            "net_thread_num" => self.net_thread_num = parse_int(value)? as usize,
            "history" => self.history = Some(PathBuf::from(value)),
            "daemon" => self.daemon = parse_bool(value)?,
            "auth_cookie" => self.auth_cookie = Some(value.to_string()),
            "bg_ionice_class" => self.bg_ionice_class = parse_int(value)? as u32,
            "bg_ionice_prio" => self.bg_ionice_prio = parse_int(value)? as u32,
            "server_net_prio" => self.server_net_prio = parse_int(value)? as u32,
            "client_net_prio" => self.client_net_prio = parse_int(value)? as u32,
            "cache_size" => self.cache_size = parse_size(value)?,
            "backend" => {
                let kind = self
                    .backends
                    .get(value)
                    .copied()
                    .ok_or_else(|| format!("unknown backend '{}'", value))?;
                self.active_backend = Some(kind);
            }
            other => tracing::debug!("ignoring unknown config key '{}'", other),
        }
        Ok(())
    }

    fn apply_blob(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "data" => self.blob.data = Some(PathBuf::from(value)),
            "sync" => self.blob.sync_interval = parse_int(value)?,
            "data_block_size" => self.blob.data_block_size = parse_size(value)?,
            "blob_flags" => self.blob.blob_flags = parse_int(value)?,
            "iterate_thread_num" => self.blob.iterate_thread_num = parse_int(value)? as usize,
            "blob_size" => self.blob.blob_size = parse_size(value)?,
            "records_in_blob" => self.blob.records_in_blob = parse_int(value)?,
            "defrag_timeout" => self.blob.defrag_timeout = parse_int(value)?,
            "defrag_percentage" => self.blob.defrag_percentage = parse_int(value)?,
            other => tracing::debug!("blob backend ignores key '{}'", other),
        }
        Ok(())
    }

    /// Validate and hand the frozen descriptor to the node.
    pub fn freeze(self) -> ConfigResult<NodeDescriptor> {
        let addr = self.addr.ok_or(ConfigError::Missing("addr"))?;
        let group = self.group.ok_or(ConfigError::Missing("group"))?;
        let backend = match self.active_backend {
            Some(BackendKind::Memory) | None => BackendDescriptor::Memory,
            Some(BackendKind::Blob) => {
                if self.blob.data.is_none() {
                    return Err(ConfigError::Missing("data"));
                }
                BackendDescriptor::Blob(self.blob)
            }
        };

        Ok(NodeDescriptor {
            log: self.log,
            log_level: self.log_level,
            join: self.join,
            flags: self.flags,
            group,
            addr,
            remotes: self.remotes,
            wait_timeout: self.wait_timeout,
            check_timeout: self.check_timeout,
            io_thread_num: self.io_thread_num,
            nonblocking_io_thread_num: self.nonblocking_io_thread_num,
            net_thread_num: self.net_thread_num,
            history: self.history,
            daemon: self.daemon,
            auth_cookie: self.auth_cookie,
            bg_ionice_class: self.bg_ionice_class,
            bg_ionice_prio: self.bg_ionice_prio,
            server_net_prio: self.server_net_prio,
            client_net_prio: self.client_net_prio,
            cache_size: self.cache_size,
            backend,
        })
    }
}

impl NodeDescriptor {
    pub fn from_file(path: &std::path::Path) -> ConfigResult<NodeDescriptor> {
        let contents = std::fs::read_to_string(path)?;
        NodeDescriptor::from_str_contents(&contents)
    }

    pub fn from_str_contents(contents: &str) -> ConfigResult<NodeDescriptor> {
        let mut builder = ConfigBuilder::new();

        for (index, raw_line) in contents.lines().enumerate() {
            let line_no = index + 1;
            let line = match raw_line.find('#') {
                Some(at) => &raw_line[..at],
                None => raw_line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Parse {
                line: line_no,
                message: format!("expected 'key = value', got '{}'", line),
            })?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return Err(ConfigError::Parse {
                    line: line_no,
                    message: "empty key or value".to_string(),
                });
            }

            builder
                .apply(key, value)
                .map_err(|message| ConfigError::Parse { line: line_no, message })?;
        }

        builder.freeze()
    }
}

fn parse_int(value: &str) -> Result<u64, String> {
    value
        .parse::<u64>()
        .map_err(|_| format!("'{}' is not an unsigned integer", value))
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(format!("'{}' is not 0 or 1", other)),
    }
}

/// Byte size with an optional K/M/G suffix, e.g. `10M`.
fn parse_size(value: &str) -> Result<u64, String> {
    let (digits, multiplier) = match value.chars().last() {
        Some('K') | Some('k') => (&value[..value.len() - 1], 1u64 << 10),
        Some('M') | Some('m') => (&value[..value.len() - 1], 1u64 << 20),
        Some('G') | Some('g') => (&value[..value.len() - 1], 1u64 << 30),
        _ => (value, 1),
    };
    parse_int(digits).map(|n| n * multiplier)
}

/// `host:port:family[:group]`; the family defaults to 2 (AF_INET).
fn parse_endpoint(value: &str) -> Result<EndpointAddr, String> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() < 2 || parts.len() > 4 {
        return Err(format!(
            "'{}' is not host:port[:family[:group]]",
            value
        ));
    }

    let host = parts[0].to_string();
    if host.is_empty() {
        return Err(format!("'{}' has an empty host", value));
    }
    let port = parts[1]
        .parse::<u16>()
        .map_err(|_| format!("'{}' has a bad port", value))?;
    let family = match parts.get(2) {
        Some(raw) => parse_int(raw)? as u32,
        None => 2,
    };
    let group = match parts.get(3) {
        Some(raw) => Some(parse_int(raw)? as u32),
        None => None,
    };

    Ok(EndpointAddr { host, port, family, group })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
        # storage node
        log = /var/log/tessera/node.log
        log_level = 3
        join = 1
        flags = 4
        group = 2
        addr = localhost:1026:2
        remote = localhost:1025:2:1
        wait_timeout = 60   # seconds
        check_timeout = 60
        io_thread_num = 50
        nonblocking_io_thread_num = 16
        net_thread_num = 16
        history = /var/lib/tessera/history
        daemon = 0
        auth_cookie = 0102feab
        bg_ionice_class = 3
        bg_ionice_prio = 0
        server_net_prio = 1
        client_net_prio = 6
        cache_size = 268435456

        backend = blob
        sync = 5
        data = /var/lib/tessera/blob/data
        data_block_size = 1024
        blob_flags = 6
        iterate_thread_num = 1
        blob_size = 10M
        records_in_blob = 10000000
        defrag_timeout = 3600
        defrag_percentage = 25
    "#;

    #[test]
    fn full_config_round_trip() {
        let descriptor = NodeDescriptor::from_str_contents(FULL_CONFIG).unwrap();

        assert_eq!(descriptor.log_level, 3);
        assert!(descriptor.join);
        assert_eq!(descriptor.flags, 4);
        assert_eq!(descriptor.group, 2);
        assert_eq!(descriptor.addr.host_port(), "localhost:1026");
        assert_eq!(descriptor.addr.family, 2);
        assert_eq!(descriptor.remotes.len(), 1);
        assert_eq!(descriptor.remotes[0].host_port(), "localhost:1025");
        assert_eq!(descriptor.remotes[0].group, Some(1));
        assert_eq!(descriptor.wait_timeout, Duration::from_secs(60));
        assert_eq!(descriptor.io_thread_num, 50);
        assert!(!descriptor.daemon);
        assert_eq!(descriptor.auth_cookie.as_deref(), Some("0102feab"));
        assert_eq!(descriptor.cache_size, 256 * 1024 * 1024);

        match &descriptor.backend {
            BackendDescriptor::Blob(blob) => {
                assert_eq!(blob.sync_interval, 5);
                assert_eq!(blob.blob_size, 10 * 1024 * 1024);
                assert_eq!(blob.records_in_blob, 10_000_000);
                assert_eq!(blob.defrag_percentage, 25);
                assert_eq!(
                    blob.data.as_deref(),
                    Some(std::path::Path::new("/var/lib/tessera/blob/data"))
                );
            }
            other => panic!("expected blob backend, got {:?}", other),
        }
    }

    #[test]
    fn backend_key_switches_the_active_section() {
        // `data` before the backend switch is a root-level unknown and is
        // ignored; after the switch it configures the blob store.
        let config = "
            group = 1
            addr = localhost:1025
            data = /ignored
            backend = blob
            data = /kept
        ";
        let descriptor = NodeDescriptor::from_str_contents(config).unwrap();
        match descriptor.backend {
            BackendDescriptor::Blob(blob) => {
                assert_eq!(blob.data.as_deref(), Some(std::path::Path::new("/kept")));
            }
            other => panic!("expected blob backend, got {:?}", other),
        }
    }

    #[test]
    fn memory_backend_is_the_default() {
        let descriptor =
            NodeDescriptor::from_str_contents("group = 1\naddr = localhost:1025\n").unwrap();
        assert!(matches!(descriptor.backend, BackendDescriptor::Memory));
        assert_eq!(descriptor.addr.family, 2);
    }

    #[test]
    fn missing_required_keys_are_reported() {
        let err = NodeDescriptor::from_str_contents("group = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Missing("addr")));

        let err = NodeDescriptor::from_str_contents("addr = localhost:1025\n").unwrap_err();
        assert!(matches!(err, ConfigError::Missing("group")));

        let err =
            NodeDescriptor::from_str_contents("group = 1\naddr = h:1\nbackend = blob\n")
                .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("data")));
    }

    #[test]
    fn bad_lines_carry_their_line_number() {
        let err = NodeDescriptor::from_str_contents("group = 1\nnonsense\n").unwrap_err();
        match err {
            ConfigError::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("expected parse error, got {:?}", other),
        }

        let err = NodeDescriptor::from_str_contents("join = yes\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 1, .. }));

        let err = NodeDescriptor::from_str_contents("backend = tokyocabinet\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn sizes_accept_suffixes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("10M").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("8k").unwrap(), 8 * 1024);
        assert!(parse_size("tenM").is_err());
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let config = "
            # leading comment
            group = 7     # trailing comment

            addr = node1:1030:10
        ";
        let descriptor = NodeDescriptor::from_str_contents(config).unwrap();
        assert_eq!(descriptor.group, 7);
        assert_eq!(descriptor.addr.family, 10);
    }
}
