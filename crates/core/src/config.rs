//! Replica configuration: discovery, `config.ini` parsing, and the
//! [`ReplicaContext`] passed to every component.
//!
//! No component reads the working directory or the process environment on
//! its own. The caller captures both once and hands them over in
//! [`ContextOptions`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use regex_lite::Regex;
use tracing::{debug, info, warn};

use crate::errors::{CommandError, ConfigError, CoreError};
use crate::layout::{self, ConfigLayout, CONFIG_DIR_NAME};

/// Written to `config.ini` by `init`.
pub const CONFIG_EXAMPLE: &str = "\
# yarsync configuration file.
#
# Each section names a remote replica and its location:
#
# [my_remote]
# path = remote:/path/to/repo
#
# A host may be given separately:
#
# [backup]
# host = backup-server
# path = $HOME/archive
#
# Environment variables ($NAME or ${NAME}) are expanded in values.
";

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

/// A replica root as rsync understands it: a local path or `host:path`.
///
/// The trailing slash matters to rsync, so a location always carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location(String);

impl Location {
    pub fn new(raw: impl Into<String>) -> Self {
        let mut raw = raw.into();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        Self(raw)
    }

    pub fn from_path(path: &Path) -> Self {
        Self::new(path.to_string_lossy().into_owned())
    }

    /// The root with its trailing slash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A path inside the peer's configuration directory.
    pub fn config_entry(&self, rel: &str) -> String {
        if rel.is_empty() {
            format!("{}{}/", self.0, CONFIG_DIR_NAME)
        } else {
            format!("{}{}/{}", self.0, CONFIG_DIR_NAME, rel)
        }
    }

    /// Whether rsync will treat this as `host:path`.
    pub fn is_remote(&self) -> bool {
        match self.0.find(':') {
            Some(colon) => !self.0[..colon].contains('/'),
            None => false,
        }
    }

    /// Last path component, used as the default clone directory.
    pub fn basename(&self) -> Option<&str> {
        let path = if self.is_remote() {
            self.0.split_once(':').map(|(_, p)| p).unwrap_or(&self.0)
        } else {
            &self.0
        };
        path.trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|b| !b.is_empty() && *b != "." && *b != "..")
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

/// One section of `config.ini`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    /// Section name; an alias local to this replica.
    pub name: String,
    /// Path on the peer's host, or a full `host:path`.
    pub destination: String,
    /// Optional `host` key, prefixed to `destination` as `host:`.
    pub host_override: Option<String>,
}

impl PeerDescriptor {
    pub fn location(&self) -> Location {
        match self.host_override {
            Some(ref host) => Location::new(format!("{}:{}", host, self.destination)),
            None => Location::new(self.destination.clone()),
        }
    }
}

/// Parsed `config.ini`, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerTable {
    peers: Vec<PeerDescriptor>,
}

impl PeerTable {
    /// Parse INI text. Fails closed on duplicate sections or keys, unknown
    /// keys, keys outside a section, and sections without `path`.
    pub fn parse(text: &str, env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        struct Section {
            name: String,
            line: usize,
            path: Option<String>,
            host: Option<String>,
        }

        let mut sections: Vec<Section> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .map(str::trim)
                    .ok_or_else(|| ConfigError::ParseError {
                        line: line_no,
                        detail: format!("unterminated section header '{}'", line),
                    })?;
                if name.is_empty() {
                    return Err(ConfigError::ParseError {
                        line: line_no,
                        detail: "empty section name".into(),
                    });
                }
                if let Some(prev) = sections.iter().find(|s| s.name == name) {
                    return Err(ConfigError::ParseError {
                        line: line_no,
                        detail: format!(
                            "section '{}' already defined at line {}",
                            name, prev.line
                        ),
                    });
                }
                sections.push(Section {
                    name: name.to_string(),
                    line: line_no,
                    path: None,
                    host: None,
                });
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::ParseError {
                line: line_no,
                detail: format!("expected 'key = value', found '{}'", line),
            })?;
            let key = key.trim().to_ascii_lowercase();
            let value = expand_env(value.trim(), env);

            let section = sections.last_mut().ok_or_else(|| ConfigError::ParseError {
                line: line_no,
                detail: format!("key '{}' outside of a section", key),
            })?;
            let slot = match key.as_str() {
                "path" => &mut section.path,
                "host" => &mut section.host,
                other => {
                    return Err(ConfigError::ParseError {
                        line: line_no,
                        detail: format!("unknown key '{}' in section '{}'", other, section.name),
                    })
                }
            };
            if slot.is_some() {
                return Err(ConfigError::ParseError {
                    line: line_no,
                    detail: format!("duplicate key '{}' in section '{}'", key, section.name),
                });
            }
            *slot = Some(value);
        }

        let mut peers = Vec::with_capacity(sections.len());
        for section in sections {
            let destination = section
                .path
                .filter(|p| !p.is_empty())
                .ok_or_else(|| ConfigError::ParseError {
                    line: section.line,
                    detail: format!("section '{}' has no path", section.name),
                })?;
            peers.push(PeerDescriptor {
                name: section.name,
                destination,
                host_override: section.host.filter(|h| !h.is_empty()),
            });
        }

        debug!(count = peers.len(), "parsed peer table");
        Ok(Self { peers })
    }

    pub fn get(&self, name: &str) -> Option<&PeerDescriptor> {
        self.peers.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerDescriptor> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Substitute `$NAME` and `${NAME}` from `env`. Unset variables stay verbatim.
pub fn expand_env(text: &str, env: &HashMap<String, String>) -> String {
    let re = match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)") {
        Ok(re) => re,
        Err(_) => return text.to_string(),
    };
    re.replace_all(text, |caps: &regex_lite::Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match env.get(name) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}

// ---------------------------------------------------------------------------
// Replica context
// ---------------------------------------------------------------------------

/// Ambient inputs captured once by the caller.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Directory the command was started in.
    pub cwd: PathBuf,
    /// Explicit `--root-dir`; must come with `config_dir`.
    pub root_dir: Option<PathBuf>,
    /// Explicit `--config-dir`; must come with `root_dir`.
    pub config_dir: Option<PathBuf>,
    /// Environment used for `$NAME` expansion in `config.ini`.
    pub env: HashMap<String, String>,
    /// User name recorded in commit logs.
    pub author: String,
}

impl ContextOptions {
    /// Resolve the replica root and configuration directory, searching from
    /// `cwd` upwards when neither is given explicitly.
    pub fn locate(&self) -> Result<(PathBuf, PathBuf), ConfigError> {
        match (&self.root_dir, &self.config_dir) {
            (Some(root), Some(config)) => Ok((self.cwd.join(root), self.cwd.join(config))),
            (None, None) => {
                let mut dir = Some(self.cwd.as_path());
                while let Some(current) = dir {
                    let candidate = current.join(CONFIG_DIR_NAME);
                    if candidate.is_dir() {
                        debug!(root = %current.display(), "found configuration directory");
                        return Ok((current.to_path_buf(), candidate));
                    }
                    dir = current.parent();
                }
                Err(ConfigError::NoConfigDir(CONFIG_DIR_NAME.into()))
            }
            _ => Err(ConfigError::InvalidValue {
                field: "--config-dir/--root-dir".into(),
                detail: "both --config-dir and --root-dir must be provided".into(),
            }),
        }
    }
}

/// Result of [`ReplicaContext::init`]; records what was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub name: String,
    pub created_dir: bool,
    pub created_config: bool,
    pub created_name: bool,
}

/// Everything a component needs to know about the replica it runs in.
#[derive(Debug, Clone)]
pub struct ReplicaContext {
    root: PathBuf,
    layout: ConfigLayout,
    peers: PeerTable,
    name: String,
    author: String,
    env: HashMap<String, String>,
}

impl ReplicaContext {
    /// Locate and load an existing replica.
    pub fn discover(opts: &ContextOptions) -> Result<Self, ConfigError> {
        let (root, config_dir) = opts.locate()?;
        Self::open(root, config_dir, opts.env.clone(), opts.author.clone())
    }

    /// Load the replica rooted at `root` with configuration in `config_dir`.
    pub fn open(
        root: impl Into<PathBuf>,
        config_dir: impl Into<PathBuf>,
        env: HashMap<String, String>,
        author: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let root = root.into();
        let layout = ConfigLayout::new(config_dir);

        let config_file = layout.config_file();
        let text = std::fs::read_to_string(&config_file)
            .map_err(|_| ConfigError::FileNotFound(config_file.display().to_string()))?;
        let peers = PeerTable::parse(&text, &env)?;
        let name = read_replica_name(layout.dir())?;

        info!(root = %root.display(), name = %name, peers = peers.len(), "opened replica");
        Ok(Self {
            root,
            layout,
            peers,
            name,
            author: author.into(),
            env,
        })
    }

    /// Create the configuration directory, an example `config.ini`, and the
    /// replica name file. Existing files are left untouched.
    pub fn init(config_dir: &Path, name: &str) -> Result<InitReport, CoreError> {
        validate_replica_name(name)?;
        let layout = ConfigLayout::new(config_dir);

        let created_dir = !config_dir.exists();
        if created_dir {
            info!(dir = %config_dir.display(), "creating configuration directory");
            std::fs::create_dir_all(config_dir).map_err(|e| {
                CoreError::io(format!("could not create {}", config_dir.display()), e)
            })?;
        }

        let config_file = layout.config_file();
        let created_config = !config_file.exists();
        if created_config {
            std::fs::write(&config_file, CONFIG_EXAMPLE).map_err(|e| {
                CoreError::io(format!("could not write {}", config_file.display()), e)
            })?;
        }

        let (name, created_name) = match read_replica_name(config_dir) {
            Ok(existing) => {
                if existing != name {
                    warn!(
                        existing = %existing,
                        requested = %name,
                        "replica already named, keeping existing name"
                    );
                }
                (existing, false)
            }
            Err(_) => {
                let repo_file = layout.repo_file(name);
                std::fs::write(&repo_file, "").map_err(|e| {
                    CoreError::io(format!("could not write {}", repo_file.display()), e)
                })?;
                (name.to_string(), true)
            }
        };

        Ok(InitReport {
            name,
            created_dir,
            created_config,
            created_name,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> &ConfigLayout {
        &self.layout
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// This replica's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    /// Look up a peer by its section name.
    pub fn peer(&self, name: &str) -> Result<&PeerDescriptor, ConfigError> {
        self.peers
            .get(name)
            .ok_or_else(|| ConfigError::UnknownPeer(name.to_string()))
    }

    /// Location of a push/pull argument: a configured peer, or else a
    /// `host:path` or a local directory holding a replica.
    pub fn resolve_peer(&self, arg: &str) -> Result<Location, ConfigError> {
        if let Some(peer) = self.peers.get(arg) {
            return Ok(peer.location());
        }
        let location = Location::new(arg);
        if location.is_remote() || Path::new(arg).join(CONFIG_DIR_NAME).is_dir() {
            debug!(%location, "using the argument as a path");
            return Ok(location);
        }
        Err(ConfigError::UnknownPeer(arg.to_string()))
    }

    /// The root as an rsync source/destination, with trailing slash.
    pub fn root_location(&self) -> Location {
        Location::from_path(&self.root)
    }

    /// Synchronization carries the configuration directory along with the
    /// working tree, so it must be `<root>/.ys`.
    pub fn ensure_standard_layout(&self) -> Result<(), CommandError> {
        let expected = self.root.join(CONFIG_DIR_NAME);
        if self.layout.dir() == expected {
            Ok(())
        } else {
            Err(CommandError::DetachedConfigDir {
                expected: expected.display().to_string(),
            })
        }
    }

    /// Append a peer section to `config.ini`.
    pub fn add_peer(&mut self, name: &str, path: &str) -> Result<(), CoreError> {
        if self.peers.get(name).is_some() {
            return Err(CommandError::DuplicatePeer(name.to_string()).into());
        }
        let config_file = self.layout.config_file();
        let mut text = std::fs::read_to_string(&config_file)
            .map_err(|e| CoreError::io(format!("could not read {}", config_file.display()), e))?;
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        if !text.is_empty() {
            text.push('\n');
        }
        let _ = write!(text, "[{}]\npath = {}\n", name, path);

        // Reject anything the parser would reject later.
        let peers = PeerTable::parse(&text, &self.env)?;
        std::fs::write(&config_file, &text)
            .map_err(|e| CoreError::io(format!("could not write {}", config_file.display()), e))?;
        self.peers = peers;
        info!(peer = name, path, "added remote");
        Ok(())
    }

    /// Remove a peer section (and everything up to the next section) from
    /// `config.ini`.
    pub fn remove_peer(&mut self, name: &str) -> Result<(), CoreError> {
        if self.peers.get(name).is_none() {
            return Err(CommandError::PeerNotFound(name.to_string()).into());
        }
        let config_file = self.layout.config_file();
        let text = std::fs::read_to_string(&config_file)
            .map_err(|e| CoreError::io(format!("could not read {}", config_file.display()), e))?;

        let mut kept = String::with_capacity(text.len());
        let mut skipping = false;
        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(header) = trimmed.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
                skipping = header.trim() == name;
            }
            if !skipping {
                kept.push_str(line);
                kept.push('\n');
            }
        }

        let peers = PeerTable::parse(&kept, &self.env)?;
        std::fs::write(&config_file, &kept)
            .map_err(|e| CoreError::io(format!("could not write {}", config_file.display()), e))?;
        self.peers = peers;
        info!(peer = name, "removed remote");
        Ok(())
    }
}

/// Names may not be empty or contain path separators; `_` is allowed since
/// ledger records split on the first underscore only.
pub fn validate_replica_name(name: &str) -> Result<(), CommandError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.trim() != name {
        return Err(CommandError::InvalidReplicaName(name.to_string()));
    }
    Ok(())
}

/// Read the single `repo_<name>.txt` in a configuration directory.
pub fn read_replica_name(config_dir: &Path) -> Result<String, ConfigError> {
    let missing = || ConfigError::MissingReplicaName(config_dir.display().to_string());
    let entries = std::fs::read_dir(config_dir).map_err(|_| missing())?;
    let names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let file_name = e.file_name();
            layout::replica_name_from_file(&file_name.to_string_lossy()).map(str::to_string)
        })
        .collect();
    match names.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(missing()),
        _ => {
            warn!(?names, "several replica name files found");
            Err(missing())
        }
    }
}
