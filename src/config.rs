//! Shared config-file parsing (§6).
//!
//! Both the server and the client binaries take a config file listing
//! every server in the deployment, one per line: `name host port`.
//! Parsing is a hand-rolled line scanner rather than a `toml`/`clap`
//! config crate — the teacher doesn't reach for one for this either,
//! and the wire format here is fixed by the original implementation's
//! `bufio.Scanner` + `strings.Split(line, " ")` convention.

use std::fmt;
use std::fs;
use std::path::Path;

/// A malformed or unreadable config file. Both `ServerError` and
/// `ClientError` convert from this so either binary can surface it
/// directly as its own error type.
#[derive(Debug)]
pub struct ConfigError(String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// One line of the config file: a server's name, host, and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub name: String,
    pub host: String,
    pub port: String,
}

impl ServerEntry {
    /// The `host:port` address this entry dials or binds.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parses every line of a config file into a [`ServerEntry`]. Blank
/// lines are skipped; a malformed line is reported as a config error
/// rather than silently ignored, since a short read here means a
/// misconfigured deployment.
pub fn parse_config_file(path: impl AsRef<Path>) -> Result<Vec<ServerEntry>, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("cannot open config file '{}': {}", path.display(), e)))?;

    let mut entries = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(ConfigError(format!(
                "{}:{}: expected 'name host port', got '{}'",
                path.display(),
                lineno + 1,
                line
            )));
        }
        entries.push(ServerEntry {
            name: fields[0].to_string(),
            host: fields[1].to_string(),
            port: fields[2].to_string(),
        });
    }

    Ok(entries)
}

/// Finds the entry naming `server_id`, as the server binary does to
/// learn which port to bind (it binds on all interfaces, so only the
/// port is used; the host field exists for the client's benefit).
pub fn find_server<'a>(entries: &'a [ServerEntry], server_id: &str) -> Option<&'a ServerEntry> {
    entries.iter().find(|e| e.name == server_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_three_field_lines_and_skips_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server1 127.0.0.1 9001").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "server2 127.0.0.1 9002").unwrap();

        let entries = parse_config_file(file.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "server1");
        assert_eq!(entries[0].addr(), "127.0.0.1:9001");
    }

    #[test]
    fn find_server_looks_up_by_name() {
        let entries = vec![
            ServerEntry { name: "a".into(), host: "h1".into(), port: "1".into() },
            ServerEntry { name: "b".into(), host: "h2".into(), port: "2".into() },
        ];
        assert_eq!(find_server(&entries, "b").unwrap().host, "h2");
        assert!(find_server(&entries, "c").is_none());
    }

    #[test]
    fn malformed_line_is_reported_as_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server1 only-two-fields").unwrap();
        assert!(parse_config_file(file.path()).is_err());
    }
}
