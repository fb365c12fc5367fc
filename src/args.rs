use std::path::{Path, PathBuf};

use clap::{Args, Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use ldapsweep::config::EngineConfig;
use ldapsweep::error::{ConfigError, SearchError};
use ldapsweep::memory::ServerQuirks;
use ldapsweep::request::{AttributeSelection, SearchRequest, SearchScope};


fn parse_scope(s: &str) -> Result<SearchScope, String> {
    s.parse().map_err(|e: SearchError| e.to_string())
}


#[derive(Clone, Debug, Parser, PartialEq)]
#[command(version, about = "Searches LDAP directories past their server-side size limits")]
pub enum Mode {
    /// Search a live LDAP server.
    Query(QueryOpts),

    /// Search an LDIF file loaded into an in-memory directory.
    Offline(OfflineOpts),
}


#[derive(Args, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct QueryOpts {
    /// LDAP URI; falls back to `uri` in the `[connection]` table of the config file.
    #[arg(short = 'H', long)]
    pub ldap_uri: Option<String>,

    #[arg(short = 'D', long, group = "auth", required = true)]
    pub bind_dn: Option<String>,

    #[arg(short = 'c', long, group = "auth", required = true)]
    pub credentials_file: Option<PathBuf>,

    #[command(flatten)]
    pub search: SearchOpts,
}


#[derive(Args, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OfflineOpts {
    #[arg(short = 'l', long)]
    pub ldif_path: PathBuf,

    /// Entries one unpaged search returns at most.
    #[arg(long)]
    pub server_size_limit: Option<usize>,

    /// Entries one search operation returns at most, across all pages.
    #[arg(long)]
    pub cumulative_limit: Option<usize>,

    /// Answer paged searches with unwillingToPerform after this many entries.
    #[arg(long)]
    pub unwilling_after: Option<usize>,

    /// Pretend the server does not know the paged results control.
    #[arg(long)]
    pub ignore_paging: bool,

    #[command(flatten)]
    pub search: SearchOpts,
}
impl OfflineOpts {
    pub fn quirks(&self) -> ServerQuirks {
        ServerQuirks {
            size_limit: self.server_size_limit,
            cumulative_limit: self.cumulative_limit,
            unwilling_after: self.unwilling_after,
            ignore_paging: self.ignore_paging,
            ..ServerQuirks::default()
        }
    }
}


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Ldif,
    Toml,
}


#[derive(Args, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SearchOpts {
    #[arg(short = 'b', long)]
    pub base_dn: Option<String>,

    #[arg(short = 's', long, default_value = "sub", value_parser = parse_scope)]
    pub scope: SearchScope,

    #[arg(short = 'f', long, default_value = "(objectClass=*)")]
    pub filter: String,

    /// Attributes to return; all user attributes if none are given.
    #[arg(short = 'a', long = "attribute")]
    pub attributes: Vec<String>,

    #[arg(short = 'z', long)]
    pub size_limit: Option<usize>,

    /// Page without probing first, using this page size.
    #[arg(short = 'p', long)]
    pub page_size: Option<usize>,

    #[arg(long)]
    pub no_paging: bool,

    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Ldif)]
    pub format: OutputFormat,
}
impl SearchOpts {
    pub fn to_request(&self, base_dn: String) -> SearchRequest {
        let attributes = if self.attributes.is_empty() {
            AttributeSelection::All
        } else {
            AttributeSelection::Only(self.attributes.clone())
        };
        let mut request = SearchRequest::new(base_dn, self.filter.clone())
            .scope(self.scope)
            .attributes(attributes)
            .use_pagination(!self.no_paging);
        if let Some(size_limit) = self.size_limit {
            request = request.size_limit(size_limit);
        }
        if let Some(page_size) = self.page_size {
            request = request.page_size(page_size);
        }
        request
    }
}


#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Credentials {
    pub bind_dn: String,
    pub password: String,
}


#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub uri: Option<String>,
    pub timeout_secs: Option<u64>,
    pub starttls: bool,
}


/// Contents of the `--config` file.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct FileConfig {
    pub engine: EngineConfig,
    pub connection: ConnectionConfig,
}
impl FileConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        Self::from_toml_str(&text)
    }
}


#[cfg(test)]
mod tests {
    use clap::Parser;

    use ldapsweep::request::{AttributeSelection, SearchScope};

    use super::{FileConfig, Mode, OutputFormat};

    #[test]
    fn test_query_args() {
        let mode = Mode::try_parse_from([
            "ldapsweep", "query",
            "-H", "ldap://ldap.example.com",
            "-D", "cn=admin,dc=example,dc=com",
            "-b", "dc=example,dc=com",
            "-s", "one",
            "-f", "(uid=j*)",
            "-a", "cn", "-a", "mail",
            "-p", "200",
        ]).unwrap();
        let Mode::Query(opts) = mode else { panic!("expected query mode") };
        assert_eq!(opts.ldap_uri.as_deref(), Some("ldap://ldap.example.com"));
        assert_eq!(opts.search.scope, SearchScope::OneLevel);
        assert_eq!(opts.search.format, OutputFormat::Ldif);

        let request = opts.search.to_request("dc=example,dc=com".to_owned());
        assert_eq!(request.filter, "(uid=j*)");
        assert_eq!(request.attributes, AttributeSelection::Only(vec!["cn".to_owned(), "mail".to_owned()]));
        assert_eq!(request.page_size, Some(200));
        assert!(request.use_pagination);
    }

    #[test]
    fn test_query_needs_credentials() {
        assert!(Mode::try_parse_from(["ldapsweep", "query", "-H", "ldap://localhost"]).is_err());
        assert!(Mode::try_parse_from(["ldapsweep", "query", "-s", "everything", "-c", "creds.toml"]).is_err());
    }

    #[test]
    fn test_offline_args() {
        let mode = Mode::try_parse_from([
            "ldapsweep", "offline",
            "-l", "people.ldif",
            "--cumulative-limit", "350",
            "-b", "ou=people,dc=example,dc=com",
            "--no-paging",
            "--format", "toml",
        ]).unwrap();
        let Mode::Offline(opts) = mode else { panic!("expected offline mode") };
        assert_eq!(opts.quirks().cumulative_limit, Some(350));
        assert_eq!(opts.quirks().size_limit, None);
        assert!(!opts.quirks().ignore_paging);
        assert_eq!(opts.search.format, OutputFormat::Toml);
        assert!(!opts.search.to_request("ou=people,dc=example,dc=com".to_owned()).use_pagination);

        let mode = Mode::try_parse_from([
            "ldapsweep", "offline", "-l", "people.ldif", "-b", "dc=example,dc=com", "--ignore-paging",
        ]).unwrap();
        let Mode::Offline(opts) = mode else { panic!("expected offline mode") };
        assert!(opts.quirks().ignore_paging);
    }

    #[test]
    fn test_file_config() {
        let config = FileConfig::from_toml_str(r#"
            [engine]
            chunk_size = 100

            [connection]
            uri = "ldaps://ldap.example.com"
            timeout_secs = 30
        "#).unwrap();
        assert_eq!(config.engine.chunk_size, 100);
        assert_eq!(config.engine.default_page_size, 500);
        assert_eq!(config.connection.uri.as_deref(), Some("ldaps://ldap.example.com"));
        assert_eq!(config.connection.timeout_secs, Some(30));
        assert!(!config.connection.starttls);

        assert_eq!(FileConfig::from_toml_str("").unwrap(), FileConfig::default());
        assert!(FileConfig::from_toml_str("[engine]\nchunk_size = 0\n").is_err());
    }
}
