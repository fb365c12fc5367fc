mod args;


use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use ldapsweep::directory::{ConnectionProvider, Directory, DirectoryEntry, FlatEntry};
use ldapsweep::engine::SearchEngine;
use ldapsweep::error::{ConfigError, ConnectionError, DirectoryError, SearchError};
use ldapsweep::ldap::LdapConnector;
use ldapsweep::ldif::{parse_ldif, write_ldif};
use ldapsweep::memory::{MemoryDirectory, MemoryProvider};

use crate::args::{Credentials, FileConfig, Mode, OutputFormat, SearchOpts};


/// Exit status when only part of the result could be collected.
const EXIT_PARTIAL: u8 = 2;


#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),

    #[error("failed to {what}: {source}")]
    Io {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("failed to query RootDSE: {0}")]
    RootDse(#[from] DirectoryError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("failed to render TOML: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("failed to render LDIF")]
    Ldif(#[from] std::fmt::Error),
}


#[derive(Serialize)]
struct TomlOutput<'a> {
    entries: &'a [FlatEntry],
}


fn load_file_config(opts: &SearchOpts) -> Result<FileConfig, CliError> {
    match &opts.config {
        Some(path) => Ok(FileConfig::load(path)?),
        None => Ok(FileConfig::default()),
    }
}


fn read_file(path: &Path, what: &str) -> Result<String, CliError> {
    std::fs::read_to_string(path)
        .map_err(|source| CliError::Io { what: format!("read {} {}", what, path.display()), source })
}


fn obtain_credentials(bind_dn: Option<String>, credentials_file: Option<&Path>) -> Result<(String, String), CliError> {
    if let Some(bind_dn) = bind_dn {
        let password = rpassword::prompt_password("LDAP password: ")
            .map_err(|source| CliError::Io { what: "read LDAP password".to_owned(), source })?;
        Ok((bind_dn, password))
    } else if let Some(credentials_file) = credentials_file {
        let credentials_string = read_file(credentials_file, "credentials file")?;
        let credentials: Credentials = toml::from_str(&credentials_string)
            .map_err(ConfigError::from)?;
        Ok((credentials.bind_dn, credentials.password))
    } else {
        Err(CliError::Usage("either a bind DN or a credentials file is required".to_owned()))
    }
}


async fn get_default_naming_context(connector: &LdapConnector) -> Result<String, CliError> {
    let mut connection = connector.connect().await?;
    let naming_context = connection.default_naming_context().await;
    if let Err(e) = connection.unbind().await {
        debug!(error = %e, "unbind after RootDSE query failed");
    }
    let naming_context = naming_context?
        .ok_or_else(|| CliError::Usage("RootDSE names no naming context; pass a base DN with -b".to_owned()))?;
    info!(%naming_context, "using naming context from RootDSE");
    Ok(naming_context)
}


/// Turns a partial result into output plus a distinct exit status.
fn settle<T>(result: Result<Vec<T>, SearchError>, salvage: impl FnOnce(SearchError) -> Vec<T>) -> Result<(Vec<T>, ExitCode), CliError> {
    match result {
        Ok(entries) => Ok((entries, ExitCode::SUCCESS)),
        Err(e) if e.is_partial() => {
            warn!(error = %e, "search incomplete; printing the entries collected so far");
            Ok((salvage(e), ExitCode::from(EXIT_PARTIAL)))
        },
        Err(e) => Err(e.into()),
    }
}


fn write_stdout(output: &str) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(output.as_bytes())
        .and_then(|()| stdout.flush())
        .map_err(|source| CliError::Io { what: "write results".to_owned(), source })
}


async fn search_and_print<P: ConnectionProvider>(engine: &SearchEngine<P>, opts: &SearchOpts, base_dn: String) -> Result<ExitCode, CliError> {
    let request = opts.to_request(base_dn);
    match opts.format {
        OutputFormat::Ldif => {
            let (entries, exit_code) = settle(
                engine.search(&request).await,
                |e| e.into_entries(),
            )?;
            let mut output = String::new();
            write_ldif(&mut output, &entries)?;
            write_stdout(&output)?;
            Ok(exit_code)
        },
        OutputFormat::Toml => {
            let (entries, exit_code) = settle(
                engine.search_as_maps(&request).await,
                |e| e.flat_entries(),
            )?;
            let output = toml::to_string(&TomlOutput { entries: &entries })?;
            write_stdout(&output)?;
            Ok(exit_code)
        },
    }
}


async fn run() -> Result<ExitCode, CliError> {
    let mode = Mode::parse();

    match mode {
        Mode::Query(opts) => {
            let file_config = load_file_config(&opts.search)?;
            let uri = opts.ldap_uri
                .or(file_config.connection.uri)
                .ok_or_else(|| CliError::Usage("no LDAP URI; pass -H or set uri in [connection]".to_owned()))?;

            // obtain credentials
            let (bind_dn, password) = obtain_credentials(opts.bind_dn, opts.credentials_file.as_deref())?;

            let connector = LdapConnector::new(uri, bind_dn, password)
                .timeout(file_config.connection.timeout_secs.map(Duration::from_secs))
                .starttls(file_config.connection.starttls);
            let base_dn = match &opts.search.base_dn {
                Some(base_dn) => base_dn.clone(),
                None => get_default_naming_context(&connector).await?,
            };

            info!(uri = %connector.uri(), %base_dn, "searching");
            let engine = SearchEngine::new(connector, file_config.engine);
            search_and_print(&engine, &opts.search, base_dn).await
        },
        Mode::Offline(opts) => {
            let file_config = load_file_config(&opts.search)?;
            let base_dn = opts.search.base_dn.clone()
                .ok_or_else(|| CliError::Usage("offline mode needs a base DN (-b)".to_owned()))?;

            let ldif_string = read_file(&opts.ldif_path, "LDIF file")?;
            let entries: Vec<DirectoryEntry> = parse_ldif(&ldif_string);
            let directory = MemoryDirectory::new(entries, opts.quirks());
            info!(count = directory.len(), path = %opts.ldif_path.display(), "loaded LDIF");
            if directory.is_empty() {
                warn!("LDIF file holds no entries with usable DNs");
            }

            let engine = SearchEngine::new(MemoryProvider::new(directory), file_config.engine);
            let exit_code = search_and_print(&engine, &opts.search, base_dn).await?;

            let stats = engine.provider().directory().stats();
            info!(
                searches = stats.searches,
                paged_searches = stats.paged_searches,
                connections = stats.connections_opened,
                "offline search statistics"
            );
            Ok(exit_code)
        },
    }
}


#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    match run().await {
        Ok(exit_code) => exit_code,
        Err(e) => {
            error!(error = %e, "ldapsweep failed");
            ExitCode::FAILURE
        },
    }
}
