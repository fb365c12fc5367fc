use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, ResultEntry, SearchEntry, SearchOptions};
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults as PagedResultsAdapter};
use ldap3::controls::{Control, ControlType, PagedResults};
use tracing::{debug, info};
use unicase::UniCase;

use crate::directory::{
    ConnectionProvider, Directory, DirectoryEntry, PagingResponse, ResultCode, SearchOperation,
    SearchPage,
};
use crate::error::{ConnectionError, DirectoryError};
use crate::request::SearchScope;


fn to_ldap_size(size: usize) -> i32 {
    i32::try_from(size).unwrap_or(i32::MAX)
}

fn convert_entry(ldap_entry: ResultEntry) -> DirectoryEntry {
    let search_entry = SearchEntry::construct(ldap_entry);
    let mut attributes = BTreeMap::new();
    for (key, string_values) in search_entry.attrs {
        let all_values: &mut Vec<Vec<u8>> = attributes
            .entry(UniCase::new(key))
            .or_insert_with(|| Vec::new());
        for string_value in string_values {
            all_values.push(string_value.into_bytes());
        }
    }
    for (key, bytes_values) in search_entry.bin_attrs {
        let all_values = attributes
            .entry(UniCase::new(key))
            .or_insert_with(|| Vec::new());
        all_values.extend(bytes_values);
    }
    DirectoryEntry {
        dn: UniCase::new(search_entry.dn),
        attributes,
    }
}

fn paging_response(controls: &[Control]) -> Option<PagingResponse> {
    controls.iter().find_map(|Control(kind, raw)| match kind {
        Some(ControlType::PagedResults) => {
            let paged: PagedResults = raw.parse();
            Some(PagingResponse {
                cookie: paged.cookie,
                estimated_size: usize::try_from(paged.size).ok().filter(|s| *s > 0),
            })
        },
        _ => None,
    })
}


/// A bound connection to a live LDAP server.
#[derive(Debug)]
pub struct LdapConnection {
    ldap: Ldap,
    timeout: Option<Duration>,
}
impl LdapConnection {
    pub fn new(ldap: Ldap, timeout: Option<Duration>) -> Self { Self { ldap, timeout } }

    fn prepare(&mut self, operation: &SearchOperation) -> &mut Ldap {
        if let Some(timeout) = self.timeout {
            self.ldap.with_timeout(timeout);
        }
        if let Some(size_limit) = operation.size_limit {
            self.ldap.with_search_options(SearchOptions::new().sizelimit(to_ldap_size(size_limit)));
        }
        &mut self.ldap
    }

    /// Reads the naming context to search under from the RootDSE.
    ///
    /// Prefers `defaultNamingContext` (Active Directory) and falls back to
    /// the first of `namingContexts`.
    pub async fn default_naming_context(&mut self) -> Result<Option<String>, DirectoryError> {
        let operation = SearchOperation {
            base_dn: String::new(),
            scope: SearchScope::Base,
            filter: "(objectClass=*)".to_owned(),
            attributes: vec!["defaultNamingContext".to_owned(), "namingContexts".to_owned()],
            size_limit: None,
            paging: None,
        };
        let page = self.search(&operation).await?;
        if page.result_code != ResultCode::Success {
            return Err(DirectoryError::ResultCode { code: page.result_code, message: page.message });
        }
        let Some(root_dse) = page.entries.first() else { return Ok(None) };
        let naming_context = root_dse.first_string("defaultNamingContext")
            .or_else(|| root_dse.first_string("namingContexts"))
            .map(|nc| nc.into_owned());
        Ok(naming_context)
    }
}
#[async_trait]
impl Directory for LdapConnection {
    async fn search(&mut self, operation: &SearchOperation) -> Result<SearchPage, DirectoryError> {
        let ldap = self.prepare(operation);
        if let Some(paging) = &operation.paging {
            ldap.with_controls(PagedResults {
                size: to_ldap_size(paging.size),
                cookie: paging.cookie.clone(),
            });
        }

        let ldap3::SearchResult(ldap_entries, ldap_result) = ldap.search(
            &operation.base_dn,
            operation.scope.into(),
            &operation.filter,
            operation.attributes.clone(),
        ).await?;
        debug!(
            base = %operation.base_dn,
            filter = %operation.filter,
            rc = ldap_result.rc,
            count = ldap_entries.len(),
            "search returned"
        );

        Ok(SearchPage {
            entries: ldap_entries.into_iter().map(convert_entry).collect(),
            result_code: ResultCode::from(ldap_result.rc),
            paging: paging_response(&ldap_result.ctrls),
            message: ldap_result.text,
        })
    }

    async fn paged_search(&mut self, operation: &SearchOperation, page_size: usize) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResultsAdapter::new(to_ldap_size(page_size))),
        ];
        let ldap = self.prepare(operation);
        let mut stream = ldap.streaming_search_with(
            adapters,
            &operation.base_dn,
            operation.scope.into(),
            &operation.filter,
            operation.attributes.clone(),
        ).await?;

        let mut entries = Vec::new();
        while let Some(ldap_entry) = stream.next().await? {
            entries.push(convert_entry(ldap_entry));
        }
        let ldap_result = stream.finish().await;
        if ldap_result.rc != 0 {
            return Err(DirectoryError::ResultCode {
                code: ResultCode::from(ldap_result.rc),
                message: ldap_result.text,
            });
        }
        Ok(entries)
    }

    async fn unbind(&mut self) -> Result<(), DirectoryError> {
        self.ldap.unbind().await?;
        Ok(())
    }
}


/// Opens and binds a new connection per strategy attempt.
#[derive(Clone)]
pub struct LdapConnector {
    uri: String,
    bind_dn: String,
    password: String,
    timeout: Option<Duration>,
    starttls: bool,
}
impl LdapConnector {
    pub fn new(uri: String, bind_dn: String, password: String) -> Self {
        Self {
            uri,
            bind_dn,
            password,
            timeout: None,
            starttls: false,
        }
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    pub fn uri(&self) -> &str { &self.uri }
}
#[async_trait]
impl ConnectionProvider for LdapConnector {
    type Connection = LdapConnection;

    async fn connect(&self) -> Result<Self::Connection, ConnectionError> {
        let mut settings = LdapConnSettings::new()
            .set_starttls(self.starttls);
        if let Some(timeout) = self.timeout {
            settings = settings.set_conn_timeout(timeout);
        }

        // connect to LDAP
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.uri)
            .await
            .map_err(|source| ConnectionError::Connect { uri: self.uri.clone(), source })?;
        ldap3::drive!(conn);

        // bind
        if let Some(timeout) = self.timeout {
            ldap.with_timeout(timeout);
        }
        let bind_result = ldap.simple_bind(&self.bind_dn, &self.password).await?;
        if bind_result.rc != 0 {
            return Err(ConnectionError::Bind {
                bind_dn: self.bind_dn.clone(),
                code: ResultCode::from(bind_result.rc),
                message: bind_result.text,
            });
        }
        info!(uri = %self.uri, bind_dn = %self.bind_dn, "bound to LDAP server");

        Ok(LdapConnection::new(ldap, self.timeout))
    }
}
