use std::fmt;
use std::str::FromStr;

use unicase::UniCase;

use crate::error::SearchError;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}
impl FromStr for SearchScope {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "one"|"level"|"onelevel" => Ok(Self::OneLevel),
            "sub"|"subtree" => Ok(Self::Subtree),
            other => Err(SearchError::InvalidRequest(format!("unknown search scope {:?}", other))),
        }
    }
}
impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::OneLevel => write!(f, "one"),
            Self::Subtree => write!(f, "sub"),
        }
    }
}
impl From<SearchScope> for ldap3::Scope {
    fn from(value: SearchScope) -> Self {
        match value {
            SearchScope::Base => ldap3::Scope::Base,
            SearchScope::OneLevel => ldap3::Scope::OneLevel,
            SearchScope::Subtree => ldap3::Scope::Subtree,
        }
    }
}


/// Which attributes the server should return.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum AttributeSelection {
    /// All user attributes (`*`).
    All,

    /// No attributes at all (`1.1`), only DNs.
    NoAttributes,

    /// An explicit list. An empty list asks for `objectClass` only.
    Only(Vec<String>),
}
impl AttributeSelection {
    /// The attribute list as sent on the wire.
    pub fn to_wire(&self) -> Vec<String> {
        match self {
            Self::All => vec!["*".to_owned()],
            Self::NoAttributes => vec!["1.1".to_owned()],
            Self::Only(names) if names.is_empty() => vec!["objectClass".to_owned()],
            Self::Only(names) => names.clone(),
        }
    }

    /// The wire attribute list, guaranteed to also request `extra`.
    pub fn to_wire_including(&self, extra: &str) -> Vec<String> {
        let extra_key = UniCase::new(extra);
        match self {
            Self::All => vec!["*".to_owned(), extra.to_owned()],
            Self::NoAttributes => vec![extra.to_owned()],
            Self::Only(_) => {
                let mut names = self.to_wire();
                if !names.iter().any(|n| UniCase::new(n.as_str()) == extra_key) {
                    names.push(extra.to_owned());
                }
                names
            },
        }
    }
}
impl Default for AttributeSelection {
    fn default() -> Self { Self::All }
}


/// A search as the caller describes it.
///
/// Strategies never modify a request; they derive [`SearchOperation`]s from it.
///
/// [`SearchOperation`]: crate::directory::SearchOperation
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub filter: String,
    pub scope: SearchScope,
    pub attributes: AttributeSelection,
    pub size_limit: Option<usize>,
    pub page_size: Option<usize>,
    pub use_pagination: bool,
}
impl SearchRequest {
    pub fn new<B: Into<String>, F: Into<String>>(base_dn: B, filter: F) -> Self {
        Self {
            base_dn: base_dn.into(),
            filter: filter.into(),
            scope: SearchScope::Subtree,
            attributes: AttributeSelection::All,
            size_limit: None,
            page_size: None,
            use_pagination: true,
        }
    }

    pub fn scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn attributes(mut self, attributes: AttributeSelection) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn only_attributes<I: IntoIterator<Item = S>, S: Into<String>>(self, names: I) -> Self {
        self.attributes(AttributeSelection::Only(names.into_iter().map(|n| n.into()).collect()))
    }

    pub fn size_limit(mut self, size_limit: usize) -> Self {
        self.size_limit = Some(size_limit);
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn use_pagination(mut self, use_pagination: bool) -> Self {
        self.use_pagination = use_pagination;
        self
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        if self.filter.trim().is_empty() {
            return Err(SearchError::InvalidRequest("filter must not be empty".to_owned()));
        }
        if self.page_size == Some(0) {
            return Err(SearchError::InvalidRequest("page size must be positive".to_owned()));
        }
        Ok(())
    }
}
