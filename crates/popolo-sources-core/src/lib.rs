//! Core domain model for multi-source Popolo synchronisation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "popolo-sources-core";

/// Scheme prefix used for external identifiers unless configured otherwise.
pub const DEFAULT_ID_PREFIX: &str = "popit-";

pub const MAX_SOURCE_URL_LEN: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),
    #[error("invalid source URL '{url}': {reason}")]
    InvalidSourceUrl { url: String, reason: String },
}

/// The closed set of top-level Popolo collections a source can populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Area,
    Organization,
    Post,
    Person,
    Membership,
}

impl Collection {
    /// Import order: referenced collections come before the ones that point at them.
    pub const ALL: [Collection; 5] = [
        Collection::Area,
        Collection::Organization,
        Collection::Post,
        Collection::Person,
        Collection::Membership,
    ];

    /// Singular tag, also stored as the content type of identifiers and links.
    pub fn tag(self) -> &'static str {
        match self {
            Collection::Area => "area",
            Collection::Organization => "organization",
            Collection::Post => "post",
            Collection::Person => "person",
            Collection::Membership => "membership",
        }
    }

    /// Top-level key of this collection in a Popolo JSON document.
    pub fn document_key(self) -> &'static str {
        match self {
            Collection::Area => "areas",
            Collection::Organization => "organizations",
            Collection::Post => "posts",
            Collection::Person => "persons",
            Collection::Membership => "memberships",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Collection::Area => "popolo_area",
            Collection::Organization => "popolo_organization",
            Collection::Post => "popolo_post",
            Collection::Person => "popolo_person",
            Collection::Membership => "popolo_membership",
        }
    }

    pub fn scheme(self, id_prefix: &str) -> String {
        format!("{id_prefix}{}", self.tag())
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Collection {
    type Err = CoreError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.tag() == tag)
            .ok_or_else(|| CoreError::UnknownCollection(tag.to_string()))
    }
}

/// Polymorphic pointer to one row of one collection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub collection: Collection,
    pub id: i64,
}

impl EntityRef {
    pub fn new(collection: Collection, id: i64) -> Self {
        Self { collection, id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub url: String,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PopoloSource(id={}, url='{}')", self.id, self.url)
    }
}

/// Ledger row: `entity` was imported from `source_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: i64,
    pub entity: EntityRef,
    pub source_id: i64,
    pub deleted_from_source: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIdentifier {
    pub scheme: String,
    pub identifier: String,
}

/// True for absolute http(s) URLs, the only locators a source may carry.
pub fn is_source_url(candidate: &str) -> bool {
    Url::parse(candidate)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

pub fn validate_source_url(candidate: &str) -> Result<(), CoreError> {
    let invalid = |reason: &str| CoreError::InvalidSourceUrl {
        url: candidate.to_string(),
        reason: reason.to_string(),
    };
    if candidate.len() > MAX_SOURCE_URL_LEN {
        return Err(invalid("longer than 255 characters"));
    }
    if !is_source_url(candidate) {
        return Err(invalid("not an absolute http(s) URL"));
    }
    Ok(())
}
