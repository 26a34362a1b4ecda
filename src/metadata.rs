// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: metadata  -  firmware catalogue in the cloud
//
//  The catalogue is a Firestore collection of firmware records. Two
//  collection names are in use; the first one that yields any record wins and
//  the others are not consulted. Records were written by several generations
//  of tooling, so each attribute is looked up under both spellings it has
//  ever had. A record that cannot be mapped is skipped on its own.
//
//  REST endpoint:
//    GET https://firestore.googleapis.com/v1/projects/<project>/databases/(default)/documents/<collection>?key=<api key>
// ─────────────────────────────────────────────────────────────────────────────

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{FlashError, Result};
use crate::firmware::ImageRole;

pub const DEFAULT_COLLECTIONS: &[&str] = &["firmware_versions", "firmware"];
pub const FIRESTORE_URL: &str = "https://firestore.googleapis.com/v1";

// ── field aliases: current spelling first, legacy spelling second ───────────
const VERSION:        [&str; 2] = ["version", "version_name"];
const DESCRIPTION:    [&str; 2] = ["description", "release_notes"];
const FIRMWARE_URL:   [&str; 2] = ["firmware_url", "firmwareUrl"];
const BOOTLOADER_URL: [&str; 2] = ["bootloader_url", "bootloaderUrl"];
const PARTITIONS_URL: [&str; 2] = ["partitions_url", "partitionsUrl"];
const FILE_SIZE:      [&str; 2] = ["file_size", "fileSize"];
const CHECKSUM:       [&str; 2] = ["checksum", "sha256"];
const RECOMMENDED:    [&str; 2] = ["is_production", "isProduction"];
const RELEASED_AT:    [&str; 2] = ["release_date", "releaseDate"];

/// One remote firmware generation, as listed in the catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareDescriptor {
    pub id:             String,
    pub version:        String,
    pub description:    String,
    pub firmware_url:   String,
    pub bootloader_url: Option<String>,
    pub partitions_url: Option<String>,
    pub size:           Option<u64>,
    pub checksum:       Option<String>,
    pub recommended:    bool,
    pub released_at:    Option<DateTime<Utc>>,
}

impl FirmwareDescriptor {
    /// Every declared file with its remote location, application last.
    pub fn files(&self) -> Vec<(ImageRole, &str)> {
        let mut out = Vec::with_capacity(3);
        if let Some(u) = &self.bootloader_url {
            out.push((ImageRole::Bootloader, u.as_str()));
        }
        if let Some(u) = &self.partitions_url {
            out.push((ImageRole::PartitionTable, u.as_str()));
        }
        out.push((ImageRole::Application, self.firmware_url.as_str()));
        out
    }

    /// Map a raw record. `None` when a required attribute is missing.
    pub fn from_document(doc: &Document) -> Option<Self> {
        let f = &doc.fields;
        let version = string_field(f, &VERSION)?;
        let firmware_url = string_field(f, &FIRMWARE_URL)?;

        Some(FirmwareDescriptor {
            id:             doc.id.clone(),
            version,
            description:    string_field(f, &DESCRIPTION).unwrap_or_default(),
            firmware_url,
            bootloader_url: string_field(f, &BOOTLOADER_URL),
            partitions_url: string_field(f, &PARTITIONS_URL),
            size:           lookup(f, &FILE_SIZE).and_then(as_u64),
            checksum:       string_field(f, &CHECKSUM),
            recommended:    lookup(f, &RECOMMENDED).and_then(as_bool).unwrap_or(false),
            released_at:    lookup(f, &RELEASED_AT).and_then(as_timestamp),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Document store
// ─────────────────────────────────────────────────────────────────────────────

/// A record with plain JSON field values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub id:     String,
    pub fields: Map<String, Value>,
}

/// Read-only access to a document collection.
pub trait DocumentStore {
    fn list_documents(&self, collection: &str) -> Result<Vec<Document>>;
}

pub struct FirestoreStore {
    base_url:   String,
    project_id: String,
    api_key:    String,
    agent:      ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    documents: Vec<RawDocument>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl FirestoreStore {
    pub fn new(project_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        FirestoreStore {
            base_url:   FIRESTORE_URL.to_owned(),
            project_id: project_id.into(),
            api_key:    api_key.into(),
            agent:      ureq::AgentBuilder::new().timeout(Duration::from_secs(30)).build(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn collection_url(&self, collection: &str) -> String {
        format!(
            "{}/projects/{}/databases/(default)/documents/{}",
            self.base_url.trim_end_matches('/'),
            self.project_id,
            collection
        )
    }
}

impl DocumentStore for FirestoreStore {
    fn list_documents(&self, collection: &str) -> Result<Vec<Document>> {
        let url = self.collection_url(collection);
        let err = |reason: String| FlashError::Metadata { collection: collection.to_owned(), reason };

        let mut docs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self.agent.get(&url).query("key", &self.api_key).query("pageSize", "300");
            if let Some(t) = &page_token {
                req = req.query("pageToken", t);
            }
            debug!("metadata: GET {url}");

            let page: ListResponse = req
                .call()
                .map_err(|e| err(e.to_string()))?
                .into_json()
                .map_err(|e| err(format!("invalid response: {e}")))?;

            docs.extend(page.documents.into_iter().map(|raw| Document {
                id:     raw.name.rsplit('/').next().unwrap_or_default().to_owned(),
                fields: raw.fields.into_iter().map(|(k, v)| (k, decode_firestore(v))).collect(),
            }));

            match page.next_page_token {
                Some(t) if !t.is_empty() => page_token = Some(t),
                _ => break,
            }
        }

        Ok(docs)
    }
}

/// Convert a Firestore typed value (`{"stringValue": "x"}`) to plain JSON.
pub fn decode_firestore(v: Value) -> Value {
    let Value::Object(mut obj) = v else { return v };
    if obj.len() != 1 {
        return Value::Object(obj);
    }
    let Some((kind, inner)) = obj.iter_mut().next().map(|(k, v)| (k.clone(), v.take())) else {
        return Value::Null;
    };

    match kind.as_str() {
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" | "booleanValue" | "doubleValue" => inner,
        "integerValue" => match &inner {
            Value::String(s) => s.parse::<i64>().map(Value::from).unwrap_or(inner),
            _ => inner,
        },
        "nullValue" => Value::Null,
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|vs| vs.iter().cloned().map(decode_firestore).collect())
                .unwrap_or_default(),
        ),
        "mapValue" => Value::Object(
            inner
                .get("fields")
                .and_then(Value::as_object)
                .map(|m| m.iter().map(|(k, v)| (k.clone(), decode_firestore(v.clone()))).collect())
                .unwrap_or_default(),
        ),
        _ => {
            let mut obj = Map::new();
            obj.insert(kind, inner);
            Value::Object(obj)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Client
// ─────────────────────────────────────────────────────────────────────────────

pub struct MetadataClient<S> {
    store:       S,
    collections: Vec<String>,
}

impl<S: DocumentStore> MetadataClient<S> {
    pub fn new(store: S, collections: Vec<String>) -> Self {
        let collections = if collections.is_empty() {
            DEFAULT_COLLECTIONS.iter().map(|c| c.to_string()).collect()
        } else {
            collections
        };
        MetadataClient { store, collections }
    }

    /// Firmware descriptors from the first non-empty collection, newest first.
    pub fn fetch(&self) -> Result<Vec<FirmwareDescriptor>> {
        let mut last_err = None;

        for name in &self.collections {
            let docs = match self.store.list_documents(name) {
                Ok(d) => d,
                Err(e) => {
                    warn!("metadata: collection '{name}' failed: {e}");
                    last_err = Some(e);
                    continue;
                }
            };
            if docs.is_empty() {
                debug!("metadata: collection '{name}' is empty");
                continue;
            }

            let total = docs.len();
            let mut out: Vec<FirmwareDescriptor> = docs
                .iter()
                .filter_map(|d| {
                    let mapped = FirmwareDescriptor::from_document(d);
                    if mapped.is_none() {
                        debug!("metadata: skipping malformed record '{}'", d.id);
                    }
                    mapped
                })
                .collect();
            sort_descriptors(&mut out);
            info!("metadata: {} of {} records usable from '{name}'", out.len(), total);
            return Ok(out);
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(Vec::new()),
        }
    }

    /// Look up one version label.
    pub fn find(&self, version: &str) -> Result<FirmwareDescriptor> {
        self.fetch()?
            .into_iter()
            .find(|d| d.version == version)
            .ok_or_else(|| FlashError::UnknownVersion(version.to_owned()))
    }
}

/// Newest release first; equal or missing dates fall back to version, highest first.
pub fn sort_descriptors(list: &mut [FirmwareDescriptor]) {
    list.sort_by(|a, b| {
        let by_date = match (a.released_at, b.released_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_date.then_with(|| compare_versions(&b.version, &a.version))
    });
}

/// Numeric component-wise comparison, falling back to text for non-numeric parts.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |s: &str| -> Vec<String> {
        s.trim_start_matches(['v', 'V'])
            .split(['.', '-', '_'])
            .map(str::to_owned)
            .collect()
    };
    let (pa, pb) = (parts(a), parts(b));

    for (x, y) in pa.iter().zip(pb.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            _ => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    pa.len().cmp(&pb.len())
}

// ── tolerant field readers ──────────────────────────────────────────────────

/// First alias holding a non-null value.
fn lookup<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| fields.get(*k)).find(|v| !v.is_null())
}

/// First alias holding a usable string; null and blank values fall through.
fn string_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().filter_map(|k| fields.get(*k)).find_map(|v| match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|d| d.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .map(|d| Utc.from_utc_datetime(&d))
                })
        }
        Value::Number(n) => {
            let secs = n.as_i64()?;
            // Millisecond timestamps are also in circulation.
            let secs = if secs > 100_000_000_000 { secs / 1000 } else { secs };
            Utc.timestamp_opt(secs, 0).single()
        }
        _ => None,
    }
}
