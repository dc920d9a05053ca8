//! Ignition payload carried inside a MachineConfig
//!
//! The parts of the Ignition v3 document the controllers reason about are
//! typed: the Ignition version, files, systemd units and passwd users. Every
//! other field is kept verbatim in the `extra` map of its enclosing section, so
//! nothing a fragment carries is lost on a round trip. File contents are
//! RFC 2397 `data:` URLs, either percent-encoded or base64.

use std::collections::BTreeMap;

use base64::Engine;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Error;

/// Ignition spec version written into every merged config
pub const IGNITION_VERSION: &str = "3.2.0";

/// An Ignition v3 document
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IgnitionConfig {
    /// Document metadata
    #[serde(default)]
    pub ignition: IgnitionMeta,

    /// Files to write
    #[serde(default)]
    pub storage: Storage,

    /// systemd units to install
    #[serde(default)]
    pub systemd: Systemd,

    /// Users and groups
    #[serde(default, skip_serializing_if = "Passwd::is_empty")]
    pub passwd: Passwd,

    /// Sections not modeled above
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Ignition document metadata
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IgnitionMeta {
    /// Spec version, e.g. "3.2.0". Empty means "unspecified".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Other metadata, e.g. `config`, `security`, `timeouts`
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Ignition storage section
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    /// Files to write
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,

    /// Directories, links, disks, filesystems and the rest of the section
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Ignition systemd section
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Systemd {
    /// Units to install
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<Unit>,

    /// Fields not modeled above
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Ignition passwd section
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Passwd {
    /// Users to create or modify
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<PasswdUser>,

    /// Groups and other fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A user in the passwd section
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PasswdUser {
    /// Login name
    pub name: String,

    /// Authorized SSH public keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,

    /// Password hash, groups, shell and the rest
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A file written to the node's filesystem
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct File {
    /// Absolute path on the node
    pub path: String,

    /// File contents
    #[serde(default)]
    pub contents: FileContents,

    /// Permission bits (decimal)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<i32>,

    /// Whether an existing file is replaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<bool>,

    /// Owner, group, append and the rest
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Source of a file's contents
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileContents {
    /// A `data:` URL holding the contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Compression, verification and the rest
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A systemd unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    /// Unit name including suffix, e.g. "kubelet.service"
    pub name: String,

    /// Whether the unit is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Whether the unit is masked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<bool>,

    /// Unit file contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,

    /// Drop-ins and other fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl IgnitionConfig {
    /// An empty document at the canonical spec version
    pub fn empty() -> Self {
        Self {
            ignition: IgnitionMeta {
                version: IGNITION_VERSION.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Look up a file by path
    pub fn file(&self, path: &str) -> Option<&File> {
        self.storage.files.iter().find(|f| f.path == path)
    }

    /// Decode the contents of the file at `path`
    ///
    /// Returns `Ok(None)` when the document has no such file.
    pub fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, Error> {
        match self.file(path) {
            Some(file) => file.decoded_contents().map(Some),
            None => Ok(None),
        }
    }

    /// Insert a file, replacing any file already at the same path
    pub fn upsert_file(&mut self, file: File) {
        match self.storage.files.iter_mut().find(|f| f.path == file.path) {
            Some(existing) => *existing = file,
            None => self.storage.files.push(file),
        }
    }

    /// Remove the file at `path`, returning it if present
    pub fn remove_file(&mut self, path: &str) -> Option<File> {
        let idx = self.storage.files.iter().position(|f| f.path == path)?;
        Some(self.storage.files.remove(idx))
    }

    /// Insert a unit, replacing any unit with the same name
    pub fn upsert_unit(&mut self, unit: Unit) {
        match self.systemd.units.iter_mut().find(|u| u.name == unit.name) {
            Some(existing) => *existing = unit,
            None => self.systemd.units.push(unit),
        }
    }
}

impl File {
    /// Build a file whose contents are the given bytes, encoded as a base64 data URL
    pub fn from_bytes(path: impl Into<String>, data: &[u8], mode: i32) -> Self {
        Self {
            path: path.into(),
            contents: FileContents {
                source: Some(encode_data_url(data)),
                ..Default::default()
            },
            mode: Some(mode),
            overwrite: Some(true),
            ..Default::default()
        }
    }

    /// Decode this file's contents. A file without a source is empty.
    pub fn decoded_contents(&self) -> Result<Vec<u8>, Error> {
        match self.contents.source.as_deref() {
            Some(source) => decode_data_url(source)
                .map_err(|e| Error::serialization(format!("file {}: {}", self.path, e))),
            None => Ok(Vec::new()),
        }
    }
}

impl Passwd {
    /// Whether the section holds nothing
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.extra.is_empty()
    }

    /// Merge `other` into this section.
    ///
    /// Users are keyed by name. A user already present keeps its SSH keys and
    /// gains any new ones from `other`; its other fields are merged with
    /// [`merge_extra`].
    pub fn merge(&mut self, other: &Passwd) {
        for user in &other.users {
            match self.users.iter_mut().find(|u| u.name == user.name) {
                Some(existing) => {
                    for key in &user.ssh_authorized_keys {
                        if !existing.ssh_authorized_keys.contains(key) {
                            existing.ssh_authorized_keys.push(key.clone());
                        }
                    }
                    merge_extra(&mut existing.extra, &user.extra);
                }
                None => self.users.push(user.clone()),
            }
        }
        merge_extra(&mut self.extra, &other.extra);
    }
}

/// Fields identifying an entry of an Ignition list, in lookup order
const ENTRY_KEYS: &[&str] = &["path", "name", "device"];

/// Merge unmodeled fields of a later fragment into `into`.
///
/// Objects merge field by field. Lists whose entries carry a `path`, `name`
/// or `device` replace the entry with the same key and append the others;
/// plain lists append values not already present. Anything else is replaced.
pub fn merge_extra(into: &mut BTreeMap<String, Value>, from: &BTreeMap<String, Value>) {
    for (key, value) in from {
        match into.get_mut(key) {
            Some(existing) => merge_value(existing, value),
            None => {
                into.insert(key.clone(), value.clone());
            }
        }
    }
}

fn merge_value(into: &mut Value, from: &Value) {
    match (into, from) {
        (Value::Object(into), Value::Object(from)) => merge_object(into, from),
        (Value::Array(into), Value::Array(from)) => merge_list(into, from),
        (into, from) => *into = from.clone(),
    }
}

fn merge_object(into: &mut Map<String, Value>, from: &Map<String, Value>) {
    for (key, value) in from {
        match into.get_mut(key) {
            Some(existing) => merge_value(existing, value),
            None => {
                into.insert(key.clone(), value.clone());
            }
        }
    }
}

fn merge_list(into: &mut Vec<Value>, from: &[Value]) {
    for item in from {
        let keyed = entry_key(item)
            .and_then(|key| into.iter().position(|e| entry_key(e) == Some(key)));
        match keyed {
            Some(idx) => into[idx] = item.clone(),
            None if !into.contains(item) => into.push(item.clone()),
            None => {}
        }
    }
}

fn entry_key(value: &Value) -> Option<(&'static str, &str)> {
    let object = value.as_object()?;
    ENTRY_KEYS
        .iter()
        .find_map(|k| object.get(*k).and_then(Value::as_str).map(|v| (*k, v)))
}

/// Encode bytes as a `data:;base64,` URL
pub fn encode_data_url(data: &[u8]) -> String {
    format!(
        "data:;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(data)
    )
}

/// Decode an RFC 2397 `data:` URL
///
/// Supports both `data:;base64,<payload>` and the percent-encoded
/// `data:,<payload>` form Ignition configs are usually written in.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>, String> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| format!("unsupported source scheme in {:?}", truncate(url)))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| "data URL is missing ','".to_string())?;

    if header.split(';').any(|p| p.eq_ignore_ascii_case("base64")) {
        let cleaned = percent_decode(payload)?;
        base64::engine::general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|e| format!("invalid base64 payload: {}", e))
    } else {
        percent_decode(payload)
    }
}

fn percent_decode(input: &str) -> Result<Vec<u8>, String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| "truncated percent escape".to_string())?;
            let hex = std::str::from_utf8(hex).map_err(|e| e.to_string())?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| format!("invalid percent escape %{}", hex))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(32) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
