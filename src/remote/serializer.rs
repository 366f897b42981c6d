use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};

use crate::error::{internal_error, invalid_argument, SyncError, SyncErrorCode, SyncResult};
use crate::model::{Document, DocumentKey, SnapshotVersion, Timestamp};
use crate::remote::mutation::{Mutation, MutationResult, Precondition};
use crate::remote::query_data::QueryData;
use crate::remote::watch_change::{
    DocumentChange, ExistenceFilter, TargetChangeState, WatchChange, WatchTargetChange,
};

/// Decoded write-stream response: either the handshake ack or a mutation ack.
/// The stream token is refreshed on every response.
#[derive(Debug, Clone)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub results: Vec<MutationResult>,
}

/// Result of a unary document lookup.
#[derive(Debug, Clone)]
pub struct DocumentLookup {
    pub key: DocumentKey,
    pub document: Option<Document>,
    /// Version the read is valid at; the document's update time when found,
    /// the server read time (or `NONE`) when missing.
    pub read_version: SnapshotVersion,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

/// Translates between typed requests/responses and the backend's JSON frame
/// protocol.
#[derive(Clone, Debug)]
pub struct WireSerializer {
    database: String,
}

impl WireSerializer {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
        }
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }

    fn document_name(&self, key: &DocumentKey) -> String {
        format!("{}/documents/{}", self.database, key.path())
    }

    fn document_key_from_name(&self, name: &str) -> SyncResult<DocumentKey> {
        let prefix = format!("{}/documents/", self.database);
        let path = name.strip_prefix(&prefix).ok_or_else(|| {
            invalid_argument(format!("document name outside this database: {name}"))
        })?;
        DocumentKey::parse(path)
    }

    // ---- requests ----------------------------------------------------------

    pub fn encode_watch_request(&self, target: &QueryData) -> SyncResult<Vec<u8>> {
        let mut add_target = Map::new();
        add_target.insert("targetId".to_string(), json!(target.target_id()));

        let query = target.query();
        let parent = if query.parent().is_empty() {
            format!("{}/documents", self.database)
        } else {
            format!("{}/documents/{}", self.database, query.parent())
        };
        add_target.insert(
            "query".to_string(),
            json!({
                "parent": parent,
                "structuredQuery": {
                    "from": [{
                        "collectionId": query.collection_id(),
                        "allDescendants": query.all_descendants(),
                    }],
                },
            }),
        );
        if !target.resume_token().is_empty() {
            add_target.insert(
                "resumeToken".to_string(),
                json!(BASE64_STANDARD.encode(target.resume_token())),
            );
        }

        let mut request = Map::new();
        request.insert("database".to_string(), json!(self.database));
        request.insert("addTarget".to_string(), JsonValue::Object(add_target));
        if let Some(label) = target.purpose().label() {
            request.insert("labels".to_string(), json!({ "sync-tag": label }));
        }

        encode_frame(&JsonValue::Object(request))
    }

    pub fn encode_unwatch_request(&self, target_id: i32) -> SyncResult<Vec<u8>> {
        encode_frame(&json!({
            "database": self.database,
            "removeTarget": target_id,
        }))
    }

    pub fn encode_write_handshake(&self, stream_token: &[u8]) -> SyncResult<Vec<u8>> {
        let mut request = Map::new();
        request.insert("database".to_string(), json!(self.database));
        if !stream_token.is_empty() {
            request.insert(
                "streamToken".to_string(),
                json!(BASE64_STANDARD.encode(stream_token)),
            );
        }
        encode_frame(&JsonValue::Object(request))
    }

    pub fn encode_write_request(
        &self,
        stream_token: &[u8],
        mutations: &[Mutation],
    ) -> SyncResult<Vec<u8>> {
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.encode_mutation(mutation))
            .collect();
        encode_frame(&json!({
            "streamToken": BASE64_STANDARD.encode(stream_token),
            "writes": writes,
        }))
    }

    pub fn encode_lookup_request(&self, keys: &[DocumentKey]) -> SyncResult<Vec<u8>> {
        let names: Vec<String> = keys.iter().map(|key| self.document_name(key)).collect();
        encode_frame(&json!({
            "database": self.database,
            "documents": names,
        }))
    }

    pub fn encode_commit_request(&self, mutations: &[Mutation]) -> SyncResult<Vec<u8>> {
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.encode_mutation(mutation))
            .collect();
        encode_frame(&json!({
            "database": self.database,
            "writes": writes,
        }))
    }

    fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = match mutation {
            Mutation::Set { key, value, .. } => json!({
                "update": {
                    "name": self.document_name(key),
                    "fields": value,
                },
            }),
            Mutation::Patch { key, value, .. } => json!({
                "update": {
                    "name": self.document_name(key),
                    "fields": value,
                },
                "updateMask": {
                    "fieldPaths": value.keys().collect::<Vec<_>>(),
                },
            }),
            Mutation::Delete { key, .. } => json!({
                "delete": self.document_name(key),
            }),
            Mutation::Verify { key, .. } => json!({
                "verify": self.document_name(key),
            }),
        };

        if let Some(precondition) = encode_precondition(mutation.precondition()) {
            if let Some(object) = write.as_object_mut() {
                object.insert("currentDocument".to_string(), precondition);
            }
        }
        write
    }

    // ---- responses ---------------------------------------------------------

    /// Decodes one watch frame. Unrecognised frames decode to `None` so newer
    /// servers can add frame kinds without breaking older clients.
    pub fn decode_watch_change(&self, payload: &[u8]) -> SyncResult<Option<WatchChange>> {
        let value: JsonValue = serde_json::from_slice(payload)
            .map_err(|err| internal_error(format!("failed to decode watch frame: {err}")))?;

        if let Some(target_change) = value.get("targetChange") {
            return self.decode_target_change(target_change).map(Some);
        }
        if let Some(document_change) = value.get("documentChange") {
            return self.decode_document_change(document_change).map(Some);
        }
        if let Some(document_delete) = value.get("documentDelete") {
            return self.decode_document_delete(document_delete).map(Some);
        }
        if let Some(filter) = value.get("filter") {
            return decode_filter_change(filter).map(Some);
        }

        Ok(None)
    }

    fn decode_target_change(&self, value: &JsonValue) -> SyncResult<WatchChange> {
        let target_ids = numeric_array(value.get("targetIds"));

        let resume_token = value
            .get("resumeToken")
            .and_then(JsonValue::as_str)
            .and_then(|token| BASE64_STANDARD.decode(token).ok())
            .unwrap_or_default();

        let read_time = value
            .get("readTime")
            .map(decode_timestamp)
            .transpose()?
            .map(SnapshotVersion::new);

        let state = value
            .get("targetChangeType")
            .and_then(JsonValue::as_str)
            .map(target_state_from_str)
            .unwrap_or(TargetChangeState::NoChange);

        let cause = value
            .get("cause")
            .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
            .transpose()
            .map_err(|err| internal_error(format!("failed to decode watch cause: {err}")))?
            .map(|cause| {
                SyncError::new(
                    SyncErrorCode::from_rpc_code(cause.code),
                    cause
                        .message
                        .unwrap_or_else(|| "watch target removed".to_string()),
                )
            });

        Ok(WatchChange::TargetChange(WatchTargetChange {
            state,
            target_ids,
            resume_token,
            read_time,
            cause,
        }))
    }

    fn decode_document_change(&self, value: &JsonValue) -> SyncResult<WatchChange> {
        let updated_target_ids = numeric_array(value.get("targetIds"));
        let removed_target_ids = numeric_array(value.get("removedTargetIds"));
        let document = value
            .get("document")
            .ok_or_else(|| invalid_argument("documentChange missing document"))?;
        let document = self.decode_document(document)?;

        Ok(WatchChange::DocumentChange(DocumentChange {
            updated_target_ids,
            removed_target_ids,
            key: document.key.clone(),
            document: Some(document),
        }))
    }

    fn decode_document_delete(&self, value: &JsonValue) -> SyncResult<WatchChange> {
        let name = value
            .get("document")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("documentDelete missing document"))?;
        let key = self.document_key_from_name(name)?;
        let removed_target_ids = numeric_array(value.get("removedTargetIds"));

        Ok(WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: Vec::new(),
            removed_target_ids,
            key,
            document: None,
        }))
    }

    fn decode_document(&self, value: &JsonValue) -> SyncResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let fields = value
            .get("fields")
            .and_then(JsonValue::as_object)
            .cloned()
            .unwrap_or_default();
        let update_time = value.get("updateTime").map(decode_timestamp).transpose()?;

        Ok(Document {
            key,
            fields,
            update_time,
        })
    }

    pub fn decode_write_response(&self, payload: &[u8]) -> SyncResult<WriteResponse> {
        let value: JsonValue = serde_json::from_slice(payload)
            .map_err(|err| internal_error(format!("failed to decode write response: {err}")))?;

        let stream_token = value
            .get("streamToken")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| internal_error("write response missing streamToken"))?;
        let stream_token = BASE64_STANDARD
            .decode(stream_token)
            .map_err(|err| internal_error(format!("invalid streamToken: {err}")))?;

        let commit_version = value
            .get("commitTime")
            .map(decode_timestamp)
            .transpose()?
            .map(SnapshotVersion::new)
            .unwrap_or(SnapshotVersion::NONE);

        let results = decode_mutation_results(value.get("writeResults"))?;

        Ok(WriteResponse {
            stream_token,
            commit_version,
            results,
        })
    }

    pub fn decode_lookup_response(&self, payload: &[u8]) -> SyncResult<Vec<DocumentLookup>> {
        let value: JsonValue = serde_json::from_slice(payload)
            .map_err(|err| internal_error(format!("failed to decode lookup response: {err}")))?;
        let entries = value
            .get("documents")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| internal_error("lookup response missing documents"))?;

        entries
            .iter()
            .map(|entry| {
                if let Some(found) = entry.get("found") {
                    let document = self.decode_document(found)?;
                    let read_version = document
                        .update_time
                        .map(SnapshotVersion::new)
                        .unwrap_or(SnapshotVersion::NONE);
                    Ok(DocumentLookup {
                        key: document.key.clone(),
                        document: Some(document),
                        read_version,
                    })
                } else if let Some(missing) = entry.get("missing").and_then(JsonValue::as_str) {
                    Ok(DocumentLookup {
                        key: self.document_key_from_name(missing)?,
                        document: None,
                        read_version: SnapshotVersion::NONE,
                    })
                } else {
                    Err(internal_error("lookup entry neither found nor missing"))
                }
            })
            .collect()
    }

    pub fn decode_commit_response(
        &self,
        payload: &[u8],
    ) -> SyncResult<(SnapshotVersion, Vec<MutationResult>)> {
        let value: JsonValue = serde_json::from_slice(payload)
            .map_err(|err| internal_error(format!("failed to decode commit response: {err}")))?;
        let commit_version = value
            .get("commitTime")
            .map(decode_timestamp)
            .transpose()?
            .map(SnapshotVersion::new)
            .unwrap_or(SnapshotVersion::NONE);
        let results = decode_mutation_results(value.get("writeResults"))?;
        Ok((commit_version, results))
    }
}

fn encode_frame(value: &JsonValue) -> SyncResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| internal_error(format!("failed to encode frame: {err}")))
}

fn encode_precondition(precondition: &Precondition) -> Option<JsonValue> {
    match precondition {
        Precondition::None => None,
        Precondition::Exists(exists) => Some(json!({ "exists": exists })),
        Precondition::UpdateTime(time) => Some(json!({ "updateTime": encode_timestamp(time) })),
    }
}

pub(crate) fn encode_timestamp(timestamp: &Timestamp) -> JsonValue {
    json!({ "seconds": timestamp.seconds, "nanos": timestamp.nanos })
}

pub(crate) fn decode_timestamp(value: &JsonValue) -> SyncResult<Timestamp> {
    let seconds = value
        .get("seconds")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("timestamp missing seconds"))?;
    let nanos = value
        .get("nanos")
        .and_then(JsonValue::as_i64)
        .unwrap_or(0);
    Ok(Timestamp::new(seconds, nanos as i32))
}

fn decode_mutation_results(value: Option<&JsonValue>) -> SyncResult<Vec<MutationResult>> {
    value
        .and_then(JsonValue::as_array)
        .map(|results| {
            results
                .iter()
                .map(|entry| {
                    let update_time = entry
                        .get("updateTime")
                        .map(decode_timestamp)
                        .transpose()?;
                    Ok(MutationResult { update_time })
                })
                .collect::<SyncResult<Vec<_>>>()
        })
        .transpose()
        .map(Option::unwrap_or_default)
}

fn decode_filter_change(value: &JsonValue) -> SyncResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as i32;
    let count = value
        .get("count")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing count"))? as i32;
    Ok(WatchChange::ExistenceFilter(ExistenceFilter {
        target_id,
        count,
    }))
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<i32> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|id| id as i32))
                .collect()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "NO_CHANGE" => TargetChangeState::NoChange,
        "ADD" => TargetChangeState::Added,
        "REMOVE" => TargetChangeState::Removed,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}
