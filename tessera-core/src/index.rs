//! String-tag inverted indexes, stored as regular records.
//!
//! Each tag owns an index object keyed by `transform("index\0" + tag)`
//! holding the set of member keys with their per-key payloads; each key
//! owns a back-reference object listing the tags it is filed under, which
//! is what makes clearing and re-tagging possible.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::{Result, StoreError};
use crate::id::ObjectId;
use crate::io_attr::IoAttr;

fn tag_object_id(tag: &str) -> ObjectId {
    let mut raw = b"index\0".to_vec();
    raw.extend_from_slice(tag.as_bytes());
    ObjectId::transform(&raw)
}

fn key_tags_object_id(key: &ObjectId) -> ObjectId {
    let mut raw = b"index-of\0".to_vec();
    raw.extend_from_slice(key.as_bytes());
    ObjectId::transform(&raw)
}

mod base64_bytes {
    use super::*;
    use serde::de::Error as _;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Vec<u8>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(D::Error::custom)
    }
}

/// One `(tag, payload)` pair attached to a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPayload {
    pub tag: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSetRequest {
    pub key: ObjectId,
    pub entries: Vec<TagPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindMode {
    /// Keys present in every requested tag.
    All,
    /// Keys present in at least one requested tag.
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFindRequest {
    pub mode: FindMode,
    pub tags: Vec<String>,
}

/// One matching key with its payload under every tag that contains it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindIndexResult {
    pub key: ObjectId,
    pub entries: Vec<TagPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    key: ObjectId,
    #[serde(with = "base64_bytes")]
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexObject {
    entries: Vec<IndexEntry>,
}

async fn load_json<T: Default + for<'de> Deserialize<'de>>(
    backend: &dyn Backend,
    id: &ObjectId,
) -> Result<T> {
    match backend.read(id, 0, 0).await {
        Ok(record) => Ok(serde_json::from_slice(&record.data)?),
        Err(StoreError::NotFound) => Ok(T::default()),
        Err(error) => Err(error),
    }
}

async fn store_json<T: Serialize>(backend: &dyn Backend, id: &ObjectId, value: &T) -> Result<()> {
    let raw = serde_json::to_vec(value)?;
    backend
        .write(&IoAttr::new(*id), Bytes::from(raw))
        .await
        .map(|_| ())
}

/// Replace the full tag set of `request.key`. An empty entry list clears
/// every index the key was filed under.
pub async fn set_indexes(backend: &dyn Backend, request: &IndexSetRequest) -> Result<()> {
    let tags_id = key_tags_object_id(&request.key);
    let old_tags: Vec<String> = load_json(backend, &tags_id).await?;
    let new_tags: Vec<String> = request.entries.iter().map(|e| e.tag.clone()).collect();

    // Unlink from tags the key no longer carries.
    for tag in old_tags.iter().filter(|tag| !new_tags.contains(tag)) {
        let object_id = tag_object_id(tag);
        let mut object: IndexObject = load_json(backend, &object_id).await?;
        object.entries.retain(|entry| entry.key != request.key);
        store_json(backend, &object_id, &object).await?;
    }

    for entry in &request.entries {
        let object_id = tag_object_id(&entry.tag);
        let mut object: IndexObject = load_json(backend, &object_id).await?;
        match object.entries.iter_mut().find(|e| e.key == request.key) {
            Some(existing) => existing.payload = entry.payload.clone(),
            None => object.entries.push(IndexEntry {
                key: request.key,
                payload: entry.payload.clone(),
            }),
        }
        store_json(backend, &object_id, &object).await?;
    }

    if new_tags.is_empty() {
        match backend.remove(&tags_id).await {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(error) => return Err(error),
        }
    } else {
        store_json(backend, &tags_id, &new_tags).await?;
    }

    tracing::debug!(
        "indexed key {} under {} tags (was {})",
        request.key,
        new_tags.len(),
        old_tags.len()
    );
    Ok(())
}

/// Resolve a find request into matching keys and their tag payloads.
pub async fn find_indexes(
    backend: &dyn Backend,
    request: &IndexFindRequest,
) -> Result<Vec<FindIndexResult>> {
    let mut per_tag: Vec<(String, IndexObject)> = Vec::with_capacity(request.tags.len());
    for tag in &request.tags {
        let object: IndexObject = load_json(backend, &tag_object_id(tag)).await?;
        per_tag.push((tag.clone(), object));
    }

    let mut keys: Vec<ObjectId> = Vec::new();
    for (_, object) in &per_tag {
        for entry in &object.entries {
            if !keys.contains(&entry.key) {
                keys.push(entry.key);
            }
        }
    }

    let mut results = Vec::new();
    for key in keys {
        let entries: Vec<TagPayload> = per_tag
            .iter()
            .filter_map(|(tag, object)| {
                object
                    .entries
                    .iter()
                    .find(|entry| entry.key == key)
                    .map(|entry| TagPayload {
                        tag: tag.clone(),
                        payload: entry.payload.clone(),
                    })
            })
            .collect();

        let matches = match request.mode {
            FindMode::All => entries.len() == request.tags.len(),
            FindMode::Any => !entries.is_empty(),
        };
        if matches {
            results.push(FindIndexResult { key, entries });
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn entries(key_tag_pairs: &[(&str, &str)]) -> Vec<TagPayload> {
        key_tag_pairs
            .iter()
            .map(|(tag, payload)| TagPayload {
                tag: tag.to_string(),
                payload: payload.as_bytes().to_vec(),
            })
            .collect()
    }

    #[tokio::test]
    async fn set_then_find_all_and_any() {
        let backend = MemoryBackend::new();
        let key = ObjectId::transform(b"document");
        let tags = ["fast", "distributed", "reliable"];

        set_indexes(
            &backend,
            &IndexSetRequest {
                key,
                entries: entries(&[("fast", "p0"), ("distributed", "p1"), ("reliable", "p2")]),
            },
        )
        .await
        .unwrap();

        let all = find_indexes(
            &backend,
            &IndexFindRequest {
                mode: FindMode::All,
                tags: tags.iter().map(|t| t.to_string()).collect(),
            },
        )
        .await
        .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, key);
        assert_eq!(all[0].entries.len(), 3);

        let any = find_indexes(
            &backend,
            &IndexFindRequest {
                mode: FindMode::Any,
                tags: tags.iter().map(|t| t.to_string()).collect(),
            },
        )
        .await
        .unwrap();
        assert_eq!(any.len(), all.len());
    }

    #[tokio::test]
    async fn find_all_requires_every_tag() {
        let backend = MemoryBackend::new();
        let partial = ObjectId::transform(b"partial");
        let full = ObjectId::transform(b"full");

        set_indexes(
            &backend,
            &IndexSetRequest { key: partial, entries: entries(&[("a", "")]) },
        )
        .await
        .unwrap();
        set_indexes(
            &backend,
            &IndexSetRequest { key: full, entries: entries(&[("a", ""), ("b", "")]) },
        )
        .await
        .unwrap();

        let request = IndexFindRequest {
            mode: FindMode::All,
            tags: vec!["a".to_string(), "b".to_string()],
        };
        let all = find_indexes(&backend, &request).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, full);

        let any = find_indexes(
            &backend,
            &IndexFindRequest {
                mode: FindMode::Any,
                tags: vec!["a".to_string(), "b".to_string()],
            },
        )
        .await
        .unwrap();
        assert_eq!(any.len(), 2);
    }

    #[tokio::test]
    async fn empty_set_clears_previous_tags() {
        let backend = MemoryBackend::new();
        let key = ObjectId::transform(b"cleared");

        set_indexes(
            &backend,
            &IndexSetRequest { key, entries: entries(&[("x", ""), ("y", "")]) },
        )
        .await
        .unwrap();

        set_indexes(&backend, &IndexSetRequest { key, entries: Vec::new() })
            .await
            .unwrap();

        let any = find_indexes(
            &backend,
            &IndexFindRequest {
                mode: FindMode::Any,
                tags: vec!["x".to_string(), "y".to_string()],
            },
        )
        .await
        .unwrap();
        assert!(any.is_empty());
    }

    #[tokio::test]
    async fn retagging_moves_the_key() {
        let backend = MemoryBackend::new();
        let key = ObjectId::transform(b"moved");

        set_indexes(
            &backend,
            &IndexSetRequest { key, entries: entries(&[("old", "op")]) },
        )
        .await
        .unwrap();
        set_indexes(
            &backend,
            &IndexSetRequest { key, entries: entries(&[("new", "np")]) },
        )
        .await
        .unwrap();

        let old = find_indexes(
            &backend,
            &IndexFindRequest { mode: FindMode::Any, tags: vec!["old".to_string()] },
        )
        .await
        .unwrap();
        assert!(old.is_empty());

        let new = find_indexes(
            &backend,
            &IndexFindRequest { mode: FindMode::Any, tags: vec!["new".to_string()] },
        )
        .await
        .unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].entries[0].payload, b"np".to_vec());
    }

    #[test]
    fn payloads_survive_json_round_trip() {
        let request = IndexSetRequest {
            key: ObjectId::transform(b"serde"),
            entries: vec![TagPayload {
                tag: "binary".to_string(),
                payload: vec![0, 1, 2, 255],
            }],
        };
        let raw = serde_json::to_vec(&request).unwrap();
        let back: IndexSetRequest = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back.key, request.key);
        assert_eq!(back.entries, request.entries);
    }
}
