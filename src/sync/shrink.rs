//! `shrinkRawData`: in-place payload reduction that truncates the
//! largest raw-data field of the largest entity in a batch, repeatedly,
//! until the batch's serialized size is back under the cap.

use serde_json::Value;

/// 6 MB minus a 16 KB header reserve (§6 "Size limits").
pub const UPLOAD_SIZE_MAX: usize = 6_275_072;

const TRUNCATED: &str = "TRUNCATED";

#[derive(Debug, Clone, Copy)]
pub struct ShrinkResult {
    pub initial_size: usize,
    pub total_size: usize,
    pub items_removed: usize,
}

fn byte_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

/// Reduces `batch`'s JSON-serialized size below `max_size` by truncating
/// large raw-data fields in place. `batch` is expected to be a JSON array
/// of entities (each optionally carrying `_rawData`).
///
/// Returns an error if the largest entity in the batch has no `_rawData`
/// left to truncate and the batch is still oversized.
pub fn shrink_raw_data(batch: &mut Value, max_size: usize) -> Result<ShrinkResult, String> {
    let initial_size = byte_len(batch);
    let mut total_size = initial_size;
    let mut items_removed = 0usize;

    while total_size > max_size {
        let entities = batch
            .as_array_mut()
            .ok_or_else(|| "cannot shrink: batch is not an array".to_string())?;

        let Some((entity_idx, _)) = entities
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| byte_len(e))
        else {
            return Err("cannot shrink: batch is empty".to_string());
        };

        let entity = &mut entities[entity_idx];
        let Some(raw_data) = entity.get_mut("_rawData").and_then(Value::as_array_mut) else {
            return Err("cannot shrink: largest entity has no _rawData".to_string());
        };
        if raw_data.is_empty() {
            return Err("cannot shrink: largest entity has no _rawData".to_string());
        }

        let Some((entry_idx, _)) = raw_data.iter().enumerate().max_by_key(|(_, e)| byte_len(e))
        else {
            return Err("cannot shrink: largest entity has no _rawData".to_string());
        };

        let entry = &mut raw_data[entry_idx];
        let Some(fields) = entry.get_mut("rawData").and_then(Value::as_object_mut) else {
            return Err("cannot shrink: raw data entry has no rawData map".to_string());
        };
        if fields.is_empty() {
            return Err("cannot shrink: raw data entry has no rawData map".to_string());
        }

        let largest_key = fields
            .iter()
            .max_by_key(|(_, v)| byte_len(v))
            .map(|(k, _)| k.clone())
            .expect("checked non-empty above");

        let old_field_size = byte_len(&fields[&largest_key]);
        let replacement = Value::String(TRUNCATED.to_string());
        let new_field_size = byte_len(&replacement);
        fields.insert(largest_key, replacement);

        total_size = total_size - old_field_size + new_field_size;
        items_removed += 1;
    }

    Ok(ShrinkResult {
        initial_size,
        total_size,
        items_removed,
    })
}
