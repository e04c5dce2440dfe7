//! Record validation: a job's `records` array is opaque to the core except
//! for the two correlation fields every record must carry.

use serde_json::Value;

/// One input record as received in a job's `records` array, with its
/// correlation fields lifted out and the whole record kept as the request
/// body.
#[derive(Debug, Clone)]
pub struct InputRecord {
    pub member_id: String,
    pub request_id: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("job has no records")]
    Empty,
    #[error("records at indices {0:?} are missing memberId or requestId")]
    MissingFields(Vec<usize>),
}

/// Validates a job's raw record list and extracts the correlation fields.
/// Fails on an empty list, or lists the indices missing `memberId`/
/// `requestId`.
pub fn validate_records(raw: &[Value]) -> Result<Vec<InputRecord>, ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::Empty);
    }

    let mut offending = Vec::new();
    let mut records = Vec::with_capacity(raw.len());

    for (index, value) in raw.iter().enumerate() {
        let member_id = value.get("memberId").and_then(Value::as_str);
        let request_id = value.get("requestId").and_then(Value::as_str);
        match (member_id, request_id) {
            (Some(member_id), Some(request_id))
                if !member_id.is_empty() && !request_id.is_empty() =>
            {
                records.push(InputRecord {
                    member_id: member_id.to_string(),
                    request_id: request_id.to_string(),
                    body: serde_json::to_vec(value).unwrap_or_default(),
                });
            }
            _ => offending.push(index),
        }
    }

    if !offending.is_empty() {
        return Err(ValidationError::MissingFields(offending));
    }

    Ok(records)
}
