//! OCPP-J wire frame encoding/decoding (spec §3).
//!
//! `CALL = [2, msgId, action, payload]`
//! `CALLRESULT = [3, msgId, payload]`
//! `CALLERROR = [4, msgId, errorCode, errorDescription, errorDetails]`

use serde_json::Value;

use crate::error::{RpcError, RpcErrorKind};

/// A decoded OCPP-J frame, or as much of one as could be salvaged from a
/// malformed array for the purpose of echoing `msgId` back to the peer.
#[derive(Debug, Clone)]
pub enum RpcMessage {
    Call {
        msg_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        msg_id: String,
        payload: Value,
    },
    CallError {
        msg_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl RpcMessage {
    pub fn msg_id(&self) -> &str {
        match self {
            RpcMessage::Call { msg_id, .. } => msg_id,
            RpcMessage::CallResult { msg_id, .. } => msg_id,
            RpcMessage::CallError { msg_id, .. } => msg_id,
        }
    }

    pub fn encode(&self) -> String {
        let arr = match self {
            RpcMessage::Call {
                msg_id,
                action,
                payload,
            } => serde_json::json!([2, msg_id, action, payload]),
            RpcMessage::CallResult { msg_id, payload } => {
                serde_json::json!([3, msg_id, payload])
            }
            RpcMessage::CallError {
                msg_id,
                error_code,
                error_description,
                error_details,
            } => serde_json::json!([4, msg_id, error_code, error_description, error_details]),
        };
        arr.to_string()
    }

    pub fn call_error(msg_id: impl Into<String>, err: &RpcError) -> Self {
        RpcMessage::CallError {
            msg_id: msg_id.into(),
            error_code: err.kind.as_wire_str().to_string(),
            error_description: err.description.clone(),
            error_details: err.details.clone(),
        }
    }
}

/// The outcome of attempting to decode a raw frame.
///
/// `Malformed` carries whatever `msg_id` could be recovered (spec: "echo
/// the same msgId when parseable, even when non-string").
pub enum DecodeOutcome {
    Ok(RpcMessage),
    /// Not parseable at all, or structurally invalid in a way that leaves
    /// no recoverable `msgId`. No reply should echo a msgId.
    Unrecoverable { kind: RpcErrorKind, reason: String },
    /// Structurally invalid, but a `msgId` (possibly non-string, serialized
    /// back to a string for the reply) could be recovered.
    Malformed {
        msg_id_echo: String,
        kind: RpcErrorKind,
        reason: String,
    },
}

/// Decode a raw text frame into an [`RpcMessage`] or a decode failure,
/// per spec §4.7 step 1-2.
pub fn decode(raw: &str) -> DecodeOutcome {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            return DecodeOutcome::Unrecoverable {
                kind: RpcErrorKind::FormationViolation,
                reason: format!("invalid JSON: {e}"),
            }
        }
    };

    let arr = match value.as_array() {
        Some(a) => a,
        None => {
            return DecodeOutcome::Unrecoverable {
                kind: RpcErrorKind::FormationViolation,
                reason: "frame is not a JSON array".to_string(),
            }
        }
    };

    if !(3..=5).contains(&arr.len()) {
        return DecodeOutcome::Unrecoverable {
            kind: RpcErrorKind::FormationViolation,
            reason: format!("array length {} outside [3..5]", arr.len()),
        };
    }

    let type_id = match arr[0].as_u64() {
        Some(n) => n,
        None => {
            return DecodeOutcome::Unrecoverable {
                kind: RpcErrorKind::FormationViolation,
                reason: "typeId is not a non-negative integer".to_string(),
            }
        }
    };

    // msgId, for echo purposes, is whatever sits at index 1 — stringified
    // even when it is not itself a JSON string (compatibility quirk).
    let msg_id_echo = match arr.get(1) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => {
            return DecodeOutcome::Unrecoverable {
                kind: RpcErrorKind::FormationViolation,
                reason: "missing msgId".to_string(),
            }
        }
    };

    let msg_id_is_string = matches!(arr.get(1), Some(Value::String(_)));

    match type_id {
        2 => {
            if arr.len() != 4 {
                return DecodeOutcome::Malformed {
                    msg_id_echo,
                    kind: RpcErrorKind::FormationViolation,
                    reason: "CALL requires exactly 4 elements".to_string(),
                };
            }
            if !msg_id_is_string {
                return DecodeOutcome::Malformed {
                    msg_id_echo,
                    kind: RpcErrorKind::FormatViolation,
                    reason: "msgId must be a string".to_string(),
                };
            }
            let action = match arr[2].as_str() {
                Some(a) => a.to_string(),
                None => {
                    return DecodeOutcome::Malformed {
                        msg_id_echo,
                        kind: RpcErrorKind::FormationViolation,
                        reason: "action must be a string".to_string(),
                    }
                }
            };
            if !arr[3].is_object() {
                return DecodeOutcome::Malformed {
                    msg_id_echo,
                    kind: RpcErrorKind::FormationViolation,
                    reason: "payload must be a JSON object".to_string(),
                };
            }
            DecodeOutcome::Ok(RpcMessage::Call {
                msg_id: msg_id_echo,
                action,
                payload: arr[3].clone(),
            })
        }
        3 => {
            if arr.len() != 3 {
                return DecodeOutcome::Malformed {
                    msg_id_echo,
                    kind: RpcErrorKind::FormationViolation,
                    reason: "CALLRESULT requires exactly 3 elements".to_string(),
                };
            }
            if !msg_id_is_string {
                return DecodeOutcome::Malformed {
                    msg_id_echo,
                    kind: RpcErrorKind::FormatViolation,
                    reason: "msgId must be a string".to_string(),
                };
            }
            DecodeOutcome::Ok(RpcMessage::CallResult {
                msg_id: msg_id_echo,
                payload: arr[2].clone(),
            })
        }
        4 => {
            if arr.len() != 5 {
                return DecodeOutcome::Malformed {
                    msg_id_echo,
                    kind: RpcErrorKind::FormationViolation,
                    reason: "CALLERROR requires exactly 5 elements".to_string(),
                };
            }
            if !msg_id_is_string {
                return DecodeOutcome::Malformed {
                    msg_id_echo,
                    kind: RpcErrorKind::FormatViolation,
                    reason: "msgId must be a string".to_string(),
                };
            }
            let error_code = arr[2].as_str().unwrap_or("GenericError").to_string();
            let error_description = arr[3].as_str().unwrap_or_default().to_string();
            DecodeOutcome::Ok(RpcMessage::CallError {
                msg_id: msg_id_echo,
                error_code,
                error_description,
                error_details: arr[4].clone(),
            })
        }
        _ => DecodeOutcome::Malformed {
            msg_id_echo,
            kind: RpcErrorKind::MessageTypeNotSupported,
            reason: format!("unknown typeId {type_id}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_call() {
        let m = RpcMessage::Call {
            msg_id: "m1".into(),
            action: "Heartbeat".into(),
            payload: serde_json::json!({}),
        };
        assert_eq!(m.encode(), r#"[2,"m1","Heartbeat",{}]"#);
    }

    #[test]
    fn decodes_call() {
        let out = decode(r#"[2,"m1","BootNotification",{"chargePointVendor":"V"}]"#);
        match out {
            DecodeOutcome::Ok(RpcMessage::Call {
                msg_id, action, ..
            }) => {
                assert_eq!(msg_id, "m1");
                assert_eq!(action, "BootNotification");
            }
            _ => panic!("expected Call"),
        }
    }

    #[test]
    fn non_string_msg_id_is_malformed_but_echoed() {
        let out = decode(r#"[2,12345,"Heartbeat",{}]"#);
        match out {
            DecodeOutcome::Malformed { msg_id_echo, .. } => assert_eq!(msg_id_echo, "12345"),
            _ => panic!("expected Malformed"),
        }
    }

    #[test]
    fn non_array_is_unrecoverable() {
        let out = decode(r#"{"not":"an array"}"#);
        assert!(matches!(out, DecodeOutcome::Unrecoverable { .. }));
    }

    #[test]
    fn bad_length_is_unrecoverable() {
        let out = decode(r#"[2,"m1"]"#);
        assert!(matches!(out, DecodeOutcome::Unrecoverable { .. }));
    }

    #[test]
    fn unknown_type_id_is_malformed() {
        let out = decode(r#"[9,"m1","x"]"#);
        match out {
            DecodeOutcome::Malformed { kind, .. } => {
                assert!(matches!(kind, RpcErrorKind::MessageTypeNotSupported))
            }
            _ => panic!("expected Malformed"),
        }
    }
}
