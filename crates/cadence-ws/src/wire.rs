//! Opt-in wire tracing. Enabled with `CADENCE_WIRE_TRACE=1`; events go to the
//! `wire` target for the gateway socket and `voice_wire` for voice sockets.

use std::sync::OnceLock;

const PREVIEW_LIMIT_DEFAULT: usize = 512;

static WIRE_TRACE: OnceLock<bool> = OnceLock::new();
static PREVIEW_LIMIT: OnceLock<usize> = OnceLock::new();

pub fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

pub fn wire_trace_enabled() -> bool {
    *WIRE_TRACE.get_or_init(|| {
        std::env::var("CADENCE_WIRE_TRACE")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    })
}

/// Payload truncated at a char boundary. Tokens are masked.
pub fn payload_preview(payload: &str) -> String {
    let limit = *PREVIEW_LIMIT
        .get_or_init(|| env_usize("CADENCE_WIRE_TRACE_PREVIEW", PREVIEW_LIMIT_DEFAULT));
    let masked = mask_token(payload);
    if masked.len() <= limit {
        return masked;
    }
    let mut end = limit;
    while !masked.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &masked[..end])
}

fn mask_token(payload: &str) -> String {
    const KEY: &str = "\"token\":\"";
    let Some(start) = payload.find(KEY) else {
        return payload.to_string();
    };
    let value_start = start + KEY.len();
    let Some(len) = payload[value_start..].find('"') else {
        return payload.to_string();
    };
    format!(
        "{}***{}",
        &payload[..value_start],
        &payload[value_start + len..]
    )
}

/// Which socket a wire event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Gateway,
    Voice,
}

pub fn wire_log_in(channel: Channel, opcode: Option<u8>, payload: &str) {
    if !wire_trace_enabled() {
        return;
    }
    let payload_preview = payload_preview(payload);
    match channel {
        Channel::Gateway => tracing::info!(
            target: "wire",
            direction = "in",
            opcode = ?opcode,
            bytes = payload.len(),
            payload_preview = %payload_preview,
            "client_in"
        ),
        Channel::Voice => tracing::info!(
            target: "voice_wire",
            direction = "in",
            opcode = ?opcode,
            bytes = payload.len(),
            payload_preview = %payload_preview,
            "client_in"
        ),
    }
}

pub fn wire_log_out(channel: Channel, opcode: u8, payload: &str) {
    if !wire_trace_enabled() {
        return;
    }
    let payload_preview = payload_preview(payload);
    match channel {
        Channel::Gateway => tracing::info!(
            target: "wire",
            direction = "out",
            opcode,
            bytes = payload.len(),
            payload_preview = %payload_preview,
            "client_out"
        ),
        Channel::Voice => tracing::info!(
            target: "voice_wire",
            direction = "out",
            opcode,
            bytes = payload.len(),
            payload_preview = %payload_preview,
            "client_out"
        ),
    }
}

pub fn wire_log_close(channel: Channel, code: Option<u16>, reason: &str) {
    if !wire_trace_enabled() {
        return;
    }
    match channel {
        Channel::Gateway => {
            tracing::info!(target: "wire", direction = "in", code = ?code, reason, "close")
        }
        Channel::Voice => {
            tracing::info!(target: "voice_wire", direction = "in", code = ?code, reason, "close")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_masked() {
        let raw = r#"{"op":2,"d":{"token":"secret.value","intents":1}}"#;
        let out = mask_token(raw);
        assert!(!out.contains("secret"));
        assert!(out.contains(r#""token":"***""#));
    }

    #[test]
    fn payload_without_token_is_unchanged() {
        assert_eq!(mask_token(r#"{"op":1,"d":5}"#), r#"{"op":1,"d":5}"#);
    }
}
