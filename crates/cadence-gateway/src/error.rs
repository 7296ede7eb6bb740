use cadence_ws::ConnectError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),
    #[error("gateway closed with fatal code {code}")]
    FatalClose { code: u16 },
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectsExhausted { attempts: u32 },
    #[error("gateway connection is closed")]
    Closed,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
