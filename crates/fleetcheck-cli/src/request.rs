use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::args::ConnectionArgs;

/// Connection descriptor as the orchestrator expects it.
pub fn build_connection(conn: &ConnectionArgs) -> Result<Value> {
    let auth = match (&conn.password, &conn.key_file) {
        (Some(pw), None) => json!({"type": "password", "value": pw}),
        (None, Some(path)) => {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("read key file {}", path.display()))?;
            json!({"type": "privateKey", "value": pem, "passphrase": conn.passphrase})
        }
        _ => bail!("exactly one of --password or --key-file is required"),
    };
    Ok(json!({
        "host": conn.host,
        "port": conn.port,
        "username": conn.user,
        "auth": auth,
        "sudoPassword": conn.sudo_password,
        "alias": conn.alias,
    }))
}

/// A JSON array of connection descriptors.
pub fn load_nodes(path: &Path) -> Result<Vec<Value>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read nodes file {}", path.display()))?;
    let nodes: Vec<Value> = serde_json::from_str(&raw)
        .with_context(|| format!("parse nodes file {}", path.display()))?;
    if nodes.is_empty() {
        bail!("nodes file {} lists no nodes", path.display());
    }
    Ok(nodes)
}
