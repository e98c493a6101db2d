use std::fmt;

use serde::Deserialize;

fn default_port() -> u16 {
    22
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthKind {
    Password,
    PrivateKey,
}

/// Credential material for one SSH login. Never serialized back out.
#[derive(Clone, Deserialize)]
pub struct AuthMethod {
    #[serde(rename = "type")]
    pub kind: AuthKind,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMethod")
            .field("kind", &self.kind)
            .field("value", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// How to reach and log into one machine. Supplied per request.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    #[serde(default)]
    pub sudo_password: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .field("sudo_password", &self.sudo_password.as_ref().map(|_| "<redacted>"))
            .field("alias", &self.alias)
            .finish()
    }
}

impl ConnectionDescriptor {
    pub fn password(host: &str, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port: default_port(),
            username: username.to_string(),
            auth: AuthMethod {
                kind: AuthKind::Password,
                value: password.to_string(),
                passphrase: None,
            },
            sudo_password: None,
            alias: None,
        }
    }

    pub fn private_key(host: &str, username: &str, pem: &str, passphrase: Option<&str>) -> Self {
        Self {
            host: host.to_string(),
            port: default_port(),
            username: username.to_string(),
            auth: AuthMethod {
                kind: AuthKind::PrivateKey,
                value: pem.to_string(),
                passphrase: passphrase.map(str::to_string),
            },
            sudo_password: None,
            alias: None,
        }
    }

    /// Rejects descriptors that cannot possibly authenticate.
    pub fn validate(&self) -> Result<(), String> {
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("host");
        }
        if self.username.trim().is_empty() {
            missing.push("username");
        }
        if self.auth.value.trim().is_empty() {
            missing.push("auth.value");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required fields: {}", missing.join(", ")))
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn display_name(&self) -> &str {
        match self.alias.as_deref() {
            Some(a) if !a.trim().is_empty() => a,
            _ => &self.host,
        }
    }

    /// Non-root logins run elevated commands through sudo.
    pub fn needs_elevation(&self) -> bool {
        self.username != "root"
    }

    /// Secret fed to `sudo -S`: the explicit elevation password, else the
    /// login password when password auth is used.
    pub fn elevation_secret(&self) -> Option<&str> {
        if let Some(pw) = self.sudo_password.as_deref() {
            if !pw.is_empty() {
                return Some(pw);
            }
        }
        match self.auth.kind {
            AuthKind::Password if !self.auth.value.is_empty() => Some(&self.auth.value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_defaults_port() {
        let c: ConnectionDescriptor = serde_json::from_value(serde_json::json!({
            "host": "10.0.0.5",
            "username": "ops",
            "auth": {"type": "privateKey", "value": "-----BEGIN KEY-----", "passphrase": "pp"},
            "sudoPassword": "s3cret"
        }))
        .unwrap();
        assert_eq!(c.port, 22);
        assert_eq!(c.auth.kind, AuthKind::PrivateKey);
        assert_eq!(c.elevation_secret(), Some("s3cret"));
        assert_eq!(c.endpoint(), "10.0.0.5:22");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut c = ConnectionDescriptor::password("h1", "ops", "hunter2");
        c.sudo_password = Some("topsecret".into());
        let rendered = format!("{c:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("topsecret"));
        assert!(rendered.contains("h1"));
    }

    #[test]
    fn test_elevation_rules() {
        let root = ConnectionDescriptor::password("h", "root", "pw");
        assert!(!root.needs_elevation());

        let ops = ConnectionDescriptor::password("h", "ops", "pw");
        assert!(ops.needs_elevation());
        assert_eq!(ops.elevation_secret(), Some("pw"));

        let key = ConnectionDescriptor::private_key("h", "ops", "pem", None);
        assert_eq!(key.elevation_secret(), None);
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        let mut c = ConnectionDescriptor::password("", "ops", "");
        let err = c.validate().unwrap_err();
        assert!(err.contains("host"));
        assert!(err.contains("auth.value"));

        c.host = "h".into();
        c.auth.value = "pw".into();
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_display_name_prefers_alias() {
        let mut c = ConnectionDescriptor::password("10.1.1.1", "root", "pw");
        assert_eq!(c.display_name(), "10.1.1.1");
        c.alias = Some("gpu-07".into());
        assert_eq!(c.display_name(), "gpu-07");
    }
}
