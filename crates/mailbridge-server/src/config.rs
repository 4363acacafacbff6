//! Server configuration: `mailbridge.toml` with environment overrides.

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub database_path: String,
    pub upstream_url: String,
    pub jwt_secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:3001".to_string(),
            database_path: "mailbridge.db".to_string(),
            upstream_url: "ws://core-app:3000".to_string(),
            jwt_secret: "default-secret-key-for-dev".to_string(),
        }
    }
}

pub fn load() -> ServerConfig {
    let mut config = match std::fs::read_to_string("mailbridge.toml") {
        Ok(content) => parse(&content),
        Err(_) => ServerConfig::default(),
    };
    if let Ok(bind) = std::env::var("MAILBRIDGE_BIND") {
        config.bind = bind;
    }
    if let Ok(path) = std::env::var("MAILBRIDGE_DB") {
        config.database_path = path;
    }
    if let Ok(url) = std::env::var("MAILBRIDGE_UPSTREAM_URL") {
        config.upstream_url = url;
    }
    if let Ok(secret) = std::env::var("MAILBRIDGE_JWT_SECRET") {
        config.jwt_secret = secret;
    }
    config
}

fn parse(content: &str) -> ServerConfig {
    let default = ServerConfig::default();
    let value: toml::Value = match toml::from_str(content) {
        Ok(value) => value,
        Err(_) => return default,
    };
    let server = match value.get("server") {
        Some(server) => server,
        None => return default,
    };
    let field = |key: &str, fallback: &str| {
        server
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or(fallback)
            .to_string()
    };
    ServerConfig {
        bind: field("bind", &default.bind),
        database_path: field("database", &default.database_path),
        upstream_url: field("upstream_url", &default.upstream_url),
        jwt_secret: field("jwt_secret", &default.jwt_secret),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_and_missing_keys_fall_back_to_defaults() {
        let parsed = parse("[server]\nbind = \"127.0.0.1:9000\"\n");
        assert_eq!(parsed.bind, "127.0.0.1:9000");
        assert_eq!(parsed.database_path, "mailbridge.db");
        assert_eq!(parsed.upstream_url, "ws://core-app:3000");
    }

    #[test]
    fn invalid_toml_falls_back_to_defaults() {
        let parsed = parse("not toml at all [");
        assert_eq!(parsed.bind, ServerConfig::default().bind);
    }
}
