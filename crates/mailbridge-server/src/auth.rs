//! Access-token handling. Tokens are signed JWTs carrying the user id;
//! both signature and expiry are checked before a claim is trusted.

use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Claims {
    pub id: String,
    #[allow(dead_code)]
    pub exp: usize,
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .context("invalid access token")?;
    Ok(data.claims)
}

/// Pulls one value out of a Cookie header line.
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        id: String,
        exp: usize,
    }

    fn token(id: &str, exp: usize, secret: &str) -> String {
        encode(
            &Header::default(),
            &TestClaims {
                id: id.to_string(),
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_the_user_id() {
        let tok = token("u1", 4102444800, "secret");
        assert_eq!(verify_token(&tok, "secret").unwrap().id, "u1");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let tok = token("u1", 4102444800, "secret");
        assert!(verify_token(&tok, "other").is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let tok = token("u1", 1000, "secret");
        assert!(verify_token(&tok, "secret").is_err());
    }

    #[test]
    fn cookie_parsing_finds_the_named_value() {
        let header = "theme=dark; accessToken=abc.def.ghi; lang=en";
        assert_eq!(cookie_value(header, "accessToken"), Some("abc.def.ghi"));
        assert_eq!(cookie_value(header, "missing"), None);
    }
}
