//! Opaque keyset cursors

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::item::ItemId;

/// Position after the last row of a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub updated_at: DateTime<Utc>,
    pub id: ItemId,
}

impl Cursor {
    pub fn new(updated_at: DateTime<Utc>, id: ItemId) -> Self {
        Self { updated_at, id }
    }

    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(general_purpose::URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let invalid = || VaultError::validation(format!("Invalid cursor: {:?}", token));
        let bytes = general_purpose::URL_SAFE_NO_PAD
            .decode(token.trim_end_matches('='))
            .map_err(|_| invalid())?;
        serde_json::from_slice(&bytes).map_err(|_| invalid())
    }

    pub(crate) fn key(&self) -> (DateTime<Utc>, ItemId) {
        (self.updated_at, self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_is_url_safe() {
        let cursor = Cursor::new(Utc::now(), ItemId::parse("01HXABC").unwrap());
        let token = cursor.encode().unwrap();
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(Cursor::decode(&token).unwrap(), cursor);
    }

    #[test]
    fn test_garbage_cursor_is_validation_error() {
        for token in ["", "not base64!", "e30"] {
            assert!(matches!(Cursor::decode(token), Err(VaultError::Validation(_))));
        }
    }
}
