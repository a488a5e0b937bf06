//! Wire types shared by every dashboard endpoint.

use serde::{Deserialize, Serialize};

use super::ApiError;

/// Standard response wrapper: `{ success, code, message, data }`.
///
/// `data` is optional because failed responses commonly carry `null` or omit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    /// A missing field reads as `None`.
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// Unwrap the payload, turning a server-reported failure into an error.
    pub fn into_data(self) -> Result<T, ApiError> {
        if !self.success {
            return Err(ApiError::Rejected {
                code: self.code,
                message: self.message,
            });
        }
        self.data
            .ok_or_else(|| ApiError::InvalidResponse("Response envelope has no data".to_string()))
    }
}

/// Token pair minted by `/auth/refresh` and the QR login exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[derive(Debug, Serialize)]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_refresh_envelope() {
        let json = r#"{"success":true,"code":0,"message":"ok","data":{"access_token":"A2","refresh_token":"R2","token_type":"Bearer"}}"#;
        let envelope: ApiEnvelope<TokenPair> =
            serde_json::from_str(json).expect("Failed to parse refresh envelope");
        let tokens = envelope.into_data().expect("envelope should carry data");
        assert_eq!(tokens.access_token, "A2");
        assert_eq!(tokens.refresh_token, "R2");
    }

    #[test]
    fn test_token_type_defaults_to_bearer() {
        let tokens: TokenPair =
            serde_json::from_str(r#"{"access_token":"A","refresh_token":"R"}"#).unwrap();
        assert_eq!(tokens.token_type, "Bearer");
    }

    #[test]
    fn test_failed_envelope_is_rejected() {
        let json = r#"{"success":false,"code":40101,"message":"refresh token revoked","data":null}"#;
        let envelope: ApiEnvelope<TokenPair> = serde_json::from_str(json).unwrap();
        match envelope.into_data() {
            Err(ApiError::Rejected { code, message }) => {
                assert_eq!(code, 40101);
                assert_eq!(message, "refresh token revoked");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_successful_envelope_without_data() {
        let envelope: ApiEnvelope<TokenPair> =
            serde_json::from_str(r#"{"success":true,"code":0,"message":""}"#).unwrap();
        assert!(matches!(
            envelope.into_data(),
            Err(ApiError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_rejection_without_data_field() {
        // TokenPair has no Default impl; a missing `data` must still parse
        let json = r#"{"success":false,"code":40001,"message":"bad request"}"#;
        let envelope: ApiEnvelope<TokenPair> =
            serde_json::from_str(json).expect("Failed to parse envelope without data");
        assert!(envelope.data.is_none());
        assert!(matches!(
            envelope.into_data(),
            Err(ApiError::Rejected { code: 40001, .. })
        ));
    }
}
