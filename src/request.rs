//! Body and path extractors whose rejections are reported as [`ApiError`]
//! JSON instead of axum's plain-text responses.

use axum::{
    async_trait,
    body::Bytes,
    extract::{
        rejection::{JsonRejection, PathRejection},
        FromRequest, FromRequestParts, Path, Request,
    },
    http::request::Parts,
    Json,
};
use serde::de::DeserializeOwned;

use crate::error::ApiError;

/// `Json<T>` with bad-input rejections mapped to 400.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

/// `Path<T>` with parse failures mapped to 400.
#[derive(Debug)]
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(ApiPath(value))
    }
}

/// A JSON body that may be left out entirely. An empty body is `None`; a
/// body that is present must parse.
pub fn optional_json<T: DeserializeOwned>(body: &Bytes) -> Result<Option<T>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Body {
        count: u32,
    }

    #[test]
    fn test_optional_json_empty_body() {
        assert_eq!(optional_json::<Body>(&Bytes::new()).unwrap(), None);
        assert_eq!(optional_json::<Body>(&Bytes::from_static(b" \n")).unwrap(), None);
    }

    #[test]
    fn test_optional_json_parses_present_body() {
        let body = Bytes::from_static(br#"{"count": 3}"#);

        assert_eq!(optional_json::<Body>(&body).unwrap(), Some(Body { count: 3 }));
    }

    #[test]
    fn test_optional_json_rejects_bad_body() {
        let err = optional_json::<Body>(&Bytes::from_static(br#"{"count": "three"}"#)).unwrap_err();

        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
