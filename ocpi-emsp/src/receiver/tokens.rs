//! Tokens module
//!
//! - `GET /tokens`: paginated list of this EMSP's tokens
//! - `POST /tokens/{token_uid}/authorize?type=`: real-time authorization
//!
//! Authorization always answers HTTP 200; the decision travels in `allowed`.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderName;
use chrono::{DateTime, SecondsFormat, Utc};
use ocpi_core::{
    AllowedType, AuthorizationInfo, AuthorizationRequest, AuthorizeError, ListFilter, LocationReference,
    Resource, TokenType,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{parse_body, SharedState};
use crate::access::Caller;
use crate::envelope::{OcpiStatus, Reply};
use crate::error::ReceiverError;

pub const TOTAL_COUNT: HeaderName = HeaderName::from_static("x-total-count");
pub const LIMIT: HeaderName = HeaderName::from_static("x-limit");

/// Listing query of `GET /tokens`
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub offset: Option<String>,
    pub limit: Option<String>,
}

fn parse_date(field: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, ReceiverError> {
    value
        .map(|v| {
            v.parse::<DateTime<Utc>>()
                .map_err(|e| ReceiverError::InvalidRequest(format!("invalid {} '{}': {}", field, v, e)))
        })
        .transpose()
}

fn parse_count(field: &str, value: Option<&str>) -> Result<Option<usize>, ReceiverError> {
    value
        .map(|v| {
            v.parse::<usize>()
                .map_err(|_| ReceiverError::InvalidRequest(format!("invalid {} '{}'", field, v)))
        })
        .transpose()
}

impl ListParams {
    /// Resolve against the configured page limits
    pub fn to_filter(&self, default_limit: usize, max_limit: usize) -> Result<ListFilter, ReceiverError> {
        let limit = parse_count("limit", self.limit.as_deref())?.unwrap_or(default_limit);
        Ok(ListFilter {
            date_from: parse_date("date_from", self.date_from.as_deref())?,
            date_to: parse_date("date_to", self.date_to.as_deref())?,
            offset: parse_count("offset", self.offset.as_deref())?.unwrap_or(0),
            limit: Some(limit.max(1).min(max_limit.max(1))),
        })
    }
}

/// Link to the page after `filter`'s
fn next_link(base: &str, filter: &ListFilter, limit: usize) -> String {
    let mut query = Vec::new();
    if let Some(from) = filter.date_from {
        query.push(format!("date_from={}", from.to_rfc3339_opts(SecondsFormat::Secs, true)));
    }
    if let Some(to) = filter.date_to {
        query.push(format!("date_to={}", to.to_rfc3339_opts(SecondsFormat::Secs, true)));
    }
    query.push(format!("offset={}", filter.offset + limit));
    query.push(format!("limit={}", limit));

    format!("<{}?{}>; rel=\"next\"", base, query.join("&"))
}

pub async fn list_tokens(
    State(state): State<SharedState>,
    _caller: Caller,
    Query(params): Query<ListParams>,
) -> Result<Reply, ReceiverError> {
    let config = &state.config;
    let filter = params.to_filter(config.default_page_limit, config.max_page_limit)?;
    let limit = filter.limit.unwrap_or(config.default_page_limit);

    let page = state
        .registry
        .tokens()
        .list_page(&filter, |status| status.key().party == config.party)
        .await;

    let tokens = page
        .items
        .iter()
        .map(|stored| serde_json::to_value(&stored.resource.token))
        .collect::<Result<Vec<Value>, _>>()?;
    let returned = tokens.len();

    let mut reply = Reply::ok()
        .with_data(Value::Array(tokens))
        .with_header(TOTAL_COUNT, page.total.to_string())
        .with_header(LIMIT, limit.to_string());

    if page.offset + returned < page.total {
        reply = reply.with_header(
            axum::http::header::LINK,
            next_link(&config.url("/tokens"), &filter, limit),
        );
    }
    Ok(reply)
}

/// Query of the authorize call
#[derive(Debug, Default, Deserialize)]
pub struct AuthorizeParams {
    #[serde(rename = "type")]
    pub token_type: Option<String>,
}

impl AuthorizeParams {
    pub fn token_type(&self) -> Result<TokenType, ReceiverError> {
        match &self.token_type {
            None => Ok(TokenType::default()),
            Some(t) => serde_json::from_value(Value::String(t.to_ascii_uppercase()))
                .map_err(|_| ReceiverError::InvalidRequest(format!("unknown token type '{}'", t))),
        }
    }
}

pub async fn authorize_token(
    State(state): State<SharedState>,
    caller: Caller,
    Path(token_uid): Path<String>,
    Query(params): Query<AuthorizeParams>,
    body: Bytes,
) -> Result<Reply, ReceiverError> {
    let location: Option<LocationReference> = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(parse_body(&body)?)
    };

    let request = AuthorizationRequest {
        cpo: caller.party,
        token_uid,
        token_type: params.token_type()?,
        location,
    };

    let reply = match state.authorization.authorize(&request).await {
        Ok(info) => Reply::ok().with_data(serde_json::to_value(&info)?),
        Err(err) => {
            debug!("Receiver: Authorization of {} refused: {}", request.token_uid, err);
            let (status, info) = match &err {
                AuthorizeError::UnknownToken(_) => (OcpiStatus::UnknownToken, AuthorizationInfo::not_allowed()),
                AuthorizeError::UnknownLocation(_) | AuthorizeError::UnknownEvse(_) => {
                    (OcpiStatus::UnknownLocation, AuthorizationInfo::not_allowed())
                }
                AuthorizeError::Delegate(_) => (
                    OcpiStatus::ServerError,
                    AuthorizationInfo {
                        info: Some(ocpi_core::authorization::default_message(AllowedType::Blocked)),
                        ..AuthorizationInfo::new(AllowedType::Blocked)
                    },
                ),
            };
            Reply::rejected(status, err.to_string()).with_data(serde_json::to_value(&info)?)
        }
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_params() {
        let params = ListParams {
            date_from: Some("2024-01-01T00:00:00Z".to_string()),
            limit: Some("5000".to_string()),
            ..Default::default()
        };
        let filter = params.to_filter(100, 1000).unwrap();
        assert_eq!(filter.limit, Some(1000));
        assert_eq!(filter.offset, 0);
        assert!(filter.date_from.is_some());

        let bad = ListParams {
            offset: Some("-1".to_string()),
            ..Default::default()
        };
        assert!(matches!(bad.to_filter(100, 1000), Err(ReceiverError::InvalidRequest(_))));
    }

    #[test]
    fn test_zero_page_limits() {
        let params = ListParams {
            limit: Some("0".to_string()),
            ..Default::default()
        };
        assert_eq!(params.to_filter(0, 0).unwrap().limit, Some(1));
        assert_eq!(ListParams::default().to_filter(0, 0).unwrap().limit, Some(1));
    }

    #[test]
    fn test_next_link() {
        let filter = ListFilter {
            date_from: Some("2024-01-01T00:00:00Z".parse().unwrap()),
            date_to: None,
            offset: 10,
            limit: Some(10),
        };
        assert_eq!(
            next_link("http://emsp/ocpi/emsp/2.2/tokens", &filter, 10),
            "<http://emsp/ocpi/emsp/2.2/tokens?date_from=2024-01-01T00:00:00Z&offset=20&limit=10>; rel=\"next\""
        );
    }

    #[test]
    fn test_authorize_params() {
        let params = AuthorizeParams {
            token_type: Some("app_user".to_string()),
        };
        assert_eq!(params.token_type().unwrap(), TokenType::AppUser);
        assert_eq!(AuthorizeParams::default().token_type().unwrap(), TokenType::Rfid);
        assert!(AuthorizeParams {
            token_type: Some("PASSPORT".to_string())
        }
        .token_type()
        .is_err());
    }
}
