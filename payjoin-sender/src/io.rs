//! One round trip with the receiver over HTTP.
//!
//! The request is sent exactly once. A payjoin request is not idempotent, so a failed or timed
//! out exchange is never retried here.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::Client;

use crate::into_url::IntoUrl;
use crate::proposal::Proposal;
use crate::send::{InternalMalformedResponse, NegotiationError, OriginalProposal};
use crate::{Request, MAX_CONTENT_LENGTH};

/// POST `original` to `endpoint` and decode the counter-proposal, waiting at most `timeout`.
pub async fn negotiate(
    original: &OriginalProposal,
    endpoint: impl IntoUrl,
    timeout: Duration,
) -> Result<Proposal, NegotiationError> {
    let client =
        Client::builder().build().map_err(|e| NegotiationError::EndpointUnreachable(e.into()))?;
    negotiate_with_client(&client, original, endpoint, timeout).await
}

/// Like [`negotiate`] with a caller supplied client, e.g. one routed through a proxy.
pub async fn negotiate_with_client(
    client: &Client,
    original: &OriginalProposal,
    endpoint: impl IntoUrl,
    timeout: Duration,
) -> Result<Proposal, NegotiationError> {
    let request = original
        .extract_request(endpoint)
        .map_err(|e| NegotiationError::EndpointUnreachable(e.into()))?;
    tracing::info!(url = %request.url, "sending original proposal");

    let (status, body) = match post(client, request, timeout).await {
        Ok(reply) => reply,
        Err(e) if e.is_timeout() => {
            tracing::warn!(?timeout, "receiver timed out");
            return Err(NegotiationError::Timeout(timeout));
        }
        Err(e) => return Err(NegotiationError::EndpointUnreachable(e.into())),
    };
    let Some(body) = body else {
        tracing::warn!(status, "receiver response too large");
        return Err(InternalMalformedResponse::ContentTooLarge.into());
    };
    tracing::debug!(status, len = body.len(), "received receiver response");
    original.process_response(status, &body)
}

/// Status and body of the reply, or no body if it exceeds [`MAX_CONTENT_LENGTH`].
async fn post(
    client: &Client,
    request: Request,
    timeout: Duration,
) -> Result<(u16, Option<Vec<u8>>), reqwest::Error> {
    let mut response = client
        .post(request.url)
        .header(CONTENT_TYPE, request.content_type)
        .body(request.body)
        .timeout(timeout)
        .send()
        .await?;
    let status = response.status().as_u16();
    if response.content_length().is_some_and(|len| len > MAX_CONTENT_LENGTH as u64) {
        return Ok((status, None));
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        body.extend_from_slice(&chunk);
        if body.len() > MAX_CONTENT_LENGTH {
            return Ok((status, None));
        }
    }
    Ok((status, Some(body)))
}
