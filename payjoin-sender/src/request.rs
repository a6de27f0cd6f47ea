use url::Url;

pub const REQ_CONTENT_TYPE: &str = "application/json";

/// Represents data that needs to be transmitted to the receiver.
/// Ensure the `Content-Length` is set to the length of `body`. (most libraries do this automatically)
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Request {
    /// URL to send the request to.
    ///
    /// This is full URL with scheme etc - you can pass it right to `reqwest` or a similar library.
    pub url: Url,

    /// The `Content-Type` header to use for the request.
    pub content_type: &'static str,

    /// Bytes to be sent to the receiver.
    ///
    /// A JSON object carrying the base64 encoded original proposal.
    pub body: Vec<u8>,
}

impl Request {
    pub(crate) fn new_json(url: &Url, body: Vec<u8>) -> Self {
        Self { url: url.clone(), content_type: REQ_CONTENT_TYPE, body }
    }
}
