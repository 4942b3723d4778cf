//! Error messages returned by this library

use url::Url;

/// Error messages returned by this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Object was not found
    #[error("Object was not found")]
    NotFound,
    /// Request limit was reached during fetch
    #[error("Request limit was reached during fetch")]
    RequestLimit,
    /// Response body limit was reached during fetch
    #[error("Response body limit was reached during fetch")]
    ResponseBodyLimit,
    /// The URL scheme is neither `http` nor `https`
    #[error("URL scheme is not http(s): {0}")]
    NonHttpUrl(Url),
    /// The URL points at a private or otherwise forbidden address
    #[error("URL failed verification: {0}")]
    UrlVerification(&'static str),
    /// Url parsing failed
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
    /// Too many redirects were followed during a fetch
    #[error("Too many redirects while fetching {0}")]
    TooManyRedirects(Url),
    /// The response carried a content type the caller cannot use
    #[error("Unexpected content type: {0}")]
    BadContentType(String),
    /// A remote fetch failed
    #[error("Failed to fetch {url}: {source}")]
    Fetch {
        /// The URL whose fetch failed
        url: Url,
        /// Underlying transport error
        source: anyhow::Error,
    },
    /// Incoming request has an invalid digest for its body
    #[error("Incoming request has an invalid digest for its body")]
    BodyDigestInvalid,
    /// Incoming request has a missing or invalid signature
    #[error("Incoming request has a missing or invalid signature")]
    SignatureInvalid,
    /// A signature or key uses an algorithm outside the supported set
    #[error("Unsupported key or signature algorithm")]
    UnsupportedAlgorithm,
    /// A key was supplied in an encoding that could not be parsed
    #[error("Invalid key encoding")]
    InvalidKeyEncoding,
    /// A key is not valid for the requested use (signing without a private half, etc.)
    #[error("Key is not valid for this use: {0}")]
    InvalidKeyUse(&'static str),
    /// A dispatcher or route was registered twice under the same name
    #[error("Duplicate registration: {0}")]
    DuplicateRegistration(String),
    /// The federation builder is missing a required option
    #[error("Missing required builder option: {0}")]
    MissingOption(&'static str),
    /// Failed to resolve an identifier via webfinger
    #[error("Failed to resolve identifier via webfinger")]
    WebfingerResolveFailed,
    /// Activity delivery failed permanently and will not be retried
    #[error("Delivery to {0} failed permanently: {1}")]
    PermanentDelivery(Url, String),
    /// The operation was cancelled before it completed
    #[error("Operation was cancelled")]
    Cancelled,
    /// Json deserialization failed
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Response text was not valid utf-8
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    /// other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn other<T>(error: T) -> Self
    where
        T: Into<anyhow::Error>,
    {
        Error::Other(error.into())
    }

    pub(crate) fn fetch<T>(url: &Url, error: T) -> Self
    where
        T: Into<anyhow::Error>,
    {
        Error::Fetch {
            url: url.clone(),
            source: error.into(),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
