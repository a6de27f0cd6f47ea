use url::{ParseError, Url};

/// A receiver endpoint that cannot be used.
#[derive(Debug)]
pub enum Error {
    /// Anything but `http` and `https`
    UnsupportedScheme(String),
    MissingHost,
    Parse(ParseError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnsupportedScheme(scheme) => write!(f, "unsupported endpoint scheme `{scheme}`"),
            Error::MissingHost => write!(f, "endpoint has no host"),
            Error::Parse(e) => write!(f, "invalid endpoint: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Error { Error::Parse(err) }
}

/// Anything that can name a payjoin endpoint.
///
/// Sealed: implemented for [`Url`] and strings only.
pub trait IntoUrl: private::Sealed {}

impl IntoUrl for Url {}
impl IntoUrl for &Url {}
impl IntoUrl for &str {}
impl IntoUrl for String {}
impl IntoUrl for &String {}

pub(crate) mod private {
    use super::{Error, Url};

    pub trait Sealed {
        fn into_url(self) -> Result<Url, Error>;
    }

    impl Sealed for Url {
        fn into_url(self) -> Result<Url, Error> {
            match self.scheme() {
                "http" | "https" if self.has_host() => Ok(self),
                "http" | "https" => Err(Error::MissingHost),
                other => Err(Error::UnsupportedScheme(other.to_owned())),
            }
        }
    }

    impl Sealed for &Url {
        fn into_url(self) -> Result<Url, Error> { self.clone().into_url() }
    }

    impl Sealed for &str {
        fn into_url(self) -> Result<Url, Error> { Url::parse(self)?.into_url() }
    }

    impl Sealed for String {
        fn into_url(self) -> Result<Url, Error> { self.as_str().into_url() }
    }

    impl Sealed for &String {
        fn into_url(self) -> Result<Url, Error> { self.as_str().into_url() }
    }
}
