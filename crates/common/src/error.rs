use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("missing {0} header")]
    MissingSignature(&'static str),

    #[error("signature is not valid hex")]
    MalformedSignature,

    #[error("signature does not match body")]
    SignatureMismatch,
}

pub type Result<T> = std::result::Result<T, Error>;
