#[derive(Debug, thiserror::Error)]
pub enum GenError {
    #[error("{service} request failed: {source}")]
    Http {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("model '{0}' is not available locally")]
    ModelMissing(String),
    #[error("failed to pull model '{model}': {reason}")]
    Pull { model: String, reason: String },
    #[error("No content was generated by the model.")]
    EmptyResponse,
    #[error("unexpected response from {service}: {detail}")]
    Malformed {
        service: &'static str,
        detail: String,
    },
}

pub type Result<T> = std::result::Result<T, GenError>;

impl GenError {
    pub fn http(service: &'static str) -> impl FnOnce(reqwest::Error) -> GenError {
        move |source| GenError::Http { service, source }
    }

    pub fn malformed(service: &'static str, detail: impl ToString) -> GenError {
        GenError::Malformed {
            service,
            detail: detail.to_string(),
        }
    }
}
