use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Failed to (de)serialize message data"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Invalid message payload: {message}"))]
    InvalidPayload { message: String },

    #[snafu(display("Invalid downstream parcel: {message}"))]
    ParcelParse { message: String },

    #[snafu(display("Post office is no longer running"))]
    PostOfficeClosed,
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::PostOfficeClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::PostOfficeClosed
    }
}

impl Error {
    pub fn parcel_parse(message: impl Into<String>) -> Self {
        Self::ParcelParse {
            message: message.into(),
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }
}
