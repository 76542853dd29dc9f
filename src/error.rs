use snafu::{Location, Snafu};

use crate::store::StoreError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ApplicationError {
    /// could not parse the configuration from the environment
    #[snafu(display("invalid {group} configuration: {source}"))]
    ConfigLoad {
        group: &'static str,
        source: envy::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("song and talent updates share the hours {hours:?}"))]
    OverlappingSlots {
        hours: Vec<u32>,
        #[snafu(implicit)]
        location: Location,
    },

    ConnectDatabase {
        source: StoreError,
        #[snafu(implicit)]
        location: Location,
    },

    /// Could not initialize the logger
    InitializeLogger {
        source: tracing::subscriber::SetGlobalDefaultError,
        #[snafu(implicit)]
        location: Location,
    },

    /// Could not build an http client
    HttpClient {
        source: reqwest::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{url} is not a valid url: {source}"))]
    InvalidUrl {
        url: String,
        source: url::ParseError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("invalid VAPID key: {message}"))]
    VapidKey {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    /// Could not listen for the shutdown signal
    WaitForSignal {
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    /// The scheduler loop panicked
    SchedulerStopped {
        source: tokio::task::JoinError,
        #[snafu(implicit)]
        location: Location,
    },
}
