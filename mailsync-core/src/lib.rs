mod client;

pub use client::{
    ApiErrorClass, IngestClient, IngestError, IngestProgress, IngestStats, IngestStatus,
    RemoteSessionId, StartRequest, StartResponse, StopResponse,
};
