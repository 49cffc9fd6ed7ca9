use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to dial {host}:{port}: {source}")]
    Dial {
        host: String,
        port: u16,
        #[source]
        source: mail_send::Error,
    },
    #[error("connection pool shut down while waiting for a session")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Smtp(#[from] mail_send::Error),
}

#[derive(Debug, Error)]
pub enum OffsetError {
    #[error("failed to read offset file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write offset file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid dispatch configuration: {0}")]
    InvalidConfig(String),
    #[error("connection pool exhausted: first {attempts} dial attempts all failed")]
    PoolExhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job store error: {0}")]
    Store(#[from] sled::Error),
    #[error("failed to (de)serialize job record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid cron expression {expr:?}: {source}")]
    InvalidCron {
        expr: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("job {0} not found")]
    NotFound(uuid::Uuid),
}
