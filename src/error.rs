use std::io;

use thiserror::Error;

/// Failure of a single absolute counter read.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CounterError {
    #[error("counter not supported on this unit")]
    Unsupported,
    #[error("transient counter read failure")]
    TransientReadFailure,
}

/// Why an event name could not be turned into a descriptor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no portable event and no model event table loaded")]
    NoEventTable,
    #[error("event not found in table for {cpuid}")]
    NotFound { cpuid: String },
    #[error("malformed event encoding \"{encoding}\": {reason}")]
    Malformed { encoding: String, reason: String },
}

#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("perf event {index} (\"{name}\") unavailable: {reason}")]
    CounterUnavailable {
        index: usize,
        name: String,
        reason: String,
    },
    #[error("perf event {index} read failed: {source}")]
    CounterReadTransient {
        index: usize,
        #[source]
        source: CounterError,
    },
    #[error("domain {domain} spans several units, shared clock domains are not supported")]
    SharedDomainUnsupported { domain: u32 },
    #[error("failed to allocate {what}: {reason}")]
    AllocationFailure { what: &'static str, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("domain {0} is already started")]
    AlreadyStarted(u32),
    #[error("domain {0} is not started")]
    NotStarted(u32),
    #[error("unknown domain {0}")]
    UnknownDomain(u32),
    #[error("unit {0} already has an update hook")]
    HookBusy(u32),
    #[error("frequency driver error on domain {domain}: {reason}")]
    Driver { domain: u32, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type GovernorResult<T> = Result<T, GovernorError>;
