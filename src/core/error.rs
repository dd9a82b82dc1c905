use thiserror::Error;

/// Core error types for drnet
///
/// Every variant except `Io`, `Serialization` and `Transport` is raised while
/// building or resolving the network graph. Any of them aborts the run before a
/// script is emitted.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A port outside `0..=65535`
    #[error("Invalid port {port}: must be between 0 and 65535")]
    InvalidPort { port: i64 },

    /// An address, subnet or netmask that does not parse
    #[error("Invalid IP address '{value}' on machine {machine}")]
    InvalidIpAddress { machine: String, value: String },

    #[error("Invalid email address '{value}' on machine {machine}")]
    InvalidEmail { machine: String, value: String },

    #[error("Invalid MAC address '{value}' on machine {machine}")]
    InvalidMac { machine: String, value: String },

    /// The same interface name declared twice on one machine
    #[error("Machine {machine} declares interface '{iface}' more than once")]
    DuplicateInterface { machine: String, iface: String },

    #[error("Machine {machine} lists admin '{admin}' more than once")]
    DuplicateAdmin { machine: String, admin: String },

    /// A machine type string that is not one of the known classifications
    #[error("Machine {machine} has unknown type '{value}'")]
    InvalidMachineType { machine: String, value: String },

    /// A traffic rule was built without choosing its table
    #[error("Traffic rule from '{source_label}' has no table")]
    MissingTable { source_label: String },

    /// A label that does not name any machine in the network
    #[error("Unknown machine '{label}'")]
    UnknownMachine { label: String },

    #[error("Machine {machine} uses unknown profile '{profile}'")]
    UnknownProfile { machine: String, profile: String },

    /// A service whose hypervisor is missing or is not a hypervisor
    #[error("Service {service} is hosted on '{hypervisor}', which is not a hypervisor")]
    InvalidHypervisor { service: String, hypervisor: String },

    /// Two units on one machine normalize to the same label
    #[error("Machine {machine} has more than one unit labelled '{label}'")]
    DuplicateUnit { machine: String, label: String },

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Dispatching a rendered script failed
    #[error("Transport error for {machine}: {message}")]
    Transport {
        machine: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for [`Error::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for errors caused by the network description itself,
    /// as opposed to the local environment.
    pub fn is_data_error(&self) -> bool {
        !matches!(
            self,
            Self::Io(_) | Self::Serialization(_) | Self::Transport { .. } | Self::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
