//! Definition of DeviceError used by the device, mount and filesystem collaborators.
use nix::errno::Errno;
use std::string::FromUtf8Error;

/// A device, mount or filesystem tool error.
pub struct DeviceError {
    pub(crate) message: String,
    pub(crate) source: DeviceErrorSource,
}

/// Possible device error kind sources.
pub(crate) enum DeviceErrorSource {
    None,
    StdIoError(std::io::Error),
    StdIntParseError(std::num::ParseIntError),
    Errno(Errno),
    UuidError(uuid::Error),
    FromUtf8Error(FromUtf8Error),
    GenericError(anyhow::Error),
}

impl DeviceError {
    /// Return a new `Self` with the given message.
    pub fn new(message: &str) -> DeviceError {
        DeviceError {
            message: String::from(message),
            source: DeviceErrorSource::None,
        }
    }
    /// Prefix the error message with some context, keeping the source.
    pub fn context(mut self, context: &str) -> DeviceError {
        self.message = format!("{context}: {}", self.message);
        self
    }
    /// Whether the error was caused by a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        match &self.source {
            DeviceErrorSource::StdIoError(error) => error.kind() == std::io::ErrorKind::NotFound,
            DeviceErrorSource::Errno(errno) => *errno == Errno::ENOENT,
            _ => false,
        }
    }
}

impl std::fmt::Debug for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.source {
            DeviceErrorSource::None => None,
            DeviceErrorSource::StdIoError(error) => Some(error),
            DeviceErrorSource::StdIntParseError(error) => Some(error),
            DeviceErrorSource::Errno(errno) => Some(errno),
            DeviceErrorSource::UuidError(error) => Some(error),
            DeviceErrorSource::FromUtf8Error(error) => Some(error),
            DeviceErrorSource::GenericError(error) => Some(error.as_ref()),
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(error: std::io::Error) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
            source: DeviceErrorSource::StdIoError(error),
        }
    }
}

impl From<std::num::ParseIntError> for DeviceError {
    fn from(error: std::num::ParseIntError) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
            source: DeviceErrorSource::StdIntParseError(error),
        }
    }
}

impl From<Errno> for DeviceError {
    fn from(errno: Errno) -> DeviceError {
        DeviceError {
            message: format!("{errno}"),
            source: DeviceErrorSource::Errno(errno),
        }
    }
}

impl From<uuid::Error> for DeviceError {
    fn from(error: uuid::Error) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
            source: DeviceErrorSource::UuidError(error),
        }
    }
}

impl From<String> for DeviceError {
    fn from(message: String) -> DeviceError {
        DeviceError {
            message,
            source: DeviceErrorSource::None,
        }
    }
}

impl From<FromUtf8Error> for DeviceError {
    fn from(error: FromUtf8Error) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
            source: DeviceErrorSource::FromUtf8Error(error),
        }
    }
}

impl From<tokio::task::JoinError> for DeviceError {
    fn from(error: tokio::task::JoinError) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
            source: DeviceErrorSource::GenericError(error.into()),
        }
    }
}

impl From<anyhow::Error> for DeviceError {
    fn from(error: anyhow::Error) -> DeviceError {
        DeviceError {
            message: error.to_string(),
            source: DeviceErrorSource::GenericError(error),
        }
    }
}

impl From<DeviceError> for tonic::Status {
    fn from(dev_error: DeviceError) -> Self {
        match dev_error.source {
            DeviceErrorSource::StdIoError(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tonic::Status::not_found(dev_error.message)
            }
            _ => tonic::Status::internal(dev_error.message),
        }
    }
}
